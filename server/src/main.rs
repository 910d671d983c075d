use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vantage_server::{MasterContainer, ServerConfig};

#[derive(Parser)]
#[command(name = "vantage-server", version, about = "Vantage management server")]
struct Cli {
    /// Path to the server config file (YAML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Run,
    /// Load and validate the configuration, then exit.
    Validate,
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => ServerConfig::from_env().context("loading config from environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Validate => {
            println!("{}", serde_yaml::to_string(&config)?);
            info!("configuration is valid");
            Ok(())
        }
        Command::Run => run(config).await,
    }
}


async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        plugin_dir = %config.plugin_dir.display(),
        data_dir = %config.data_dir.display(),
        "starting vantage server"
    );

    let master = MasterContainer::new(config);
    let report = master.initialize().context("master initialization")?;
    for problem in &report.problems {
        error!(problem = %problem, "plugin subsystem problem");
    }
    info!(
        loaded = report.loaded.len(),
        disabled = report.disabled.len(),
        "plugin subsystem up"
    );

    let triggers = master
        .schedule_all_plugin_jobs()
        .context("registering plugin job schedules")?;
    info!(triggers, "job schedules registered");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    master.shutdown();
    Ok(())
}
