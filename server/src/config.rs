//! Server configuration.
//!
//! Loaded from a YAML file, then overridden by `VANTAGE_*` environment
//! variables. Every field has a default so a bare server starts with no
//! config at all.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vantage_plugin_api::PluginKey;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file [{path}]: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory scanned (non-recursively) for plugin packages.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Durable root for per-plugin data directories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Scratch root: staged packages and the shared plugin temp directory.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Regex gating which host bindings the root capsule exposes to
    /// plugins. Absent means none.
    #[serde(default)]
    pub root_visibility_filter: Option<String>,

    /// Plugins registered but not loaded at startup.
    #[serde(default)]
    pub disabled_plugins: Vec<PluginKey>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            data_dir: default_data_dir(),
            temp_dir: default_temp_dir(),
            root_visibility_filter: None,
            disabled_plugins: Vec::new(),
        }
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("vantage")
}

impl ServerConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// A YAML file plus environment overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ServerConfig = serde_yaml::from_str(&text)?;
        config.apply_env();
        config.validate()?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("VANTAGE_PLUGIN_DIR") {
            self.plugin_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("VANTAGE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("VANTAGE_TEMP_DIR") {
            self.temp_dir = PathBuf::from(dir);
        }
        if let Ok(filter) = std::env::var("VANTAGE_VISIBILITY_FILTER") {
            self.root_visibility_filter = if filter.is_empty() {
                None
            } else {
                Some(filter)
            };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugin_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("plugin_dir is empty".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir is empty".into()));
        }
        if let Some(pattern) = &self.root_visibility_filter {
            regex::Regex::new(pattern).map_err(|regex_error| {
                ConfigError::Invalid(format!(
                    "root_visibility_filter is not a valid regex: {regex_error}"
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_plugin_api::PluginCategory;

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.plugin_dir, PathBuf::from("plugins"));
        assert!(config.disabled_plugins.is_empty());
    }

    #[test]
    fn test_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(
            &path,
            r#"
plugin_dir: /opt/vantage/plugins
root_visibility_filter: "^shared::"
disabled_plugins:
  - category: content
    name: sync
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.plugin_dir, PathBuf::from("/opt/vantage/plugins"));
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(
            config.disabled_plugins,
            vec![PluginKey::new(PluginCategory::Content, "sync")]
        );
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "plugin_dir: [not, a, path\n").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServerConfig::from_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_bad_filter_rejected() {
        let config = ServerConfig {
            root_visibility_filter: Some("(unclosed".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
