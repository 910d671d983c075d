//! Vantage management server: plugin hosting, lifecycle orchestration, and
//! job scheduling.

pub mod config;
pub mod plugin;

pub use config::{ConfigError, ServerConfig};
pub use plugin::{
    InitializationReport, JobScheduler, LocalScheduler, MasterBuilder, MasterContainer,
    MasterState, SchedulingBridge, TriggerExecutor, TypeContainer,
};
