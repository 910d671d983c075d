//! Error types for the server plugin container.
//!
//! Each layer has its own error enum: capsule management, the per-category
//! registry, type containers, the master container, and the scheduling
//! bridge. Plugin-raised failures ([`PluginError`]) are wrapped, never
//! swallowed, so the originating plugin stays visible in the chain.

use std::path::PathBuf;

use vantage_plugin_api::{DescriptorError, PluginCategory, PluginError, UnknownCategory};

/// Failures while creating or using capsules.
#[derive(Debug, thiserror::Error)]
pub enum CapsuleError {
    #[error("no package registered for plugin [{0}]")]
    PackageNotFound(String),

    #[error("failed to stage plugin package [{path}]: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin archive [{path}] is unreadable: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("failed to load plugin library [{path}]: {message}")]
    Library { path: PathBuf, message: String },

    #[error("plugin [{plugin}] was built against plugin API {plugin_api}, host speaks {host_api}")]
    ApiVersionMismatch {
        plugin: String,
        plugin_api: String,
        host_api: String,
    },

    #[error("no binding named [{name}] is visible from capsule [{capsule}]")]
    BindingNotFound { capsule: String, name: String },
}

/// Failures while loading a plugin into a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("plugin [{0}] is already loaded")]
    AlreadyLoaded(String),

    #[error(transparent)]
    Capsule(#[from] CapsuleError),

    #[error("listener of plugin [{plugin}] failed: {source}")]
    Listener {
        plugin: String,
        #[source]
        source: PluginError,
    },

    #[error("failed to prepare data directory for plugin [{plugin}]: {source}")]
    DataDir {
        plugin: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures raised by type container operations.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container [{category}] cannot {operation} in state [{state}]")]
    InvalidState {
        category: PluginCategory,
        operation: &'static str,
        state: &'static str,
    },

    #[error("container [{0}] is not initialized")]
    NotInitialized(PluginCategory),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failures raised by master container operations.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("master container cannot {operation} in state [{state}]")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("failed to create staging directory [{path}]: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid root visibility filter: {0}")]
    VisibilityFilter(#[from] regex::Error),

    #[error("no type container could be initialized")]
    NoContainers,

    #[error("no container hosts category [{0}]")]
    UnknownCategory(PluginCategory),

    #[error("unknown plugin [{0}]")]
    UnknownPlugin(String),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Capsule(#[from] CapsuleError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Failures while reading a plugin package from disk.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("cannot read plugin package [{path}]: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin archive [{path}] is unreadable: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("package [{path}] has no descriptor at [{entry}]")]
    MissingDescriptor { path: PathBuf, entry: &'static str },

    #[error("package [{path}] has an invalid descriptor: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },
}

/// Failures registering or unregistering triggers with a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression [{expression}]: {message}")]
    InvalidCron { expression: String, message: String },

    #[error("periodic job [{0}] has a zero interval")]
    ZeroInterval(String),

    #[error("scheduler is shut down")]
    ShutDown,

    #[error("no async runtime is available to drive timers")]
    NoRuntime,
}

/// Failures while executing one triggered job on the server side.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("trigger payload is missing reserved key [{0}]")]
    MalformedPayload(&'static str),

    #[error(transparent)]
    InvalidCategory(#[from] UnknownCategory),

    #[error("no container hosts category [{0}]")]
    UnknownCategory(PluginCategory),

    #[error("container [{0}] is not accepting jobs")]
    ContainerNotReady(PluginCategory),

    #[error("plugin [{0}] is not loaded")]
    PluginNotLoaded(String),

    #[error("plugin [{0}] has no lifecycle listener to invoke")]
    NoListener(String),

    #[error("listener of plugin [{0}] does not accept jobs")]
    NotInvocable(String),

    #[error("host is shutting down")]
    HostUnavailable,

    #[error(transparent)]
    Capsule(#[from] CapsuleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Invocation(#[from] PluginError),
}
