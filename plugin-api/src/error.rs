//! Error type returned by plugin code to the host.

/// Error returned from plugin lifecycle callbacks and job invocations.
///
/// The host treats every variant the same way at a given call site (load
/// failures exclude the plugin, job failures unschedule the trigger); the
/// variants exist so operators can tell what went wrong from the logs.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin code panicked; the panic was contained by the host.
    #[error("plugin panicked: {0}")]
    Panic(String),

    /// The plugin could not initialize itself.
    #[error("plugin initialization failed: {0}")]
    InitializationFailed(String),

    /// The plugin rejected its configuration.
    #[error("plugin configuration error: {0}")]
    Configuration(String),

    /// A triggered job failed.
    #[error("job failed: {0}")]
    JobFailed(String),

    /// Anything else the plugin wants to surface.
    #[error("plugin internal error: {0}")]
    Internal(String),
}

impl PluginError {
    /// Wrap an arbitrary error as [`PluginError::Internal`].
    pub fn internal(err: impl std::fmt::Display) -> Self {
        PluginError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        PluginError::Internal(err.to_string())
    }
}
