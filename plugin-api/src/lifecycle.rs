//! Plugin lifecycle and job invocation traits.
//!
//! # Lifecycle
//!
//! ```text
//!     initialize --> start --> stop --> shutdown
//! ```
//!
//! The server guarantees this order per plugin and never re-enters a
//! callback concurrently for the same listener instance. Callbacks are
//! blocking by contract: the server runs them off its async threads and
//! applies no timeout, so a hung callback blocks its calling thread.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::PluginError;
use crate::schedule::Schedule;

/// Runtime context handed to a plugin, built once per plugin and cached.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_name: String,

    /// Durable per-plugin directory, preserved across server restarts.
    pub data_dir: PathBuf,

    /// Scratch directory shared across plugins, wiped at server discretion.
    pub temp_dir: PathBuf,

    /// Configuration from the descriptor's `config` section.
    pub config: serde_json::Value,

    /// The plugin's declared global schedule, if any.
    pub schedule: Option<Schedule>,
}

impl PluginContext {
    pub fn new(
        plugin_name: impl Into<String>,
        data_dir: PathBuf,
        temp_dir: PathBuf,
        config: serde_json::Value,
        schedule: Option<Schedule>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            data_dir,
            temp_dir,
            config,
            schedule,
        }
    }
}

/// The stateful object representing a running plugin.
///
/// All methods default to no-ops so a listener only implements the hooks it
/// needs. Returning an error from [`initialize`](Self::initialize) keeps the
/// plugin out of the registry entirely; errors from the other hooks are
/// logged by the server and do not affect sibling plugins.
pub trait PluginLifecycle: Send {
    /// Called once while the plugin is being loaded.
    fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Called when the owning container starts serving.
    fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called when the owning container stops serving.
    fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called while the plugin is being unloaded. Best-effort: failures are
    /// logged, the plugin is removed regardless.
    fn shutdown(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Stateful job dispatch. Jobs whose target is the listener are routed
    /// here; return `None` (the default) if the listener takes no jobs.
    fn as_invocable(&mut self) -> Option<&mut dyn JobInvocable> {
        None
    }
}

/// A unit of scheduled plugin work.
///
/// Implemented by lifecycle listeners (stateful jobs, one instance for the
/// plugin's lifetime) and by classes named in job definitions (stateless
/// jobs, a fresh instance per fire).
pub trait JobInvocable: Send {
    fn execute(
        &mut self,
        job_id: &str,
        ctx: &PluginContext,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), PluginError>;
}
