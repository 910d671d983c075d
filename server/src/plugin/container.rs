//! Type containers: one lifecycle state machine per plugin category.
//!
//! ```text
//!     Uninitialized -> Initialized -> Started <-> Stopped -> ShutDown
//! ```
//!
//! State-mutating operations are serialized by one coarse lock per
//! container, so plugin lifecycle callbacks never interleave within a
//! category. Job triggers only read the registry and are not blocked by
//! lifecycle transitions in other containers.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use vantage_plugin_api::PluginCategory;

use super::error::ContainerError;
use super::registry::{PluginEnvironment, PluginRegistry};
use super::scheduler::SchedulingBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
    ShutDown,
}

impl ContainerState {
    fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Uninitialized => "uninitialized",
            ContainerState::Initialized => "initialized",
            ContainerState::Started => "started",
            ContainerState::Stopped => "stopped",
            ContainerState::ShutDown => "shutdown",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hosts every plugin of one category.
pub struct TypeContainer {
    category: PluginCategory,
    state: Mutex<ContainerState>,
    registry: RwLock<Option<Arc<PluginRegistry>>>,
}

impl TypeContainer {
    pub fn new(category: PluginCategory) -> Self {
        Self {
            category,
            state: Mutex::new(ContainerState::Uninitialized),
            registry: RwLock::new(None),
        }
    }

    pub fn category(&self) -> PluginCategory {
        self.category
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    /// Create the container's registry. Valid only once, from
    /// `Uninitialized`.
    pub fn initialize(&self, data_dir: &Path, temp_dir: &Path) -> Result<(), ContainerError> {
        let mut state = self.state.lock();
        if *state != ContainerState::Uninitialized {
            return Err(self.invalid_state("initialize", *state));
        }
        *self.registry.write() = Some(Arc::new(PluginRegistry::new(
            self.category,
            data_dir,
            temp_dir,
        )));
        *state = ContainerState::Initialized;
        debug!(category = %self.category, "type container initialized");
        Ok(())
    }

    /// Start serving: every listener's `start` hook runs. Valid from
    /// `Initialized` or `Stopped`.
    pub fn start(&self) -> Result<(), ContainerError> {
        let mut state = self.state.lock();
        match *state {
            ContainerState::Initialized | ContainerState::Stopped => {}
            other => return Err(self.invalid_state("start", other)),
        }
        self.registry()?.start_all();
        *state = ContainerState::Started;
        info!(category = %self.category, "type container started");
        Ok(())
    }

    /// Stop serving: every listener's `stop` hook runs. Valid from
    /// `Started`.
    pub fn stop(&self) -> Result<(), ContainerError> {
        let mut state = self.state.lock();
        if *state != ContainerState::Started {
            return Err(self.invalid_state("stop", *state));
        }
        self.registry()?.stop_all();
        *state = ContainerState::Stopped;
        info!(category = %self.category, "type container stopped");
        Ok(())
    }

    /// Unload every plugin and tear down the registry. Idempotent and
    /// best-effort; the terminal state is always reached.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if *state == ContainerState::ShutDown {
            return;
        }
        if let Some(registry) = self.registry.write().take() {
            registry.shutdown();
        }
        *state = ContainerState::ShutDown;
        info!(category = %self.category, "type container shut down");
    }

    /// Load a plugin into this container. Valid while `Initialized` or
    /// `Started`; when already started, the plugin's listener is started
    /// immediately.
    pub fn load(&self, environment: PluginEnvironment) -> Result<(), ContainerError> {
        let state = self.state.lock();
        match *state {
            ContainerState::Initialized | ContainerState::Started => {}
            other => return Err(self.invalid_state("load", other)),
        }
        let registry = self.registry()?;
        let name = environment.plugin_name().to_string();
        registry.load(environment)?;
        if *state == ContainerState::Started {
            registry.start_plugin(&name);
        }
        Ok(())
    }

    /// Unload a plugin. Best-effort no-op if the container has no registry
    /// or the plugin is not loaded.
    pub fn unload(&self, plugin_name: &str) {
        let _state = self.state.lock();
        if let Some(registry) = self.registry.read().clone() {
            registry.stop_plugin(plugin_name);
            registry.unload(plugin_name);
        }
    }

    /// The container's registry, for callers outside the lifecycle lock
    /// (job dispatch, introspection).
    pub fn registry(&self) -> Result<Arc<PluginRegistry>, ContainerError> {
        self.registry
            .read()
            .clone()
            .ok_or(ContainerError::NotInitialized(self.category))
    }

    pub fn plugin_count(&self) -> usize {
        self.registry
            .read()
            .as_ref()
            .map(|registry| registry.plugin_count())
            .unwrap_or(0)
    }

    /// Register every declared schedule of every loaded plugin with the
    /// scheduler, via the bridge. Per-plugin failures are logged and do not
    /// block siblings. Returns the number of triggers registered.
    pub fn schedule_declared_jobs(&self, bridge: &SchedulingBridge) -> usize {
        let Ok(registry) = self.registry() else {
            return 0;
        };
        registry
            .environments()
            .iter()
            .map(|environment| bridge.register_declared_jobs(environment))
            .sum()
    }

    fn invalid_state(&self, operation: &'static str, state: ContainerState) -> ContainerError {
        ContainerError::InvalidState {
            category: self.category,
            operation,
            state: state.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let container = TypeContainer::new(PluginCategory::Alert);
        assert_eq!(container.state(), ContainerState::Uninitialized);

        // Nothing but initialize is valid up front.
        assert!(container.start().is_err());
        assert!(container.stop().is_err());

        container
            .initialize(&dir.path().join("data"), &dir.path().join("tmp"))
            .unwrap();
        assert_eq!(container.state(), ContainerState::Initialized);
        assert!(container
            .initialize(&dir.path().join("data"), &dir.path().join("tmp"))
            .is_err());

        container.start().unwrap();
        assert_eq!(container.state(), ContainerState::Started);
        container.stop().unwrap();
        assert_eq!(container.state(), ContainerState::Stopped);

        // A stopped container can serve again.
        container.start().unwrap();
        container.stop().unwrap();

        container.shutdown();
        assert_eq!(container.state(), ContainerState::ShutDown);
        container.shutdown(); // idempotent
        assert!(container.start().is_err());
        assert!(container.registry().is_err());
    }

    #[test]
    fn test_stop_requires_started() {
        let dir = tempfile::tempdir().unwrap();
        let container = TypeContainer::new(PluginCategory::Generic);
        container
            .initialize(&dir.path().join("data"), &dir.path().join("tmp"))
            .unwrap();
        let err = container.stop().unwrap_err();
        assert!(matches!(
            err,
            ContainerError::InvalidState {
                operation: "stop",
                ..
            }
        ));
    }
}
