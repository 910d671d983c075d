//! The master container: one per server process.
//!
//! Initialization runs a fixed sequence: discover packages, build the
//! capsule manager, create one type container per category, route and load
//! every enabled plugin, start the containers, then begin accepting work.
//! Per-plugin failures are recovered: the failing plugin is recorded in the
//! initialization report and its siblings proceed. Only a failure to build
//! the capsule manager, or ending up with no containers at all, aborts
//! initialization (with a full unwind to `ShutDown`).
//!
//! Shutdown is idempotent and best-effort; it always reaches the terminal
//! state.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use vantage_plugin_api::{PluginCategory, PluginKey, PluginRegistrar};

use crate::config::ServerConfig;

use super::capsule::{CapsuleLoader, CapsuleManager, DylibCapsuleLoader};
use super::container::{ContainerState, TypeContainer};
use super::discovery::{self, PluginPackage};
use super::error::MasterError;
use super::registry::PluginEnvironment;
use super::scheduler::{JobScheduler, LocalScheduler, SchedulingBridge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Uninitialized,
    Initializing,
    Started,
    ShutDown,
}

impl MasterState {
    fn as_str(&self) -> &'static str {
        match self {
            MasterState::Uninitialized => "uninitialized",
            MasterState::Initializing => "initializing",
            MasterState::Started => "started",
            MasterState::ShutDown => "shutdown",
        }
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recoverable failure recorded during initialization.
#[derive(Debug, Clone)]
pub struct PluginProblem {
    /// The plugin at fault; `None` for container- or directory-level
    /// problems.
    pub plugin: Option<String>,
    pub message: String,
}

impl fmt::Display for PluginProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.plugin {
            Some(plugin) => write!(f, "[{plugin}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// What initialization accomplished.
#[derive(Debug, Clone, Default)]
pub struct InitializationReport {
    pub loaded: Vec<PluginKey>,
    pub disabled: Vec<PluginKey>,
    pub problems: Vec<PluginProblem>,
}

impl InitializationReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Point-in-time snapshot of the whole subsystem, for operators.
#[derive(Debug, Serialize)]
pub struct MasterStatus {
    pub state: String,
    pub packages: usize,
    pub capsules: usize,
    pub disabled: usize,
    pub containers: Vec<ContainerStatus>,
}

#[derive(Debug, Serialize)]
pub struct ContainerStatus {
    pub category: String,
    pub state: String,
    pub plugins: usize,
}

/// Builds a [`MasterContainer`] with its collaborators.
///
/// Defaults: the dylib capsule loader, an in-process [`LocalScheduler`], and
/// no host bindings (the root capsule exposes nothing).
pub struct MasterBuilder {
    config: ServerConfig,
    loader: Arc<dyn CapsuleLoader>,
    scheduler: Option<Arc<dyn JobScheduler>>,
    host_bindings: PluginRegistrar,
}

impl MasterBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            loader: Arc::new(DylibCapsuleLoader),
            scheduler: None,
            host_bindings: PluginRegistrar::new(),
        }
    }

    pub fn loader(mut self, loader: Arc<dyn CapsuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Inject a scheduler collaborator (e.g. a distributed scheduler). The
    /// master owns it from here: it is shut down with the master, and it
    /// replaces the default [`LocalScheduler`]. Embedders that still want
    /// in-process run-everywhere jobs alongside a distributed collaborator
    /// can build their own [`LocalScheduler`] over `master.bridge()`.
    pub fn scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Bindings the root capsule offers to plugins, subject to the
    /// configured visibility filter.
    pub fn host_bindings(mut self, bindings: PluginRegistrar) -> Self {
        self.host_bindings = bindings;
        self
    }

    pub fn build(self) -> Arc<MasterContainer> {
        Arc::new_cyclic(|weak| {
            let bridge = Arc::new(SchedulingBridge::new(weak.clone()));
            let scheduler: Arc<dyn JobScheduler> = match self.scheduler {
                Some(scheduler) => scheduler,
                None => Arc::new(LocalScheduler::new(bridge.clone())),
            };
            let disabled = self.config.disabled_plugins.iter().cloned().collect();
            MasterContainer {
                config: self.config,
                loader: self.loader,
                scheduler,
                bridge,
                state: Mutex::new(MasterState::Uninitialized),
                capsule_manager: RwLock::new(None),
                containers: RwLock::new(HashMap::new()),
                disabled: Mutex::new(disabled),
                host_bindings: Mutex::new(Some(self.host_bindings)),
                last_report: Mutex::new(None),
            }
        })
    }
}

/// Top-level orchestrator of the server plugin subsystem.
pub struct MasterContainer {
    config: ServerConfig,
    loader: Arc<dyn CapsuleLoader>,
    scheduler: Arc<dyn JobScheduler>,
    bridge: Arc<SchedulingBridge>,
    state: Mutex<MasterState>,
    capsule_manager: RwLock<Option<Arc<CapsuleManager>>>,
    containers: RwLock<HashMap<PluginCategory, Arc<TypeContainer>>>,
    disabled: Mutex<BTreeSet<PluginKey>>,
    host_bindings: Mutex<Option<PluginRegistrar>>,
    last_report: Mutex<Option<InitializationReport>>,
}

impl MasterContainer {
    /// A master with default collaborators. See [`MasterBuilder`] for
    /// substituting them.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        MasterBuilder::new(config).build()
    }

    pub fn builder(config: ServerConfig) -> MasterBuilder {
        MasterBuilder::new(config)
    }

    pub fn state(&self) -> MasterState {
        *self.state.lock()
    }

    pub fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.scheduler
    }

    /// The trigger executor side of the scheduling bridge; schedulers fire
    /// into this.
    pub fn bridge(&self) -> &Arc<SchedulingBridge> {
        &self.bridge
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bring the whole subsystem up. Valid once, from `Uninitialized`.
    pub fn initialize(&self) -> Result<InitializationReport, MasterError> {
        {
            let mut state = self.state.lock();
            if *state != MasterState::Uninitialized {
                return Err(MasterError::InvalidState {
                    operation: "initialize",
                    state: state.as_str(),
                });
            }
            *state = MasterState::Initializing;
        }
        match self.initialize_inner() {
            Ok(report) => {
                *self.state.lock() = MasterState::Started;
                info!(
                    loaded = report.loaded.len(),
                    disabled = report.disabled.len(),
                    problems = report.problems.len(),
                    "master container started"
                );
                *self.last_report.lock() = Some(report.clone());
                Ok(report)
            }
            Err(fatal) => {
                warn!(error = %fatal, "master initialization failed, unwinding");
                self.shutdown();
                Err(fatal)
            }
        }
    }

    fn initialize_inner(&self) -> Result<InitializationReport, MasterError> {
        let mut report = InitializationReport::default();

        // Discover packages. Unreadable packages are recoverable.
        let (packages, failures) = discovery::discover_packages(&self.config.plugin_dir);
        for failure in failures {
            report.problems.push(PluginProblem {
                plugin: None,
                message: format!("{}: {}", failure.path.display(), failure.message),
            });
        }
        info!(
            packages = packages.len(),
            dir = %self.config.plugin_dir.display(),
            "plugin discovery complete"
        );

        // Build the capsule manager over every parsed package. Fatal on
        // failure.
        let staging_dir = self.config.temp_dir.join("capsules");
        std::fs::create_dir_all(&staging_dir).map_err(|source| MasterError::Staging {
            path: staging_dir.clone(),
            source,
        })?;
        let visibility = self.visibility_filter()?;
        let host_bindings = self.host_bindings.lock().take().unwrap_or_default();
        let manager = Arc::new(CapsuleManager::new(
            staging_dir,
            host_bindings,
            visibility,
            self.loader.clone(),
        ));
        for package in &packages {
            manager.register_package(package.clone());
        }
        *self.capsule_manager.write() = Some(manager);

        // One container per category. A failing container is recoverable as
        // long as at least one comes up.
        let mut containers = HashMap::new();
        for category in PluginCategory::all() {
            let container = TypeContainer::new(category);
            match container.initialize(&self.config.data_dir, &self.config.temp_dir) {
                Ok(()) => {
                    containers.insert(category, Arc::new(container));
                }
                Err(container_error) => report.problems.push(PluginProblem {
                    plugin: None,
                    message: format!(
                        "container [{category}] failed to initialize: {container_error}"
                    ),
                }),
            }
        }
        if containers.is_empty() {
            return Err(MasterError::NoContainers);
        }
        *self.containers.write() = containers;

        // Route and load. Per-plugin failures are recoverable.
        let disabled = self.disabled.lock().clone();
        for package in &packages {
            let key = package.key();
            if disabled.contains(&key) {
                info!(plugin = %key, "plugin is disabled, not loading");
                report.disabled.push(key);
                continue;
            }
            match self.load_one(package) {
                Ok(()) => report.loaded.push(key),
                Err(load_error) => {
                    warn!(plugin = %key, error = %load_error, "failed to load plugin");
                    report.problems.push(PluginProblem {
                        plugin: Some(key.name.clone()),
                        message: load_error.to_string(),
                    });
                }
            }
        }

        // Start serving.
        for container in self.containers_snapshot() {
            if let Err(start_error) = container.start() {
                report.problems.push(PluginProblem {
                    plugin: None,
                    message: format!(
                        "container [{}] failed to start: {start_error}",
                        container.category()
                    ),
                });
            }
        }

        Ok(report)
    }

    /// Tear everything down. Idempotent; always reaches `ShutDown`.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == MasterState::ShutDown {
                debug!("master container already shut down");
                return;
            }
            *state = MasterState::ShutDown;
        }
        self.scheduler.shutdown();
        let containers: Vec<Arc<TypeContainer>> =
            self.containers.write().drain().map(|(_, c)| c).collect();
        for container in containers {
            if container.state() == ContainerState::Started {
                if let Err(stop_error) = container.stop() {
                    warn!(
                        category = %container.category(),
                        error = %stop_error,
                        "container stop failed during shutdown"
                    );
                }
            }
            container.shutdown();
        }
        if let Some(manager) = self.capsule_manager.write().take() {
            manager.shutdown();
        }
        info!("master container shut down");
    }

    /// Hot-deploy one package from disk. With `enabled = false` the package
    /// is registered for later enablement but nothing is loaded.
    pub fn load_plugin(&self, location: &Path, enabled: bool) -> Result<PluginKey, MasterError> {
        self.require_started("load_plugin")?;
        let package = Arc::new(discovery::read_package(location)?);
        let key = package.key();
        let manager = self.capsule_manager()?;
        manager.register_package(package.clone());

        if !enabled {
            self.disabled.lock().insert(key.clone());
            info!(plugin = %key, "plugin registered disabled");
            return Ok(key);
        }
        self.disabled.lock().remove(&key);
        self.load_one(&package)?;
        if let Some(environment) = self.environment(&key) {
            self.bridge.register_declared_jobs(&environment);
        }
        info!(plugin = %key, "plugin hot-deployed");
        Ok(key)
    }

    /// Flip a plugin's enablement without a restart.
    ///
    /// Disabling stops and unloads the plugin and removes its triggers; its
    /// package and capsule stay registered. Enabling loads it back from the
    /// registered package and re-registers its triggers; on failure the
    /// plugin returns to the disabled set.
    pub fn set_plugin_enabled(&self, key: &PluginKey, enabled: bool) -> Result<(), MasterError> {
        self.require_started("set_plugin_enabled")?;
        let container = self
            .container_for_category(key.category)
            .ok_or(MasterError::UnknownCategory(key.category))?;

        if enabled {
            let was_disabled = self.disabled.lock().remove(key);
            if !was_disabled && container.registry()?.is_loaded(&key.name) {
                return Ok(());
            }
            let package = self
                .capsule_manager()?
                .package(&key.name)
                .ok_or_else(|| MasterError::UnknownPlugin(key.name.clone()))?;
            if let Err(load_error) = self.load_one(&package) {
                self.disabled.lock().insert(key.clone());
                return Err(load_error);
            }
            if let Some(environment) = self.environment(key) {
                self.bridge.register_declared_jobs(&environment);
            }
            info!(plugin = %key, "plugin enabled");
        } else {
            if let Some(environment) = self.environment(key) {
                self.bridge.unregister_declared_jobs(&environment);
            }
            container.unload(&key.name);
            self.disabled.lock().insert(key.clone());
            info!(plugin = %key, "plugin disabled");
        }
        Ok(())
    }

    /// Register every loaded plugin's declared schedules with the
    /// scheduler. Returns the number of triggers registered.
    pub fn schedule_all_plugin_jobs(&self) -> Result<usize, MasterError> {
        self.require_started("schedule_all_plugin_jobs")?;
        let scheduled: usize = self
            .containers_snapshot()
            .iter()
            .map(|container| container.schedule_declared_jobs(&self.bridge))
            .sum();
        info!(triggers = scheduled, "plugin job schedules registered");
        Ok(scheduled)
    }

    pub fn container_for_category(
        &self,
        category: PluginCategory,
    ) -> Option<Arc<TypeContainer>> {
        self.containers.read().get(&category).cloned()
    }

    /// The container hosting a loaded plugin, if any.
    pub fn container_for_plugin(&self, key: &PluginKey) -> Option<Arc<TypeContainer>> {
        let container = self.container_for_category(key.category)?;
        let registry = container.registry().ok()?;
        registry.is_loaded(&key.name).then_some(container)
    }

    pub fn known_categories(&self) -> Vec<PluginCategory> {
        let mut categories: Vec<_> = self.containers.read().keys().copied().collect();
        categories.sort_by_key(|category| category.to_string());
        categories
    }

    pub fn is_plugin_enabled(&self, key: &PluginKey) -> bool {
        !self.disabled.lock().contains(key)
    }

    pub fn last_report(&self) -> Option<InitializationReport> {
        self.last_report.lock().clone()
    }

    /// The isolation manager. Errors when the master has not initialized.
    pub fn capsule_manager(&self) -> Result<Arc<CapsuleManager>, MasterError> {
        self.capsule_manager
            .read()
            .clone()
            .ok_or(MasterError::InvalidState {
                operation: "access capsules",
                state: self.state().as_str(),
            })
    }

    pub fn status(&self) -> MasterStatus {
        let containers = self
            .containers_snapshot()
            .iter()
            .map(|container| ContainerStatus {
                category: container.category().to_string(),
                state: container.state().to_string(),
                plugins: container.plugin_count(),
            })
            .collect();
        let (packages, capsules) = match self.capsule_manager.read().as_ref() {
            Some(manager) => (manager.package_count(), manager.capsule_count()),
            None => (0, 0),
        };
        MasterStatus {
            state: self.state().to_string(),
            packages,
            capsules,
            disabled: self.disabled.lock().len(),
            containers,
        }
    }

    fn environment(&self, key: &PluginKey) -> Option<PluginEnvironment> {
        let container = self.container_for_category(key.category)?;
        container.registry().ok()?.environment(&key.name)
    }

    fn load_one(&self, package: &Arc<PluginPackage>) -> Result<(), MasterError> {
        let category = package.descriptor.category;
        let container = self
            .container_for_category(category)
            .ok_or(MasterError::UnknownCategory(category))?;
        let capsule = self.capsule_manager()?.obtain_capsule(package.name())?;
        container.load(PluginEnvironment::new(package.clone(), capsule))?;
        Ok(())
    }

    fn containers_snapshot(&self) -> Vec<Arc<TypeContainer>> {
        let mut containers: Vec<_> = self.containers.read().values().cloned().collect();
        containers.sort_by_key(|container| container.category().to_string());
        containers
    }

    fn visibility_filter(&self) -> Result<Option<Regex>, MasterError> {
        match &self.config.root_visibility_filter {
            Some(pattern) => Ok(Some(Regex::new(pattern)?)),
            None => Ok(None),
        }
    }

    fn require_started(&self, operation: &'static str) -> Result<(), MasterError> {
        let state = self.state();
        if state != MasterState::Started {
            return Err(MasterError::InvalidState {
                operation,
                state: state.as_str(),
            });
        }
        Ok(())
    }
}

impl Drop for MasterContainer {
    fn drop(&mut self) {
        if self.state() != MasterState::ShutDown {
            warn!("master container dropped without shutdown");
        }
    }
}
