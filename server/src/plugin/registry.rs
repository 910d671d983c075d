//! Per-category plugin registry.
//!
//! The registry owns everything a loaded plugin needs at runtime: its
//! environment (package + capsule), its lifecycle listener instance, and its
//! cached plugin context. Load is transactional per plugin: a listener that
//! fails to construct or initialize leaves no trace in the registry.
//! Unload, stop and shutdown are best-effort: listener failures are logged
//! and never block the operation or sibling plugins.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vantage_plugin_api::{PluginCategory, PluginContext, PluginKey, PluginLifecycle};

use super::capsule::Capsule;
use super::discovery::PluginPackage;
use super::error::RegistryError;
use super::isolation::{guard_plugin_call, guard_plugin_value};

/// A loaded plugin's listener instance. The mutex serializes all lifecycle
/// and job callbacks on the instance.
pub type ListenerHandle = Arc<Mutex<Box<dyn PluginLifecycle>>>;

/// Everything that ties a loaded plugin together.
#[derive(Debug, Clone)]
pub struct PluginEnvironment {
    pub package: Arc<PluginPackage>,
    pub capsule: Arc<Capsule>,
}

impl PluginEnvironment {
    pub fn new(package: Arc<PluginPackage>, capsule: Arc<Capsule>) -> Self {
        Self { package, capsule }
    }

    pub fn plugin_name(&self) -> &str {
        self.package.name()
    }

    pub fn key(&self) -> PluginKey {
        self.package.key()
    }

    pub fn descriptor(&self) -> &vantage_plugin_api::PluginDescriptor {
        &self.package.descriptor
    }
}

/// Registry of loaded plugins for one category.
pub struct PluginRegistry {
    category: PluginCategory,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    environments: DashMap<String, PluginEnvironment>,
    listeners: DashMap<String, ListenerHandle>,
    contexts: DashMap<String, Arc<PluginContext>>,
}

impl PluginRegistry {
    pub fn new(category: PluginCategory, data_dir: &Path, temp_dir: &Path) -> Self {
        Self {
            category,
            data_dir: data_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            environments: DashMap::new(),
            listeners: DashMap::new(),
            contexts: DashMap::new(),
        }
    }

    pub fn category(&self) -> PluginCategory {
        self.category
    }

    /// Load a plugin: instantiate its listener inside its capsule, run
    /// `initialize`, and register the environment. On any failure nothing is
    /// registered.
    pub fn load(&self, environment: PluginEnvironment) -> Result<(), RegistryError> {
        let name = environment.plugin_name().to_string();
        if self.environments.contains_key(&name) {
            return Err(RegistryError::AlreadyLoaded(name));
        }

        if let Some(listener_name) = environment.descriptor().listener.clone() {
            let ctor = environment.capsule.listener_ctor(&listener_name)?;
            let mut listener =
                guard_plugin_value(|| ctor()).map_err(|source| RegistryError::Listener {
                    plugin: name.clone(),
                    source,
                })?;

            let ctx = self.build_context(&environment)?;
            debug!(plugin = %name, listener = %listener_name, "initializing plugin listener");
            guard_plugin_call(|| listener.initialize(&ctx)).map_err(|source| {
                RegistryError::Listener {
                    plugin: name.clone(),
                    source,
                }
            })?;

            self.contexts.insert(name.clone(), ctx);
            self.listeners
                .insert(name.clone(), Arc::new(Mutex::new(listener)));
        }

        info!(plugin = %name, category = %self.category, "plugin loaded");
        self.environments.insert(name, environment);
        Ok(())
    }

    /// Unload a plugin, calling `shutdown` on its listener. Best-effort: the
    /// plugin is removed whatever the listener does.
    pub fn unload(&self, plugin_name: &str) {
        if let Some((_, handle)) = self.listeners.remove(plugin_name) {
            let mut listener = handle.lock();
            if let Err(error) = guard_plugin_call(|| listener.shutdown()) {
                warn!(plugin = %plugin_name, error = %error, "listener shutdown failed");
            }
        }
        self.contexts.remove(plugin_name);
        if self.environments.remove(plugin_name).is_some() {
            info!(plugin = %plugin_name, category = %self.category, "plugin unloaded");
        }
    }

    /// Start one plugin's listener.
    pub fn start_plugin(&self, plugin_name: &str) {
        if let Some(handle) = self.listener(plugin_name) {
            let mut listener = handle.lock();
            if let Err(error) = guard_plugin_call(|| listener.start()) {
                warn!(plugin = %plugin_name, error = %error, "listener start failed");
            }
        }
    }

    /// Stop one plugin's listener.
    pub fn stop_plugin(&self, plugin_name: &str) {
        if let Some(handle) = self.listener(plugin_name) {
            let mut listener = handle.lock();
            if let Err(error) = guard_plugin_call(|| listener.stop()) {
                warn!(plugin = %plugin_name, error = %error, "listener stop failed");
            }
        }
    }

    /// Start every listener. A failing listener is logged and skipped.
    pub fn start_all(&self) {
        for name in self.plugin_names() {
            self.start_plugin(&name);
        }
    }

    /// Stop every listener. A failing listener is logged and skipped.
    pub fn stop_all(&self) {
        for name in self.plugin_names() {
            self.stop_plugin(&name);
        }
    }

    /// Unload every plugin still registered.
    pub fn shutdown(&self) {
        for name in self.plugin_names() {
            self.unload(&name);
        }
    }

    pub fn environment(&self, plugin_name: &str) -> Option<PluginEnvironment> {
        self.environments.get(plugin_name).map(|entry| entry.clone())
    }

    pub fn environments(&self) -> Vec<PluginEnvironment> {
        self.environments
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn listener(&self, plugin_name: &str) -> Option<ListenerHandle> {
        self.listeners.get(plugin_name).map(|entry| entry.clone())
    }

    pub fn is_loaded(&self, plugin_name: &str) -> bool {
        self.environments.contains_key(plugin_name)
    }

    pub fn plugin_count(&self) -> usize {
        self.environments.len()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.environments
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The cached context for a loaded plugin, building it on first use for
    /// plugins without a listener.
    pub fn plugin_context(
        &self,
        environment: &PluginEnvironment,
    ) -> Result<Arc<PluginContext>, RegistryError> {
        if let Some(ctx) = self.contexts.get(environment.plugin_name()) {
            return Ok(ctx.clone());
        }
        let ctx = self.build_context(environment)?;
        self.contexts
            .insert(environment.plugin_name().to_string(), ctx.clone());
        Ok(ctx)
    }

    fn build_context(
        &self,
        environment: &PluginEnvironment,
    ) -> Result<Arc<PluginContext>, RegistryError> {
        let name = environment.plugin_name();
        let data_dir = self.data_dir.join(name);
        std::fs::create_dir_all(&data_dir).map_err(|source| RegistryError::DataDir {
            plugin: name.to_string(),
            source,
        })?;
        let descriptor = environment.descriptor();
        Ok(Arc::new(PluginContext::new(
            name,
            data_dir,
            self.temp_dir.clone(),
            descriptor.config.clone(),
            descriptor.schedule.clone(),
        )))
    }
}
