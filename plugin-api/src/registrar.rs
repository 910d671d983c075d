//! The binding table a plugin populates when its capsule is created, and
//! the cdylib entry point declaration.
//!
//! A plugin cdylib exports exactly one [`PluginDecl`] static (via
//! [`export_plugin!`]). The server resolves the static, verifies the API
//! version, and runs the plugin's `register` function against a fresh
//! [`PluginRegistrar`]. Everything the plugin can ever instantiate must be
//! registered there by name; the server performs no other symbol lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::lifecycle::{JobInvocable, PluginLifecycle};

/// Constructor for a lifecycle listener instance.
pub type ListenerCtor = Arc<dyn Fn() -> Box<dyn PluginLifecycle> + Send + Sync>;

/// Constructor for a stateless job invocable instance.
pub type InvocableCtor = Arc<dyn Fn() -> Box<dyn JobInvocable> + Send + Sync>;

/// Name-to-constructor bindings for one capsule.
#[derive(Default)]
pub struct PluginRegistrar {
    listeners: BTreeMap<String, ListenerCtor>,
    invocables: BTreeMap<String, InvocableCtor>,
}

impl PluginRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lifecycle listener constructor under a name. The name must
    /// match the descriptor's `listener` field to be used.
    pub fn register_listener(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn() -> Box<dyn PluginLifecycle> + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self.listeners.insert(name.clone(), Arc::new(ctor)).is_some() {
            tracing::warn!(name = %name, "listener registered twice, keeping the last one");
        }
    }

    /// Register a job invocable constructor under a name. Job definitions
    /// reference it through their `class` field.
    pub fn register_invocable(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn() -> Box<dyn JobInvocable> + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self.invocables.insert(name.clone(), Arc::new(ctor)).is_some() {
            tracing::warn!(name = %name, "invocable registered twice, keeping the last one");
        }
    }

    pub fn listener(&self, name: &str) -> Option<ListenerCtor> {
        self.listeners.get(name).cloned()
    }

    pub fn invocable(&self, name: &str) -> Option<InvocableCtor> {
        self.invocables.get(name).cloned()
    }

    pub fn listener_names(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    pub fn invocable_names(&self) -> Vec<String> {
        self.invocables.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.invocables.is_empty()
    }
}

/// The static a plugin cdylib exports.
///
/// Field order and contents are part of the plugin ABI; plugins must be
/// built with the same `vantage-plugin-api` major version as the server
/// (checked through `api_version` before `register` runs).
pub struct PluginDecl {
    pub api_version: &'static str,
    pub register: fn(&mut PluginRegistrar),
}

/// Export a [`PluginDecl`] under the well-known symbol name.
///
/// ```rust,ignore
/// fn register(registrar: &mut PluginRegistrar) {
///     registrar.register_listener("sync::SyncListener", || Box::<SyncListener>::default());
/// }
///
/// export_plugin!(register);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($register:path) => {
        #[doc(hidden)]
        #[no_mangle]
        pub static VANTAGE_PLUGIN_DECL: $crate::PluginDecl = $crate::PluginDecl {
            api_version: $crate::PLUGIN_API_VERSION,
            register: $register,
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::lifecycle::PluginContext;
    use std::collections::BTreeMap;

    struct NoopListener;
    impl PluginLifecycle for NoopListener {}

    struct NoopJob;
    impl JobInvocable for NoopJob {
        fn execute(
            &mut self,
            _job_id: &str,
            _ctx: &PluginContext,
            _properties: &BTreeMap<String, String>,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[test]
    fn test_registrar_lookup() {
        let mut registrar = PluginRegistrar::new();
        assert!(registrar.is_empty());

        registrar.register_listener("sync::Listener", || Box::new(NoopListener));
        registrar.register_invocable("sync::Job", || Box::new(NoopJob));

        assert!(registrar.listener("sync::Listener").is_some());
        assert!(registrar.listener("sync::Job").is_none());
        assert!(registrar.invocable("sync::Job").is_some());
        assert_eq!(registrar.listener_names(), vec!["sync::Listener"]);
        assert!(!registrar.is_empty());
    }

    #[test]
    fn test_registered_ctor_builds_instances() {
        let mut registrar = PluginRegistrar::new();
        registrar.register_invocable("job", || Box::new(NoopJob));

        let ctor = registrar.invocable("job").unwrap();
        let mut job = ctor();
        let ctx = PluginContext::new("p", "/tmp/d".into(), "/tmp/t".into(), serde_json::Value::Null, None);
        assert!(job.execute("job", &ctx, &BTreeMap::new()).is_ok());
    }
}
