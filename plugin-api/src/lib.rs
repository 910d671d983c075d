//! # Vantage Plugin API
//!
//! This crate is the interface server plugins are compiled against. A server
//! plugin is an independently packaged unit of management-server behavior
//! (content sync, alert senders, bundle handlers, ...) that the Vantage
//! server loads into its own isolated capsule and drives through a fixed
//! lifecycle.
//!
//! A plugin package ships a descriptor at `META/plugin.yaml` describing its
//! name, category, optional lifecycle listener, and declared job schedules,
//! plus a cdylib exporting a [`PluginDecl`] via [`export_plugin!`].
//!
//! # Example plugin
//!
//! ```rust,ignore
//! use vantage_plugin_api::*;
//!
//! #[derive(Default)]
//! struct SyncListener {
//!     cursor: u64,
//! }
//!
//! impl PluginLifecycle for SyncListener {
//!     fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
//!         tracing::info!(data_dir = %ctx.data_dir.display(), "sync listener ready");
//!         Ok(())
//!     }
//!
//!     fn as_invocable(&mut self) -> Option<&mut dyn JobInvocable> {
//!         Some(self)
//!     }
//! }
//!
//! impl JobInvocable for SyncListener {
//!     fn execute(
//!         &mut self,
//!         job_id: &str,
//!         _ctx: &PluginContext,
//!         _properties: &std::collections::BTreeMap<String, String>,
//!     ) -> Result<(), PluginError> {
//!         self.cursor += 1;
//!         tracing::debug!(job_id, cursor = self.cursor, "sync pass complete");
//!         Ok(())
//!     }
//! }
//!
//! fn register(registrar: &mut PluginRegistrar) {
//!     registrar.register_listener("sync::SyncListener", || Box::<SyncListener>::default());
//! }
//!
//! export_plugin!(register);
//! ```

pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod registrar;
pub mod schedule;

pub use descriptor::{
    DescriptorError, PluginCategory, PluginDescriptor, PluginKey, UnknownCategory, DESCRIPTOR_PATH,
};
pub use error::PluginError;
pub use lifecycle::{JobInvocable, PluginContext, PluginLifecycle};
pub use registrar::{InvocableCtor, ListenerCtor, PluginDecl, PluginRegistrar};
pub use schedule::{JobTarget, Schedule, ScheduledJobDefinition};

/// The plugin API version compiled into both host and plugins.
pub const PLUGIN_API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the static exported by [`export_plugin!`].
pub const PLUGIN_DECL_SYMBOL: &str = "VANTAGE_PLUGIN_DECL";

/// Check whether a plugin built against `plugin_api` can be hosted by a
/// server built against `host_api`.
///
/// Compatibility is same-major (and same-minor while the major is 0, per
/// semver convention). Unparseable versions are never compatible.
pub fn api_compatible(plugin_api: &str, host_api: &str) -> bool {
    let (Ok(plugin), Ok(host)) = (
        semver::Version::parse(plugin_api),
        semver::Version::parse(host_api),
    ) else {
        return false;
    };

    if plugin.major != host.major {
        return false;
    }
    if plugin.major == 0 {
        return plugin.minor == host.minor;
    }
    true
}
