//! Panic containment for calls crossing into plugin code.
//!
//! Every invocation of plugin-provided code (constructors, lifecycle hooks,
//! job executions) goes through one of the guards here. A panicking plugin
//! is converted into a [`PluginError::Panic`] carrying the panic message, so
//! one misbehaving plugin can never take down the server or its siblings.

use std::panic::{self, AssertUnwindSafe};

use tracing::error;
use vantage_plugin_api::PluginError;

/// Run a fallible plugin call, converting panics into errors.
pub fn guard_plugin_call<T>(
    f: impl FnOnce() -> Result<T, PluginError>,
) -> Result<T, PluginError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "plugin code panicked");
            Err(PluginError::Panic(message))
        }
    }
}

/// Run an infallible plugin call (e.g. a constructor), converting panics
/// into errors.
pub fn guard_plugin_value<T>(f: impl FnOnce() -> T) -> Result<T, PluginError> {
    guard_plugin_call(|| Ok(f()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
