//! Capsules: per-plugin isolation environments.
//!
//! A capsule owns a staged copy of its plugin package, the binding table the
//! plugin registered, and (for dylib plugins) the loaded library itself.
//! Lookups that miss the capsule's own bindings delegate to the parent; the
//! root capsule holds the host-provided bindings and answers delegated
//! lookups only for names matching the configured visibility filter. With no
//! filter the root exposes nothing to plugins.
//!
//! Capsules are created lazily and memoized by the [`CapsuleManager`]: the
//! first request for a plugin stages its package and runs the loader, every
//! later request returns the cached capsule.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use libloading::Library;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};
use vantage_plugin_api::{
    api_compatible, InvocableCtor, ListenerCtor, PluginRegistrar, PLUGIN_API_VERSION,
    PLUGIN_DECL_SYMBOL,
};

use super::discovery::PluginPackage;
use super::error::CapsuleError;
use super::isolation::guard_plugin_value;

/// Name the root capsule reports in logs and errors.
pub const ROOT_CAPSULE_NAME: &str = "<host>";

/// What a loader produces for one capsule.
pub struct CapsuleRuntime {
    pub bindings: PluginRegistrar,
    // Declared after `bindings`: constructors point into the library, so the
    // binding table must drop first.
    pub library: Option<Library>,
}

impl CapsuleRuntime {
    pub fn from_bindings(bindings: PluginRegistrar) -> Self {
        Self {
            bindings,
            library: None,
        }
    }
}

/// Turns a staged package into a capsule runtime.
///
/// The production implementation is [`DylibCapsuleLoader`]; tests substitute
/// in-process loaders that register constructors directly.
pub trait CapsuleLoader: Send + Sync {
    fn load(
        &self,
        package: &PluginPackage,
        contents_dir: &Path,
    ) -> Result<CapsuleRuntime, CapsuleError>;
}

/// One plugin's isolation environment.
pub struct Capsule {
    name: String,
    package: Option<Arc<PluginPackage>>,
    contents_dir: Option<PathBuf>,
    runtime: CapsuleRuntime,
    parent: Option<Arc<Capsule>>,
    /// Only set on the root capsule; gates delegated lookups from children.
    visibility: Option<Regex>,
}

impl Capsule {
    fn root(bindings: PluginRegistrar, visibility: Option<Regex>) -> Self {
        Self {
            name: ROOT_CAPSULE_NAME.to_string(),
            package: None,
            contents_dir: None,
            runtime: CapsuleRuntime::from_bindings(bindings),
            parent: None,
            visibility,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package(&self) -> Option<&Arc<PluginPackage>> {
        self.package.as_ref()
    }

    /// The capsule's private staged copy of the package contents. `None` for
    /// the root capsule.
    pub fn contents_dir(&self) -> Option<&Path> {
        self.contents_dir.as_deref()
    }

    pub fn parent(&self) -> Option<&Arc<Capsule>> {
        self.parent.as_ref()
    }

    /// Resolve a listener constructor: own bindings first, then the parent
    /// chain subject to the root's visibility filter.
    pub fn listener_ctor(&self, name: &str) -> Result<ListenerCtor, CapsuleError> {
        self.resolve(name, false, |bindings| bindings.listener(name))
            .ok_or_else(|| CapsuleError::BindingNotFound {
                capsule: self.name.clone(),
                name: name.to_string(),
            })
    }

    /// Resolve an invocable constructor the same way.
    pub fn invocable_ctor(&self, name: &str) -> Result<InvocableCtor, CapsuleError> {
        self.resolve(name, false, |bindings| bindings.invocable(name))
            .ok_or_else(|| CapsuleError::BindingNotFound {
                capsule: self.name.clone(),
                name: name.to_string(),
            })
    }

    fn resolve<T>(
        &self,
        name: &str,
        delegated: bool,
        lookup: impl Fn(&PluginRegistrar) -> Option<T> + Copy,
    ) -> Option<T> {
        if delegated && self.parent.is_none() && !self.visible_to_children(name) {
            return None;
        }
        if let Some(found) = lookup(&self.runtime.bindings) {
            return Some(found);
        }
        self.parent
            .as_ref()
            .and_then(|parent| parent.resolve(name, true, lookup))
    }

    fn visible_to_children(&self, name: &str) -> bool {
        match &self.visibility {
            Some(filter) => filter.is_match(name),
            None => false,
        }
    }
}

impl std::fmt::Debug for Capsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capsule")
            .field("name", &self.name)
            .field("contents_dir", &self.contents_dir)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Creates, caches, and destroys capsules for the whole server.
pub struct CapsuleManager {
    root: Arc<Capsule>,
    loader: Arc<dyn CapsuleLoader>,
    /// Staging root for extracted archive packages.
    staging_dir: PathBuf,
    packages: DashMap<String, Arc<PluginPackage>>,
    // Creation is serialized so concurrent requests for the same plugin
    // produce exactly one capsule.
    capsules: Mutex<HashMap<String, Arc<Capsule>>>,
}

impl CapsuleManager {
    pub fn new(
        staging_dir: PathBuf,
        host_bindings: PluginRegistrar,
        visibility: Option<Regex>,
        loader: Arc<dyn CapsuleLoader>,
    ) -> Self {
        Self {
            root: Arc::new(Capsule::root(host_bindings, visibility)),
            loader,
            staging_dir,
            packages: DashMap::new(),
            capsules: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Arc<Capsule> {
        &self.root
    }

    /// Register (or replace) the package backing a plugin name. Replacement
    /// affects only capsules created afterwards.
    pub fn register_package(&self, package: Arc<PluginPackage>) {
        let name = package.name().to_string();
        if self.packages.insert(name.clone(), package).is_some() {
            debug!(plugin = %name, "replaced registered package");
        }
    }

    pub fn package(&self, plugin_name: &str) -> Option<Arc<PluginPackage>> {
        self.packages.get(plugin_name).map(|entry| entry.clone())
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Get the capsule for a plugin, creating and caching it on first use.
    pub fn obtain_capsule(&self, plugin_name: &str) -> Result<Arc<Capsule>, CapsuleError> {
        let mut capsules = self.capsules.lock();
        if let Some(capsule) = capsules.get(plugin_name) {
            return Ok(capsule.clone());
        }

        let package = self
            .packages
            .get(plugin_name)
            .map(|entry| entry.clone())
            .ok_or_else(|| CapsuleError::PackageNotFound(plugin_name.to_string()))?;

        let contents_dir = self.stage_package(&package)?;
        let runtime = self.loader.load(&package, &contents_dir)?;
        info!(
            plugin = %plugin_name,
            listeners = runtime.bindings.listener_names().len(),
            invocables = runtime.bindings.invocable_names().len(),
            "created capsule"
        );

        let capsule = Arc::new(Capsule {
            name: plugin_name.to_string(),
            package: Some(package),
            contents_dir: Some(contents_dir),
            runtime,
            parent: Some(self.root.clone()),
            visibility: None,
        });
        capsules.insert(plugin_name.to_string(), capsule.clone());
        Ok(capsule)
    }

    /// Cached capsules, in no particular order.
    pub fn capsules(&self) -> Vec<Arc<Capsule>> {
        self.capsules.lock().values().cloned().collect()
    }

    pub fn capsule_count(&self) -> usize {
        self.capsules.lock().len()
    }

    /// Drop every cached capsule and remove staged package copies.
    /// Idempotent; the manager can create capsules again afterwards.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Arc<Capsule>)> = self.capsules.lock().drain().collect();
        for (name, capsule) in drained {
            debug!(plugin = %name, "destroying capsule");
            if let Some(dir) = capsule.contents_dir() {
                if dir.starts_with(&self.staging_dir) {
                    if let Err(error) = std::fs::remove_dir_all(dir) {
                        warn!(plugin = %name, error = %error, "failed to remove staged package");
                    }
                }
            }
        }
    }

    /// Stage a package for loading. Archives are extracted under the staging
    /// directory; exploded packages are used in place.
    fn stage_package(&self, package: &PluginPackage) -> Result<PathBuf, CapsuleError> {
        if package.is_exploded() {
            return Ok(package.location.clone());
        }

        let dest = self.staging_dir.join(package.name());
        if dest.exists() {
            std::fs::remove_dir_all(&dest).map_err(|source| CapsuleError::Staging {
                path: dest.clone(),
                source,
            })?;
        }
        std::fs::create_dir_all(&dest).map_err(|source| CapsuleError::Staging {
            path: dest.clone(),
            source,
        })?;

        let file = File::open(&package.location).map_err(|source| CapsuleError::Staging {
            path: package.location.clone(),
            source,
        })?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|source| CapsuleError::Archive {
                path: package.location.clone(),
                source,
            })?;
        archive
            .extract(&dest)
            .map_err(|source| CapsuleError::Archive {
                path: package.location.clone(),
                source,
            })?;
        debug!(
            plugin = %package.name(),
            dest = %dest.display(),
            "staged plugin archive"
        );
        Ok(dest)
    }
}

/// Loads plugin cdylibs via their exported [`PluginDecl`] static.
///
/// [`PluginDecl`]: vantage_plugin_api::PluginDecl
#[derive(Debug, Default)]
pub struct DylibCapsuleLoader;

impl CapsuleLoader for DylibCapsuleLoader {
    fn load(
        &self,
        package: &PluginPackage,
        contents_dir: &Path,
    ) -> Result<CapsuleRuntime, CapsuleError> {
        let library_path = find_plugin_library(contents_dir)?;
        debug!(
            plugin = %package.name(),
            library = %library_path.display(),
            "loading plugin library"
        );

        // SAFETY: loading and resolving symbols from a plugin library runs
        // arbitrary initialization code; the symbol layout is pinned by the
        // plugin API's exported static.
        let library = unsafe { Library::new(&library_path) }.map_err(|error| {
            CapsuleError::Library {
                path: library_path.clone(),
                message: error.to_string(),
            }
        })?;

        let decl = unsafe {
            let symbol = library
                .get::<*const vantage_plugin_api::PluginDecl>(PLUGIN_DECL_SYMBOL.as_bytes())
                .map_err(|error| CapsuleError::Library {
                    path: library_path.clone(),
                    message: format!("missing symbol [{PLUGIN_DECL_SYMBOL}]: {error}"),
                })?;
            &**symbol
        };

        if !api_compatible(decl.api_version, PLUGIN_API_VERSION) {
            return Err(CapsuleError::ApiVersionMismatch {
                plugin: package.name().to_string(),
                plugin_api: decl.api_version.to_string(),
                host_api: PLUGIN_API_VERSION.to_string(),
            });
        }

        let mut bindings = PluginRegistrar::new();
        guard_plugin_value(|| (decl.register)(&mut bindings)).map_err(|error| {
            CapsuleError::Library {
                path: library_path.clone(),
                message: format!("registration failed: {error}"),
            }
        })?;

        Ok(CapsuleRuntime {
            bindings,
            library: Some(library),
        })
    }
}

/// Find the plugin's dynamic library inside its staged contents: first in
/// `lib/`, then at the package root.
fn find_plugin_library(contents_dir: &Path) -> Result<PathBuf, CapsuleError> {
    for dir in [contents_dir.join("lib"), contents_dir.to_path_buf()] {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut libraries: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_dynamic_library(path))
            .collect();
        libraries.sort();
        if let Some(library) = libraries.into_iter().next() {
            return Ok(library);
        }
    }
    Err(CapsuleError::Library {
        path: contents_dir.to_path_buf(),
        message: "no dynamic library found in package".to_string(),
    })
}

fn is_dynamic_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "so" | "dylib" | "dll"))
}
