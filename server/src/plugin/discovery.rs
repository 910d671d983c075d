//! Plugin package discovery.
//!
//! The plugin directory is scanned non-recursively. Two package layouts are
//! accepted: `.vpk` archives (zip files carrying the descriptor at
//! `META/plugin.yaml`) and exploded directories with the same internal
//! layout. Anything else in the directory is ignored.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use vantage_plugin_api::{PluginDescriptor, PluginKey, DESCRIPTOR_PATH};

use super::error::PackageError;

/// File extension of archive plugin packages.
pub const PACKAGE_EXTENSION: &str = "vpk";

/// A discovered plugin package: where it lives plus its parsed descriptor.
#[derive(Debug, Clone)]
pub struct PluginPackage {
    /// Path to the `.vpk` archive or the exploded package directory.
    pub location: PathBuf,
    pub descriptor: PluginDescriptor,
}

impl PluginPackage {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn key(&self) -> PluginKey {
        self.descriptor.key()
    }

    /// Whether the package is an exploded directory rather than an archive.
    pub fn is_exploded(&self) -> bool {
        self.location.is_dir()
    }
}

/// A package that could not be read during a scan. Recorded and skipped;
/// never aborts discovery of sibling packages.
#[derive(Debug)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Scan a plugin directory for packages.
///
/// A missing directory yields an empty result. Unreadable or invalid
/// packages, and packages whose plugin name collides with an earlier one,
/// are reported as failures alongside the packages that did parse.
pub fn discover_packages(dir: &Path) -> (Vec<Arc<PluginPackage>>, Vec<DiscoveryFailure>) {
    let mut packages: BTreeMap<String, Arc<PluginPackage>> = BTreeMap::new();
    let mut failures = Vec::new();

    if !dir.is_dir() {
        debug!(dir = %dir.display(), "plugin directory does not exist, nothing to discover");
        return (Vec::new(), failures);
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) => {
            failures.push(DiscoveryFailure {
                path: dir.to_path_buf(),
                message: format!("cannot scan plugin directory: {source}"),
            });
            return (Vec::new(), failures);
        }
    };

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_package_candidate(path))
        .collect();
    candidates.sort();

    for path in candidates {
        match read_package(&path) {
            Ok(package) => {
                let name = package.name().to_string();
                if let Some(existing) = packages.get(&name) {
                    warn!(
                        plugin = %name,
                        kept = %existing.location.display(),
                        skipped = %path.display(),
                        "duplicate plugin name, keeping the first package"
                    );
                    failures.push(DiscoveryFailure {
                        path,
                        message: format!("duplicate plugin name [{name}]"),
                    });
                } else {
                    debug!(plugin = %name, path = %path.display(), "discovered plugin package");
                    packages.insert(name, Arc::new(package));
                }
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "skipping unreadable plugin package");
                failures.push(DiscoveryFailure {
                    path,
                    message: error.to_string(),
                });
            }
        }
    }

    (packages.into_values().collect(), failures)
}

fn is_package_candidate(path: &Path) -> bool {
    if path.is_dir() {
        return path.join(DESCRIPTOR_PATH).is_file();
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION))
}

/// Read and validate one plugin package, archive or exploded.
pub fn read_package(path: &Path) -> Result<PluginPackage, PackageError> {
    let descriptor = if path.is_dir() {
        read_exploded_descriptor(path)?
    } else {
        read_archive_descriptor(path)?
    };
    Ok(PluginPackage {
        location: path.to_path_buf(),
        descriptor,
    })
}

fn read_exploded_descriptor(dir: &Path) -> Result<PluginDescriptor, PackageError> {
    let descriptor_path = dir.join(DESCRIPTOR_PATH);
    let file = File::open(&descriptor_path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            PackageError::MissingDescriptor {
                path: dir.to_path_buf(),
                entry: DESCRIPTOR_PATH,
            }
        } else {
            PackageError::Io {
                path: descriptor_path.clone(),
                source,
            }
        }
    })?;
    PluginDescriptor::from_reader(file).map_err(|source| PackageError::Descriptor {
        path: dir.to_path_buf(),
        source,
    })
}

fn read_archive_descriptor(archive_path: &Path) -> Result<PluginDescriptor, PackageError> {
    let file = File::open(archive_path).map_err(|source| PackageError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| PackageError::Archive {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let entry = match archive.by_name(DESCRIPTOR_PATH) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(PackageError::MissingDescriptor {
                path: archive_path.to_path_buf(),
                entry: DESCRIPTOR_PATH,
            })
        }
        Err(source) => {
            return Err(PackageError::Archive {
                path: archive_path.to_path_buf(),
                source,
            })
        }
    };
    PluginDescriptor::from_reader(entry).map_err(|source| PackageError::Descriptor {
        path: archive_path.to_path_buf(),
        source,
    })
}
