//! Plugin descriptor and identity types.
//!
//! Every plugin package carries a YAML descriptor at [`DESCRIPTOR_PATH`]
//! naming the plugin, its category (which selects the owning type container
//! on the server), an optional lifecycle listener, and any declared job
//! schedules.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::schedule::{JobTarget, Schedule, ScheduledJobDefinition};

/// Fixed path of the descriptor inside a plugin package.
pub const DESCRIPTOR_PATH: &str = "META/plugin.yaml";

/// Plugin categories the server knows how to host.
///
/// The master container routes each discovered package to the type
/// container matching its category; exactly one container exists per
/// category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    /// General-purpose plugins with no specialized container behavior.
    Generic,
    /// Content-source plugins (package/content synchronization).
    Content,
    /// Alert-sender plugins.
    Alert,
    /// Bundle-deployment plugins.
    Bundle,
}

impl PluginCategory {
    /// All categories, in routing order.
    pub fn all() -> [PluginCategory; 4] {
        [
            PluginCategory::Generic,
            PluginCategory::Content,
            PluginCategory::Alert,
            PluginCategory::Bundle,
        ]
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginCategory::Generic => write!(f, "generic"),
            PluginCategory::Content => write!(f, "content"),
            PluginCategory::Alert => write!(f, "alert"),
            PluginCategory::Bundle => write!(f, "bundle"),
        }
    }
}

/// Failure to parse a [`PluginCategory`] from its string form.
#[derive(Debug, thiserror::Error)]
#[error("unknown plugin category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for PluginCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(PluginCategory::Generic),
            "content" => Ok(PluginCategory::Content),
            "alert" => Ok(PluginCategory::Alert),
            "bundle" => Ok(PluginCategory::Bundle),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// Globally unique plugin identity: category plus descriptor name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PluginKey {
    pub category: PluginCategory,
    pub name: String,
}

impl PluginKey {
    pub fn new(category: PluginCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

/// Errors raised while parsing or validating a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid descriptor: {0}")]
    Invalid(String),
}

/// Parsed plugin descriptor (`META/plugin.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin name within its category.
    pub name: String,

    pub category: PluginCategory,

    pub version: semver::Version,

    /// Registered name of the lifecycle listener to instantiate at load
    /// time. Absent means the plugin has no running component.
    #[serde(default)]
    pub listener: Option<String>,

    /// Global schedule, registered under the job id `"<global>"`.
    #[serde(default)]
    pub schedule: Option<Schedule>,

    /// Named scheduled jobs.
    #[serde(default)]
    pub jobs: Vec<ScheduledJobDefinition>,

    /// Plugin configuration handed to the plugin through its context.
    #[serde(default)]
    pub config: serde_json::Value,

    #[serde(default)]
    pub description: String,
}

impl PluginDescriptor {
    pub fn key(&self) -> PluginKey {
        PluginKey::new(self.category, self.name.clone())
    }

    /// Parse and validate a descriptor from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, DescriptorError> {
        let descriptor: PluginDescriptor = serde_yaml::from_str(yaml)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Parse and validate a descriptor from a reader (e.g. an archive entry).
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, DescriptorError> {
        let descriptor: PluginDescriptor = serde_yaml::from_reader(reader)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::Invalid("plugin name is empty".into()));
        }

        let mut seen = BTreeSet::new();
        for job in &self.jobs {
            if job.job_id.trim().is_empty() {
                return Err(DescriptorError::Invalid(format!(
                    "plugin [{}] declares a job with an empty id",
                    self.name
                )));
            }
            if !seen.insert(job.job_id.as_str()) {
                return Err(DescriptorError::Invalid(format!(
                    "plugin [{}] declares duplicate job id [{}]",
                    self.name, job.job_id
                )));
            }
            if job.target() == JobTarget::UseListener && self.listener.is_none() {
                return Err(DescriptorError::Invalid(format!(
                    "plugin [{}] job [{}] targets the lifecycle listener but none is declared",
                    self.name, job.job_id
                )));
            }
        }

        if self.schedule.is_some() && self.listener.is_none() {
            return Err(DescriptorError::Invalid(format!(
                "plugin [{}] declares a global schedule but no lifecycle listener",
                self.name
            )));
        }

        Ok(())
    }
}
