//! Job schedules declared in plugin descriptors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// When and how a plugin job fires.
///
/// `concurrent = false` asks the scheduler collaborator to guarantee at most
/// one in-flight invocation of the job identity at any time, across however
/// many server processes cooperate. `concurrent = true` allows overlapping
/// invocations. Omitted in YAML it defaults to `false`, the safe choice for
/// stateful listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Fire every `interval_ms` milliseconds.
    Periodic {
        interval_ms: u64,
        #[serde(default)]
        concurrent: bool,
    },
    /// Fire per a cron expression (standard 6/7-field syntax with seconds).
    Cron {
        expression: String,
        #[serde(default)]
        concurrent: bool,
    },
}

impl Schedule {
    /// A non-concurrent periodic schedule.
    pub fn periodic(interval_ms: u64) -> Self {
        Schedule::Periodic {
            interval_ms,
            concurrent: false,
        }
    }

    /// A non-concurrent cron schedule.
    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
            concurrent: false,
        }
    }

    /// Allow overlapping invocations.
    pub fn with_concurrent(mut self, allow: bool) -> Self {
        match &mut self {
            Schedule::Periodic { concurrent, .. } | Schedule::Cron { concurrent, .. } => {
                *concurrent = allow;
            }
        }
        self
    }

    /// Whether overlapping invocations of this job identity are permitted.
    pub fn concurrent(&self) -> bool {
        match self {
            Schedule::Periodic { concurrent, .. } | Schedule::Cron { concurrent, .. } => {
                *concurrent
            }
        }
    }
}

/// What a triggered job invokes, resolved once at trigger time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    /// The plugin's already-running lifecycle listener (stateful across
    /// invocations).
    UseListener,
    /// A fresh instance of the named plugin-provided class, created inside
    /// the capsule for this invocation only (stateless per fire).
    InstantiateClass(String),
}

fn default_enabled() -> bool {
    true
}

/// A named job declared in a plugin descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJobDefinition {
    /// Unique within the declaring plugin.
    pub job_id: String,

    /// Name of a plugin-registered invocable to instantiate per fire.
    /// Absent means the job targets the plugin's lifecycle listener.
    #[serde(default)]
    pub class: Option<String>,

    pub schedule: Schedule,

    /// Disabled jobs stay in the descriptor but are never registered.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// String-valued callback properties redelivered with every trigger.
    /// Only strings survive the scheduler's payload transport.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ScheduledJobDefinition {
    pub fn target(&self) -> JobTarget {
        match &self.class {
            Some(class) => JobTarget::InstantiateClass(class.clone()),
            None => JobTarget::UseListener,
        }
    }
}
