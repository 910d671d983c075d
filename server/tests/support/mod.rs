//! Shared fixtures: an in-process capsule loader, probe listeners that
//! record every callback, and a recording scheduler mock.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vantage_plugin_api::{
    JobInvocable, PluginContext, PluginError, PluginLifecycle, PluginRegistrar, DESCRIPTOR_PATH,
};
use vantage_server::plugin::{
    CapsuleError, CapsuleLoader, CapsuleRuntime, JobDetail, JobScheduler, PluginPackage,
    SchedulerError,
};

/// Shared event log; entries look like `"plugin:hook"`.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn new_event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events_for(log: &EventLog, plugin: &str) -> Vec<String> {
    let prefix = format!("{plugin}:");
    log.lock()
        .iter()
        .filter(|event| event.starts_with(&prefix))
        .cloned()
        .collect()
}

/// Knobs for one probe listener, shared with the test body.
#[derive(Default)]
pub struct ProbeBehavior {
    pub fail_initialize: AtomicBool,
    pub fail_execute: AtomicBool,
    pub panic_execute: AtomicBool,
    pub panic_shutdown: AtomicBool,
}

pub struct ProbeListener {
    plugin: String,
    log: EventLog,
    behavior: Arc<ProbeBehavior>,
}

impl ProbeListener {
    pub fn new(plugin: &str, log: EventLog, behavior: Arc<ProbeBehavior>) -> Self {
        Self {
            plugin: plugin.to_string(),
            log,
            behavior,
        }
    }

    fn record(&self, hook: &str) {
        self.log.lock().push(format!("{}:{hook}", self.plugin));
    }
}

impl PluginLifecycle for ProbeListener {
    fn initialize(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
        self.record("initialize");
        if self.behavior.fail_initialize.load(Ordering::SeqCst) {
            return Err(PluginError::InitializationFailed("probe refused".into()));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), PluginError> {
        self.record("start");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PluginError> {
        self.record("stop");
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), PluginError> {
        self.record("shutdown");
        if self.behavior.panic_shutdown.load(Ordering::SeqCst) {
            panic!("probe shutdown panic");
        }
        Ok(())
    }

    fn as_invocable(&mut self) -> Option<&mut dyn JobInvocable> {
        Some(self)
    }
}

impl JobInvocable for ProbeListener {
    fn execute(
        &mut self,
        job_id: &str,
        _ctx: &PluginContext,
        _properties: &BTreeMap<String, String>,
    ) -> Result<(), PluginError> {
        self.record(&format!("execute:{job_id}"));
        if self.behavior.panic_execute.load(Ordering::SeqCst) {
            panic!("probe execute panic");
        }
        if self.behavior.fail_execute.load(Ordering::SeqCst) {
            return Err(PluginError::JobFailed("probe job failed".into()));
        }
        Ok(())
    }
}

/// A stateless invocable that counts constructions and executions.
pub struct CountingInvocable {
    pub ctor_count: Arc<AtomicUsize>,
    pub exec_count: Arc<AtomicUsize>,
}

impl JobInvocable for CountingInvocable {
    fn execute(
        &mut self,
        _job_id: &str,
        _ctx: &PluginContext,
        _properties: &BTreeMap<String, String>,
    ) -> Result<(), PluginError> {
        self.exec_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type BindingsFn = Box<dyn Fn(&mut PluginRegistrar) + Send + Sync>;

/// Capsule loader resolving plugins to in-process registration functions.
#[derive(Default)]
pub struct MapLoader {
    bindings: Mutex<std::collections::HashMap<String, BindingsFn>>,
    load_counts: Mutex<std::collections::HashMap<String, usize>>,
}

impl MapLoader {
    pub fn register(&self, plugin: &str, bindings: impl Fn(&mut PluginRegistrar) + Send + Sync + 'static) {
        self.bindings
            .lock()
            .insert(plugin.to_string(), Box::new(bindings));
    }

    /// Register a plugin whose listener is a [`ProbeListener`] bound as
    /// `"probe::Listener"`.
    pub fn register_probe(
        &self,
        plugin: &'static str,
        log: EventLog,
    ) -> Arc<ProbeBehavior> {
        let behavior = Arc::new(ProbeBehavior::default());
        let listener_behavior = behavior.clone();
        self.register(plugin, move |registrar| {
            let log = log.clone();
            let behavior = listener_behavior.clone();
            registrar.register_listener("probe::Listener", move || {
                Box::new(ProbeListener::new(plugin, log.clone(), behavior.clone()))
            });
        });
        behavior
    }

    pub fn load_count(&self, plugin: &str) -> usize {
        self.load_counts.lock().get(plugin).copied().unwrap_or(0)
    }
}

impl CapsuleLoader for MapLoader {
    fn load(
        &self,
        package: &PluginPackage,
        _contents_dir: &Path,
    ) -> Result<CapsuleRuntime, CapsuleError> {
        *self
            .load_counts
            .lock()
            .entry(package.name().to_string())
            .or_insert(0) += 1;
        let bindings = self.bindings.lock();
        let mut registrar = PluginRegistrar::new();
        if let Some(register) = bindings.get(package.name()) {
            register(&mut registrar);
        }
        Ok(CapsuleRuntime::from_bindings(registrar))
    }
}

/// Records every scheduler interaction instead of firing anything.
#[derive(Default)]
pub struct RecordingScheduler {
    pub scheduled: Mutex<Vec<JobDetail>>,
    pub unscheduled: Mutex<Vec<(String, String)>>,
    pub shut_down: AtomicBool,
}

impl RecordingScheduler {
    pub fn detail(&self, job_id: &str) -> Option<JobDetail> {
        self.scheduled
            .lock()
            .iter()
            .rev()
            .find(|detail| detail.job_id == job_id)
            .cloned()
    }

    pub fn unschedule_count(&self, job_id: &str) -> usize {
        self.unscheduled
            .lock()
            .iter()
            .filter(|(unscheduled_id, _)| unscheduled_id == job_id)
            .count()
    }
}

impl JobScheduler for RecordingScheduler {
    fn schedule(&self, detail: JobDetail) -> Result<(), SchedulerError> {
        self.scheduled.lock().push(detail);
        Ok(())
    }

    fn unschedule(&self, job_id: &str, group_id: &str) -> Result<bool, SchedulerError> {
        self.unscheduled
            .lock()
            .push((job_id.to_string(), group_id.to_string()));
        Ok(true)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Write an exploded plugin package under `dir` and return its path.
pub fn write_package(dir: &Path, name: &str, yaml: &str) -> std::path::PathBuf {
    let package_dir = dir.join(name);
    std::fs::create_dir_all(package_dir.join("META")).unwrap();
    std::fs::write(package_dir.join(DESCRIPTOR_PATH), yaml).unwrap();
    package_dir
}

/// Minimal descriptor with a probe listener.
pub fn probe_descriptor(name: &str, category: &str) -> String {
    format!(
        "name: {name}\ncategory: {category}\nversion: 1.0.0\nlistener: \"probe::Listener\"\n"
    )
}
