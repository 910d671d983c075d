//! The scheduling bridge between the server and its job scheduler.
//!
//! Plugins never see the scheduler. Outbound, the bridge turns declared
//! schedules into [`JobDetail`] registrations against a [`JobScheduler`]
//! collaborator; inbound, it is the [`TriggerExecutor`] the scheduler fires
//! into, reconstructing a [`JobInvocationRecord`] from the string-only
//! trigger payload and dispatching into the owning plugin's capsule.
//!
//! Registration always replaces: scheduling a job identity that already has
//! a trigger drops the old trigger. A job whose invocation fails has its
//! trigger unscheduled and is never retried; it returns at the next restart
//! or redeploy.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use vantage_plugin_api::{JobTarget, PluginCategory, Schedule};

use super::error::{JobError, SchedulerError};
use super::isolation::{guard_plugin_call, guard_plugin_value};
use super::master::MasterContainer;

/// Job id under which a plugin's global schedule is registered.
pub const GLOBAL_JOB_ID: &str = "<global>";

/// Reserved payload keys. User properties may not start with `__`.
pub const KEY_PLUGIN_NAME: &str = "__plugin_name";
pub const KEY_CATEGORY: &str = "__category";
pub const KEY_JOB_ID: &str = "__job_id";
pub const KEY_TARGET_CLASS: &str = "__target_class";

const RESERVED_PREFIX: &str = "__";

/// The string-only payload a scheduler persists and redelivers verbatim
/// with every trigger fire.
pub type JobPayload = BTreeMap<String, String>;

/// One trigger registration handed to the scheduler.
#[derive(Debug, Clone)]
pub struct JobDetail {
    /// Unique within `group_id`; `<plugin>:<declared job id>`.
    pub job_id: String,
    /// The owning container's category.
    pub group_id: String,
    pub schedule: Schedule,
    pub payload: JobPayload,
}

/// The scheduler collaborator.
///
/// In a clustered deployment this is backed by a distributed scheduler that
/// honors `concurrent = false` across all server processes; the in-process
/// [`LocalScheduler`] honors it within one process.
pub trait JobScheduler: Send + Sync {
    /// Register a trigger, replacing any existing trigger for the same
    /// `(job_id, group_id)` identity.
    fn schedule(&self, detail: JobDetail) -> Result<(), SchedulerError>;

    /// Remove a trigger. Returns whether one existed.
    fn unschedule(&self, job_id: &str, group_id: &str) -> Result<bool, SchedulerError>;

    /// Stop firing and drop all triggers.
    fn shutdown(&self);
}

/// The inbound seam the scheduler fires into on every trigger.
pub trait TriggerExecutor: Send + Sync {
    /// Invoked by the scheduler, on a thread where blocking is acceptable.
    /// Must not panic; all failure handling happens inside.
    fn execute(&self, job_id: &str, group_id: &str, payload: &JobPayload);
}

/// Everything needed to route one trigger fire to plugin code,
/// reconstructed from the payload alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInvocationRecord {
    pub plugin_name: String,
    pub category: PluginCategory,
    /// The declared job id ([`GLOBAL_JOB_ID`] for the global schedule).
    pub job_id: String,
    pub target: JobTarget,
    /// User properties, reserved keys stripped.
    pub properties: JobPayload,
}

impl JobInvocationRecord {
    /// Flatten into the string map a scheduler can persist. Properties
    /// colliding with the reserved prefix are dropped with a warning.
    pub fn to_payload(&self) -> JobPayload {
        let mut payload = JobPayload::new();
        payload.insert(KEY_PLUGIN_NAME.to_string(), self.plugin_name.clone());
        payload.insert(KEY_CATEGORY.to_string(), self.category.to_string());
        payload.insert(KEY_JOB_ID.to_string(), self.job_id.clone());
        if let JobTarget::InstantiateClass(class) = &self.target {
            payload.insert(KEY_TARGET_CLASS.to_string(), class.clone());
        }
        for (key, value) in &self.properties {
            if key.starts_with(RESERVED_PREFIX) {
                warn!(
                    plugin = %self.plugin_name,
                    job = %self.job_id,
                    property = %key,
                    "dropping job property that collides with a reserved payload key"
                );
                continue;
            }
            payload.insert(key.clone(), value.clone());
        }
        payload
    }

    /// Rebuild a record from a redelivered payload.
    pub fn from_payload(payload: &JobPayload) -> Result<Self, JobError> {
        let required = |key: &'static str| {
            payload
                .get(key)
                .cloned()
                .ok_or(JobError::MalformedPayload(key))
        };
        let plugin_name = required(KEY_PLUGIN_NAME)?;
        let category = PluginCategory::from_str(&required(KEY_CATEGORY)?)?;
        let job_id = required(KEY_JOB_ID)?;
        let target = match payload.get(KEY_TARGET_CLASS) {
            Some(class) => JobTarget::InstantiateClass(class.clone()),
            None => JobTarget::UseListener,
        };
        let properties = payload
            .iter()
            .filter(|(key, _)| !key.starts_with(RESERVED_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Self {
            plugin_name,
            category,
            job_id,
            target,
            properties,
        })
    }
}

/// Scheduler-facing identity of a declared job.
pub fn scheduled_job_id(plugin_name: &str, declared_job_id: &str) -> String {
    format!("{plugin_name}:{declared_job_id}")
}

/// Connects the master container to the scheduler in both directions.
pub struct SchedulingBridge {
    master: Weak<MasterContainer>,
}

impl SchedulingBridge {
    pub(crate) fn new(master: Weak<MasterContainer>) -> Self {
        Self { master }
    }

    /// Register one declared job of a loaded plugin with the scheduler.
    pub fn register(
        &self,
        environment: &super::registry::PluginEnvironment,
        declared_job_id: &str,
        target: JobTarget,
        properties: JobPayload,
        schedule: Schedule,
    ) -> Result<(), SchedulerError> {
        let Some(master) = self.master.upgrade() else {
            return Err(SchedulerError::ShutDown);
        };
        let descriptor = environment.descriptor();
        let record = JobInvocationRecord {
            plugin_name: descriptor.name.clone(),
            category: descriptor.category,
            job_id: declared_job_id.to_string(),
            target,
            properties,
        };
        let detail = JobDetail {
            job_id: scheduled_job_id(&descriptor.name, declared_job_id),
            group_id: descriptor.category.to_string(),
            schedule,
            payload: record.to_payload(),
        };
        debug!(
            plugin = %descriptor.name,
            job = %declared_job_id,
            "registering job trigger"
        );
        master.scheduler().schedule(detail)
    }

    /// Register every declared schedule of one loaded plugin: the global
    /// schedule (if any) plus each enabled named job. Per-job failures are
    /// logged and skipped. Returns the number of triggers registered.
    pub fn register_declared_jobs(
        &self,
        environment: &super::registry::PluginEnvironment,
    ) -> usize {
        let descriptor = environment.descriptor();
        let mut declared: Vec<(String, JobTarget, JobPayload, Schedule)> = Vec::new();
        if let Some(schedule) = &descriptor.schedule {
            declared.push((
                GLOBAL_JOB_ID.to_string(),
                JobTarget::UseListener,
                JobPayload::new(),
                schedule.clone(),
            ));
        }
        for job in &descriptor.jobs {
            if !job.enabled {
                debug!(plugin = %descriptor.name, job = %job.job_id, "skipping disabled job");
                continue;
            }
            declared.push((
                job.job_id.clone(),
                job.target(),
                job.properties.clone(),
                job.schedule.clone(),
            ));
        }

        let mut registered = 0;
        for (job_id, target, properties, schedule) in declared {
            match self.register(environment, &job_id, target, properties, schedule) {
                Ok(()) => registered += 1,
                Err(register_error) => warn!(
                    plugin = %descriptor.name,
                    job = %job_id,
                    error = %register_error,
                    "failed to register job trigger"
                ),
            }
        }
        registered
    }

    /// Remove the triggers of every schedule one plugin declares.
    /// Best-effort.
    pub fn unregister_declared_jobs(&self, environment: &super::registry::PluginEnvironment) {
        let descriptor = environment.descriptor();
        let mut job_ids: Vec<&str> = Vec::new();
        if descriptor.schedule.is_some() {
            job_ids.push(GLOBAL_JOB_ID);
        }
        job_ids.extend(descriptor.jobs.iter().map(|job| job.job_id.as_str()));
        for job_id in job_ids {
            if let Err(unregister_error) =
                self.unregister(&descriptor.name, descriptor.category, job_id)
            {
                warn!(
                    plugin = %descriptor.name,
                    job = %job_id,
                    error = %unregister_error,
                    "failed to unregister job trigger"
                );
            }
        }
    }

    /// Remove the trigger for one declared job.
    pub fn unregister(
        &self,
        plugin_name: &str,
        category: PluginCategory,
        declared_job_id: &str,
    ) -> Result<bool, SchedulerError> {
        let Some(master) = self.master.upgrade() else {
            return Err(SchedulerError::ShutDown);
        };
        master.scheduler().unschedule(
            &scheduled_job_id(plugin_name, declared_job_id),
            &category.to_string(),
        )
    }

    /// The actual dispatch. Separated from [`TriggerExecutor::execute`] so
    /// failures surface as typed errors.
    fn run(&self, payload: &JobPayload) -> Result<(), JobError> {
        let record = JobInvocationRecord::from_payload(payload)?;
        let master = self.master.upgrade().ok_or(JobError::HostUnavailable)?;
        let container = master
            .container_for_category(record.category)
            .ok_or(JobError::UnknownCategory(record.category))?;
        let registry = container
            .registry()
            .map_err(|_| JobError::ContainerNotReady(record.category))?;
        let environment = registry
            .environment(&record.plugin_name)
            .ok_or_else(|| JobError::PluginNotLoaded(record.plugin_name.clone()))?;
        let ctx = registry.plugin_context(&environment)?;

        debug!(
            plugin = %record.plugin_name,
            job = %record.job_id,
            "dispatching triggered job"
        );
        match &record.target {
            JobTarget::UseListener => {
                let handle = registry
                    .listener(&record.plugin_name)
                    .ok_or_else(|| JobError::NoListener(record.plugin_name.clone()))?;
                let mut listener = handle.lock();
                let invocable = listener
                    .as_invocable()
                    .ok_or_else(|| JobError::NotInvocable(record.plugin_name.clone()))?;
                guard_plugin_call(|| {
                    invocable.execute(&record.job_id, &ctx, &record.properties)
                })?;
            }
            JobTarget::InstantiateClass(class) => {
                // Stateless: a fresh instance per fire, dropped afterwards.
                let ctor = environment.capsule.invocable_ctor(class)?;
                let mut invocable = guard_plugin_value(|| ctor())?;
                guard_plugin_call(|| {
                    invocable.execute(&record.job_id, &ctx, &record.properties)
                })?;
            }
        }
        Ok(())
    }
}

impl TriggerExecutor for SchedulingBridge {
    fn execute(&self, job_id: &str, group_id: &str, payload: &JobPayload) {
        if let Err(job_error) = self.run(payload) {
            error!(
                job = %job_id,
                group = %group_id,
                error = %job_error,
                "triggered job failed, unscheduling its trigger"
            );
            let Some(master) = self.master.upgrade() else {
                return;
            };
            match master.scheduler().unschedule(job_id, group_id) {
                Ok(true) => info!(job = %job_id, "trigger unscheduled after failure"),
                Ok(false) => {}
                Err(unschedule_error) => warn!(
                    job = %job_id,
                    error = %unschedule_error,
                    "failed to unschedule trigger after job failure"
                ),
            }
        }
    }
}

enum JobTimer {
    Periodic(Duration),
    Cron(cron::Schedule),
}

impl JobTimer {
    fn from_schedule(job_id: &str, schedule: &Schedule) -> Result<Self, SchedulerError> {
        match schedule {
            Schedule::Periodic { interval_ms: 0, .. } => {
                Err(SchedulerError::ZeroInterval(job_id.to_string()))
            }
            Schedule::Periodic { interval_ms, .. } => {
                Ok(JobTimer::Periodic(Duration::from_millis(*interval_ms)))
            }
            Schedule::Cron { expression, .. } => cron::Schedule::from_str(expression)
                .map(JobTimer::Cron)
                .map_err(|parse_error| SchedulerError::InvalidCron {
                    expression: expression.clone(),
                    message: parse_error.to_string(),
                }),
        }
    }

    /// Delay until the next fire; `None` when the schedule is exhausted.
    fn next_delay(&self) -> Option<Duration> {
        match self {
            JobTimer::Periodic(interval) => Some(*interval),
            JobTimer::Cron(schedule) => {
                let next = schedule.upcoming(chrono::Utc).next()?;
                Some(
                    (next - chrono::Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                )
            }
        }
    }
}

/// In-process scheduler driving triggers off tokio timers.
///
/// `concurrent = false` is honored within this process: the timer task waits
/// for each invocation to finish before sleeping again. A distributed
/// deployment swaps this out for a scheduler that coordinates across
/// processes.
pub struct LocalScheduler {
    executor: Arc<dyn TriggerExecutor>,
    jobs: DashMap<(String, String), tokio::task::JoinHandle<()>>,
    shut_down: AtomicBool,
}

impl LocalScheduler {
    pub fn new(executor: Arc<dyn TriggerExecutor>) -> Self {
        Self {
            executor,
            jobs: DashMap::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn trigger_count(&self) -> usize {
        self.jobs.len()
    }
}

impl JobScheduler for LocalScheduler {
    fn schedule(&self, detail: JobDetail) -> Result<(), SchedulerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        let timer = JobTimer::from_schedule(&detail.job_id, &detail.schedule)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let key = (detail.job_id.clone(), detail.group_id.clone());
        let executor = self.executor.clone();
        let concurrent = detail.schedule.concurrent();
        let JobDetail {
            job_id,
            group_id,
            payload,
            ..
        } = detail;

        let task = runtime.spawn(async move {
            loop {
                let Some(delay) = timer.next_delay() else {
                    debug!(job = %job_id, "schedule exhausted, trigger retires");
                    break;
                };
                tokio::time::sleep(delay).await;

                let executor = executor.clone();
                let (job, group, payload) =
                    (job_id.clone(), group_id.clone(), payload.clone());
                let invocation = tokio::task::spawn_blocking(move || {
                    executor.execute(&job, &group, &payload);
                });
                if concurrent {
                    // Fire and forget; overlap with the next fire is allowed.
                    drop(invocation);
                } else if invocation.await.is_err() {
                    error!(job = %job_id, "job invocation task failed");
                }
            }
        });

        if let Some(previous) = self.jobs.insert(key.clone(), task) {
            debug!(job = %key.0, "replaced existing trigger");
            previous.abort();
        }
        Ok(())
    }

    fn unschedule(&self, job_id: &str, group_id: &str) -> Result<bool, SchedulerError> {
        match self
            .jobs
            .remove(&(job_id.to_string(), group_id.to_string()))
        {
            Some((_, task)) => {
                task.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let keys: Vec<_> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, task)) = self.jobs.remove(&key) {
                task.abort();
            }
        }
        info!("local scheduler shut down");
    }
}
