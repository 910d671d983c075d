//! The server plugin container subsystem.
//!
//! Structure, bottom-up:
//! - [`discovery`]: find plugin packages (`.vpk` archives or exploded
//!   directories) and parse their descriptors
//! - [`capsule`]: per-plugin isolation environments and the loader seam
//! - [`isolation`]: panic containment around every call into plugin code
//! - [`registry`]: per-category bookkeeping of loaded plugins and their
//!   listener instances
//! - [`container`]: the per-category lifecycle state machine
//! - [`master`]: the orchestrator tying it all together
//! - [`scheduler`]: the bridge to the job scheduler, plus the in-process
//!   scheduler implementation

pub mod capsule;
pub mod container;
pub mod discovery;
pub mod error;
pub mod isolation;
pub mod master;
pub mod registry;
pub mod scheduler;

pub use capsule::{Capsule, CapsuleLoader, CapsuleManager, CapsuleRuntime, DylibCapsuleLoader};
pub use container::{ContainerState, TypeContainer};
pub use discovery::{discover_packages, read_package, PluginPackage, PACKAGE_EXTENSION};
pub use error::{
    CapsuleError, ContainerError, JobError, MasterError, PackageError, RegistryError,
    SchedulerError,
};
pub use master::{
    InitializationReport, MasterBuilder, MasterContainer, MasterState, MasterStatus,
    PluginProblem,
};
pub use registry::{ListenerHandle, PluginEnvironment, PluginRegistry};
pub use scheduler::{
    scheduled_job_id, JobDetail, JobInvocationRecord, JobPayload, JobScheduler, LocalScheduler,
    SchedulingBridge, TriggerExecutor, GLOBAL_JOB_ID, KEY_CATEGORY, KEY_JOB_ID, KEY_PLUGIN_NAME,
    KEY_TARGET_CLASS,
};
