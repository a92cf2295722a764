//! cast-jobs: the job/resource execution engine.
//!
//! Every mutating operation of the agent is a job targeting exactly one
//! named resource. Jobs against the same resource run one at a time in
//! admission order, and each job's CRUD intent is checked against the
//! resource's existence right before it runs.

pub mod error;
pub mod job;
pub mod manager;
pub mod registry;
pub mod resource;

pub use error::{HookFailure, JobError, JobResult};
pub use job::{
    JobContext, JobEvent, JobHandle, JobId, JobOptions, JobOutcome, JobResultView, JobSnapshot,
    JobStatus,
};
pub use manager::{JobManager, Manager, ManagerKind};
pub use registry::JobRegistry;
pub use resource::{Job, JobSpec, Resource, ResourceIndex, ResourceSlot};
