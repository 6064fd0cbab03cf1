//! Transfer drivers
//!
//! A driver turns a transfer request into a one-shot Kubernetes Job running
//! `kdmp-executor`, then reports on it. All drivers share one launch path
//! ([`worker`]): idempotent by job name, gated by a per-driver concurrency
//! limit, and provisioning a narrowly scoped service account, a job-scoped
//! credentials secret and a VolumeBackup progress record next to the job.

pub mod credentials;
pub mod driver;
mod engine;
pub mod error;
pub mod kopia;
pub mod kube_client;
pub mod limiter;
pub mod rbac;
pub mod registry;
pub mod restic;
pub mod rsync;
pub mod status;
pub mod template;
pub mod worker;

pub use driver::{
    job_id, parse_job_id, DriverName, JobInfo, JobOptions, JobState, LiveSource, ObjectKey,
    TransferDriver,
};
pub use error::DriverError;
pub use registry::DriverRegistry;
pub use worker::{DriverContext, JobPlan};
