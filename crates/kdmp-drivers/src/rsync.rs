//! PVC to PVC copy with rsync
//!
//! Both claims are mounted into one pod, so they must share a namespace.
//! Snapshot-restored sources are created in the destination namespace for
//! exactly this reason.

use async_trait::async_trait;

use kdmp_common::naming::job_name;

use crate::engine::EXECUTOR_BINARY;
use crate::template::{DESTINATION_MOUNT_PATH, SOURCE_MOUNT_PATH};
use crate::worker::JobPlan;
use crate::{DriverContext, DriverError, DriverName, JobInfo, JobOptions, TransferDriver};

pub struct Rsync {
    ctx: DriverContext,
}

impl Rsync {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    fn plan(&self, opts: &JobOptions) -> Result<JobPlan, DriverError> {
        let source = opts.require_source(self.name())?;
        let destination = opts.require_destination(self.name())?;
        if source.namespace != destination.namespace {
            return Err(DriverError::invalid_options(
                self.name(),
                format!(
                    "source {} and destination {} must be in the same namespace",
                    source, destination
                ),
            ));
        }
        let name = job_name(&opts.export_name, &opts.export_namespace, &source.name);
        Ok(JobPlan {
            source_pvc: Some(source.name.clone()),
            destination_pvc: Some(destination.name.clone()),
            ..JobPlan::new(self.name(), name, &destination.namespace)
        })
    }
}

fn command(flags: &[String]) -> Vec<String> {
    vec![
        EXECUTOR_BINARY.to_string(),
        "rsync".to_string(),
        "--source-path".to_string(),
        format!("{}/", SOURCE_MOUNT_PATH),
        "--destination-path".to_string(),
        format!("{}/", DESTINATION_MOUNT_PATH),
        format!("--rsync-flags={}", flags.join(" ")),
    ]
}

#[async_trait]
impl TransferDriver for Rsync {
    fn name(&self) -> DriverName {
        DriverName::Rsync
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let plan = self.plan(opts)?;
        self.ctx
            .launch(opts, plan, |config| command(&config.rsync_flags))
            .await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        self.ctx.delete(id).await
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        self.ctx.status(id, false).await
    }
}
