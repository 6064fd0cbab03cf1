//! Restic backup and restore drivers

use async_trait::async_trait;

use crate::engine::{self, Engine};
use crate::{DriverContext, DriverError, DriverName, JobInfo, JobOptions, TransferDriver};

/// Back up a PVC into a restic repository
pub struct ResticBackup {
    ctx: DriverContext,
}

impl ResticBackup {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TransferDriver for ResticBackup {
    fn name(&self) -> DriverName {
        DriverName::ResticBackup
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let (plan, command) = engine::backup(self.name(), Engine::Restic, opts)?;
        self.ctx.launch(opts, plan, move |_| command).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        self.ctx.delete(id).await
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        self.ctx.status(id, true).await
    }
}

/// Restore a restic snapshot into a PVC
pub struct ResticRestore {
    ctx: DriverContext,
}

impl ResticRestore {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TransferDriver for ResticRestore {
    fn name(&self) -> DriverName {
        DriverName::ResticRestore
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let (plan, command) = engine::restore(self.name(), Engine::Restic, opts)?;
        self.ctx.launch(opts, plan, move |_| command).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        self.ctx.delete(id).await
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        self.ctx.status(id, true).await
    }
}
