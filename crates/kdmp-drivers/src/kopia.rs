//! Kopia drivers
//!
//! Backup and restore move data; delete and maintenance only touch the
//! repository, so they run without a PVC and report no progress.

use async_trait::async_trait;

use crate::engine::{self, Engine};
use crate::{DriverContext, DriverError, DriverName, JobInfo, JobOptions, TransferDriver};

pub struct KopiaBackup {
    ctx: DriverContext,
}

impl KopiaBackup {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TransferDriver for KopiaBackup {
    fn name(&self) -> DriverName {
        DriverName::KopiaBackup
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let (plan, command) = engine::backup(self.name(), Engine::Kopia, opts)?;
        self.ctx.launch(opts, plan, move |_| command).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        self.ctx.delete(id).await
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        self.ctx.status(id, true).await
    }
}

pub struct KopiaRestore {
    ctx: DriverContext,
}

impl KopiaRestore {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TransferDriver for KopiaRestore {
    fn name(&self) -> DriverName {
        DriverName::KopiaRestore
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let (plan, command) = engine::restore(self.name(), Engine::Kopia, opts)?;
        self.ctx.launch(opts, plan, move |_| command).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        self.ctx.delete(id).await
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        self.ctx.status(id, true).await
    }
}

/// Remove one engine snapshot from a repository
pub struct KopiaDelete {
    ctx: DriverContext,
}

impl KopiaDelete {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TransferDriver for KopiaDelete {
    fn name(&self) -> DriverName {
        DriverName::KopiaDelete
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let snapshot_id = opts.require_snapshot_id(self.name())?;
        let (plan, command) =
            engine::repository_task(self.name(), "delete", opts, Some(snapshot_id))?;
        self.ctx.launch(opts, plan, move |_| command).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        self.ctx.delete(id).await
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        self.ctx.status(id, false).await
    }
}

/// Run repository maintenance; limited to one job at a time by default
pub struct KopiaMaintenance {
    ctx: DriverContext,
}

impl KopiaMaintenance {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TransferDriver for KopiaMaintenance {
    fn name(&self) -> DriverName {
        DriverName::KopiaMaintenance
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let (plan, command) = engine::repository_task(self.name(), "maintenance", opts, None)?;
        self.ctx.launch(opts, plan, move |_| command).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        self.ctx.delete(id).await
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        self.ctx.status(id, false).await
    }
}
