//! Shared launch path for every driver
//!
//! A driver describes its job as a [`JobPlan`]; [`DriverContext::launch`]
//! turns the plan into cluster objects in a fixed order: credentials secret,
//! service account and role, VolumeBackup, then the Job itself. The Job goes
//! last so a Job that exists always has everything it needs, which is what
//! makes "job already exists" a safe short-circuit on retries.

use std::sync::Arc;

use kube::api::ObjectMeta;
use tracing::{debug, info, instrument};

use kdmp_common::config::{ConfigSource, KdmpConfig};
use kdmp_common::crd::{Reference, VolumeBackup, VolumeBackupSpec};
use kdmp_common::metrics;

use crate::credentials::build_secret;
use crate::driver::ObjectKey;
use crate::kube_client::JobKubeClient;
use crate::limiter::check_job_limit;
use crate::rbac::build_rbac;
use crate::status::job_info;
use crate::template::{build_job, export_owner, job_labels, JobTemplate};
use crate::{job_id, parse_job_id, DriverError, DriverName, JobInfo, JobOptions, LiveSource};

/// Dependencies shared by all drivers
#[derive(Clone)]
pub struct DriverContext {
    pub kube: Arc<dyn JobKubeClient>,
    pub config: Arc<dyn ConfigSource>,
}

impl DriverContext {
    pub fn new(kube: Arc<dyn JobKubeClient>, config: Arc<dyn ConfigSource>) -> Self {
        Self { kube, config }
    }
}

/// What a driver wants launched
#[derive(Clone, Debug)]
pub struct JobPlan {
    pub driver: DriverName,
    pub name: String,
    pub namespace: String,
    pub source_pvc: Option<String>,
    pub destination_pvc: Option<String>,
    /// Copied into a job-scoped secret when set
    pub backup_location: Option<ObjectKey>,
    /// Progress record created next to the job when set
    pub volume_backup: Option<VolumeBackupSpec>,
    pub live: Option<LiveSource>,
}

impl JobPlan {
    pub fn new(driver: DriverName, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            driver,
            name: name.into(),
            namespace: namespace.into(),
            source_pvc: None,
            destination_pvc: None,
            backup_location: None,
            volume_backup: None,
            live: None,
        }
    }

    pub fn id(&self) -> String {
        job_id(&self.namespace, &self.name)
    }
}

/// VolumeBackup spec for a repository in `location`
pub fn volume_backup_spec(
    repository: &str,
    location: &ObjectKey,
    snapshot_id: Option<&str>,
) -> VolumeBackupSpec {
    VolumeBackupSpec {
        repository: repository.to_string(),
        backup_location: Reference::backup_location(&location.namespace, &location.name),
        snapshot_id: snapshot_id.unwrap_or_default().to_string(),
    }
}

impl DriverContext {
    /// Launch `plan`, or return the id of the job already launched for it.
    ///
    /// `command` receives the freshly loaded configuration so drivers can
    /// fold config-driven flags into the container command.
    #[instrument(skip(self, opts, plan, command), fields(driver = %plan.driver, job = %plan.id()))]
    pub async fn launch<F>(
        &self,
        opts: &JobOptions,
        plan: JobPlan,
        command: F,
    ) -> Result<String, DriverError>
    where
        F: FnOnce(&KdmpConfig) -> Vec<String> + Send,
    {
        let id = plan.id();
        if self.kube.get_job(&plan.namespace, &plan.name).await?.is_some() {
            debug!("job already exists");
            return Ok(id);
        }

        let config = self.config.load().await?;
        check_job_limit(self.kube.as_ref(), &config, plan.driver).await?;

        let (labels, annotations) = job_labels(plan.driver, opts);
        let owner = export_owner(opts, &plan.namespace);

        let secret_name = match &plan.backup_location {
            Some(key) => {
                let location = self
                    .kube
                    .get_backup_location(&key.namespace, &key.name)
                    .await?
                    .ok_or_else(|| DriverError::backup_location(key.to_string(), "not found"))?;
                let mut secret =
                    build_secret(&location, &plan.name, &plan.namespace, labels.clone())?;
                secret.metadata.owner_references = owner.clone().map(|o| vec![o]);
                self.kube.apply_secret(&secret).await?;
                Some(plan.name.as_str())
            }
            None => None,
        };

        let rbac = build_rbac(
            &plan.name,
            &plan.namespace,
            &labels,
            config.openshift_scc.as_deref(),
        );
        self.kube.apply_service_account(&rbac.service_account).await?;
        self.kube.apply_role(&rbac.role).await?;
        self.kube.apply_role_binding(&rbac.binding).await?;

        if let Some(spec) = &plan.volume_backup {
            let vb = VolumeBackup {
                metadata: ObjectMeta {
                    name: Some(plan.name.clone()),
                    namespace: Some(plan.namespace.clone()),
                    labels: Some(labels.clone()),
                    owner_references: owner.clone().map(|o| vec![o]),
                    ..Default::default()
                },
                spec: spec.clone(),
                status: None,
            };
            self.kube.create_volume_backup(&vb).await?;
        }

        let worker = config.worker(plan.driver.worker_kind());
        let job = build_job(&JobTemplate {
            name: &plan.name,
            namespace: &plan.namespace,
            worker: &worker,
            backoff_limit: config.job_backoff_limit,
            labels,
            annotations,
            owner,
            command: command(&config),
            source_pvc: plan.source_pvc.as_deref(),
            destination_pvc: plan.destination_pvc.as_deref(),
            credentials_secret: secret_name,
            live: plan.live.as_ref(),
            service_account: Some(&plan.name),
        });
        self.kube.create_job(&job).await?;

        metrics::record_job_started(plan.driver.as_str());
        info!(image = %worker.image, "started worker job");
        Ok(id)
    }

    /// Delete a job with its secret and RBAC. The VolumeBackup stays: it is
    /// the record a later restore reads.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), DriverError> {
        let (namespace, name) = parse_job_id(id)?;
        self.kube.delete_job(namespace, name).await?;
        self.kube.delete_secret(namespace, name).await?;
        self.kube.delete_rbac(namespace, name).await?;
        debug!("deleted worker job");
        Ok(())
    }

    /// Current state of a job; `with_progress` reads its VolumeBackup
    pub async fn status(&self, id: &str, with_progress: bool) -> Result<JobInfo, DriverError> {
        let (namespace, name) = parse_job_id(id)?;
        let job = self.kube.get_job(namespace, name).await?;
        let vb = match (&job, with_progress) {
            (Some(_), true) => self.kube.get_volume_backup(namespace, name).await?,
            _ => None,
        };
        Ok(job_info(id, job.as_ref(), vb.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockJobKubeClient;
    use crate::JobState;
    use k8s_openapi::api::batch::v1::Job;
    use kdmp_common::config::StaticConfigSource;
    use kdmp_common::crd::{BackupLocation, BackupLocationItem, S3Config};
    use mockall::Sequence;

    fn context(kube: MockJobKubeClient) -> DriverContext {
        DriverContext::new(
            Arc::new(kube),
            Arc::new(StaticConfigSource::new(KdmpConfig::default())),
        )
    }

    fn location() -> BackupLocation {
        BackupLocation {
            api_version: "stork.libopenstorage.org/v1alpha1".to_string(),
            kind: "BackupLocation".to_string(),
            metadata: ObjectMeta {
                name: Some("s3".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            location: BackupLocationItem {
                path: "bucket".to_string(),
                s3_config: Some(S3Config::default()),
                ..Default::default()
            },
        }
    }

    fn backup_plan() -> JobPlan {
        let key = ObjectKey::new("apps", "s3");
        JobPlan {
            source_pvc: Some("data".to_string()),
            volume_backup: Some(volume_backup_spec("apps-data", &key, None)),
            backup_location: Some(key),
            ..JobPlan::new(DriverName::KopiaBackup, "exp-apps-data", "apps")
        }
    }

    fn opts() -> JobOptions {
        let mut opts = JobOptions::new("exp", "apps");
        opts.export_uid = Some("uid-1".to_string());
        opts
    }

    // =========================================================================
    // Launch Stories
    // =========================================================================

    #[tokio::test]
    async fn story_launch_creates_dependencies_before_the_job() {
        let mut kube = MockJobKubeClient::new();
        let mut seq = Sequence::new();
        kube.expect_get_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        kube.expect_count_active_jobs()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
        kube.expect_get_backup_location()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(location())));
        kube.expect_apply_secret()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|s| s.metadata.name.as_deref() == Some("exp-apps-data"))
            .returning(|_| Ok(()));
        kube.expect_apply_service_account()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        kube.expect_apply_role()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        kube.expect_apply_role_binding()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        kube.expect_create_volume_backup()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|vb| vb.spec.repository == "apps-data")
            .returning(|_| Ok(()));
        kube.expect_create_job()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|job: &Job| {
                let owners = job.metadata.owner_references.as_ref();
                job.metadata.namespace.as_deref() == Some("apps")
                    && owners.is_some_and(|o| o[0].uid == "uid-1")
            })
            .returning(|_| Ok(()));

        let id = context(kube)
            .launch(&opts(), backup_plan(), |_| vec!["kdmp-executor".to_string()])
            .await
            .unwrap();
        assert_eq!(id, "apps/exp-apps-data");
    }

    #[tokio::test]
    async fn story_existing_job_short_circuits() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_job().returning(|_, _| Ok(Some(Job::default())));
        kube.expect_create_job().never();
        kube.expect_count_active_jobs().never();

        let id = context(kube)
            .launch(&opts(), backup_plan(), |_| Vec::new())
            .await
            .unwrap();
        assert_eq!(id, "apps/exp-apps-data");
    }

    #[tokio::test]
    async fn story_full_slots_create_nothing() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_job().returning(|_, _| Ok(None));
        kube.expect_count_active_jobs().returning(|_| Ok(5));
        kube.expect_apply_secret().never();
        kube.expect_create_job().never();

        let err = context(kube)
            .launch(&opts(), backup_plan(), |_| Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("5/5"));
    }

    #[tokio::test]
    async fn story_missing_backup_location_is_permanent() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_job().returning(|_, _| Ok(None));
        kube.expect_count_active_jobs().returning(|_| Ok(0));
        kube.expect_get_backup_location().returning(|_, _| Ok(None));
        kube.expect_create_job().never();

        let err = context(kube)
            .launch(&opts(), backup_plan(), |_| Vec::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("apps/s3"));
    }

    // =========================================================================
    // Delete and Status Stories
    // =========================================================================

    #[tokio::test]
    async fn story_delete_removes_job_secret_and_rbac() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_delete_job()
            .withf(|ns, name| ns == "apps" && name == "job")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_delete_secret().times(1).returning(|_, _| Ok(()));
        kube.expect_delete_rbac().times(1).returning(|_, _| Ok(()));

        context(kube).delete("apps/job").await.unwrap();
    }

    #[tokio::test]
    async fn story_bad_job_id_is_rejected() {
        let kube = MockJobKubeClient::new();
        assert!(matches!(
            context(kube).delete("job").await,
            Err(DriverError::InvalidJobId(_))
        ));
    }

    #[tokio::test]
    async fn story_status_without_progress_skips_the_volume_backup() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_job().returning(|_, _| Ok(Some(Job::default())));
        kube.expect_get_volume_backup().never();

        let info = context(kube).status("apps/job", false).await.unwrap();
        assert_eq!(info.state, JobState::InProgress);
    }
}
