//! Central KDMP configuration
//!
//! Everything tunable about worker jobs lives in one ConfigMap
//! (`kdmp-config` in the operator namespace). Drivers re-read it on every
//! job launch so edits apply without a restart. Unusable values fall back
//! to the defaults below with a warning rather than failing transfers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::kube_utils::is_not_found;
use crate::quantity::validate_quantity;
use crate::Error;

/// Name of the configuration ConfigMap
pub const CONFIG_MAP_NAME: &str = "kdmp-config";

pub const DEFAULT_EXECUTOR_IMAGE: &str = "portworx/kdmp-executor:latest";
pub const DEFAULT_REQUEST_CPU: &str = "100m";
pub const DEFAULT_REQUEST_MEMORY: &str = "700Mi";
pub const DEFAULT_LIMIT_CPU: &str = "200m";
pub const DEFAULT_LIMIT_MEMORY: &str = "1Gi";
pub const DEFAULT_RSYNC_FLAGS: &str = "-a --delete";
pub const DEFAULT_JOB_BACKOFF_LIMIT: i32 = 10;

const RSYNC_FLAGS_KEY: &str = "KDMP_RSYNC_FLAGS";
const OPENSHIFT_SCC_KEY: &str = "KDMP_OPENSHIFT_SCC";
const RECLAIM_KEY: &str = "KDMP_RECLAIM_ON_COMPLETION";
const BACKOFF_LIMIT_KEY: &str = "KDMP_JOB_BACKOFF_LIMIT";
const MAX_JOBS_SUFFIX: &str = "_MAX_JOBS";

/// Family of worker images; each has its own image and resource keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerKind {
    Rsync,
    ResticExecutor,
    KopiaExecutor,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [Self::Rsync, Self::ResticExecutor, Self::KopiaExecutor];

    /// Key prefix, e.g. `KDMP_KOPIA_EXECUTOR`
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::Rsync => "KDMP_RSYNC",
            Self::ResticExecutor => "KDMP_RESTIC_EXECUTOR",
            Self::KopiaExecutor => "KDMP_KOPIA_EXECUTOR",
        }
    }
}

/// Image and resources for one worker family
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub image: String,
    pub image_pull_secret: Option<String>,
    pub request_cpu: String,
    pub request_memory: String,
    pub limit_cpu: String,
    pub limit_memory: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_EXECUTOR_IMAGE.to_string(),
            image_pull_secret: None,
            request_cpu: DEFAULT_REQUEST_CPU.to_string(),
            request_memory: DEFAULT_REQUEST_MEMORY.to_string(),
            limit_cpu: DEFAULT_LIMIT_CPU.to_string(),
            limit_memory: DEFAULT_LIMIT_MEMORY.to_string(),
        }
    }
}

/// Parsed `kdmp-config`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KdmpConfig {
    workers: BTreeMap<WorkerKind, WorkerConfig>,
    /// Keyed by lower-case driver name
    max_jobs: BTreeMap<String, usize>,
    pub rsync_flags: Vec<String>,
    pub openshift_scc: Option<String>,
    pub reclaim_on_completion: bool,
    pub job_backoff_limit: i32,
}

impl Default for KdmpConfig {
    fn default() -> Self {
        Self::from_data(&BTreeMap::new())
    }
}

impl KdmpConfig {
    /// Build a config from ConfigMap data
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let workers = WorkerKind::ALL
            .iter()
            .map(|kind| (*kind, worker_from_data(*kind, data)))
            .collect();

        let max_jobs = data
            .iter()
            .filter_map(|(key, value)| {
                let driver = key.strip_prefix("KDMP_")?.strip_suffix(MAX_JOBS_SUFFIX)?;
                match value.trim().parse::<usize>() {
                    Ok(limit) => Some((driver.to_lowercase(), limit)),
                    Err(_) => {
                        warn!(key = %key, value = %value, "ignoring non-numeric job limit");
                        None
                    }
                }
            })
            .collect();

        let rsync_flags = non_empty(data, RSYNC_FLAGS_KEY)
            .unwrap_or(DEFAULT_RSYNC_FLAGS)
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let reclaim_on_completion = match non_empty(data, RECLAIM_KEY) {
            None => true,
            Some(v) => v.parse::<bool>().unwrap_or_else(|_| {
                warn!(key = RECLAIM_KEY, value = %v, "expected true or false, using true");
                true
            }),
        };

        let job_backoff_limit = match non_empty(data, BACKOFF_LIMIT_KEY) {
            None => DEFAULT_JOB_BACKOFF_LIMIT,
            Some(v) => v.parse::<i32>().ok().filter(|n| *n >= 0).unwrap_or_else(|| {
                warn!(key = BACKOFF_LIMIT_KEY, value = %v, "invalid backoff limit, using default");
                DEFAULT_JOB_BACKOFF_LIMIT
            }),
        };

        Self {
            workers,
            max_jobs,
            rsync_flags,
            openshift_scc: non_empty(data, OPENSHIFT_SCC_KEY).map(str::to_string),
            reclaim_on_completion,
            job_backoff_limit,
        }
    }

    pub fn worker(&self, kind: WorkerKind) -> WorkerConfig {
        self.workers.get(&kind).cloned().unwrap_or_default()
    }

    /// Concurrent job limit for a driver; 0 means unlimited
    pub fn max_jobs(&self, driver: &str, default: usize) -> usize {
        self.max_jobs
            .get(&driver.to_lowercase())
            .copied()
            .unwrap_or(default)
    }
}

fn non_empty<'a>(data: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    data.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn worker_from_data(kind: WorkerKind, data: &BTreeMap<String, String>) -> WorkerConfig {
    let prefix = kind.key_prefix();
    let defaults = WorkerConfig::default();
    let quantity = |suffix: &str, default: String| -> String {
        let key = format!("{}_{}", prefix, suffix);
        match non_empty(data, &key) {
            Some(v) => match validate_quantity(v) {
                Ok(()) => v.to_string(),
                Err(e) => {
                    warn!(key = %key, error = %e, "invalid quantity, using default");
                    default
                }
            },
            None => default,
        }
    };

    WorkerConfig {
        image: non_empty(data, &format!("{}_IMAGE", prefix))
            .map(str::to_string)
            .unwrap_or(defaults.image),
        image_pull_secret: non_empty(data, &format!("{}_IMAGE_SECRET", prefix))
            .map(str::to_string),
        request_cpu: quantity("REQUEST_CPU", defaults.request_cpu),
        request_memory: quantity("REQUEST_MEMORY", defaults.request_memory),
        limit_cpu: quantity("LIMIT_CPU", defaults.limit_cpu),
        limit_memory: quantity("LIMIT_MEMORY", defaults.limit_memory),
    }
}

/// Source of the current configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<KdmpConfig, Error>;
}

/// Reads `kdmp-config` from the cluster on every call
pub struct KubeConfigSource {
    client: Client,
    namespace: String,
    name: String,
}

impl KubeConfigSource {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: CONFIG_MAP_NAME.to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl ConfigSource for KubeConfigSource {
    async fn load(&self) -> Result<KdmpConfig, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(&self.name).await {
            Ok(cm) => Ok(KdmpConfig::from_data(&cm.data.unwrap_or_default())),
            Err(e) if is_not_found(&e) => {
                debug!(
                    namespace = %self.namespace,
                    name = %self.name,
                    "config map not found, using defaults"
                );
                Ok(KdmpConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Fixed configuration, for tests and local runs
pub struct StaticConfigSource(pub Arc<KdmpConfig>);

impl StaticConfigSource {
    pub fn new(config: KdmpConfig) -> Self {
        Self(Arc::new(config))
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<KdmpConfig, Error> {
        Ok((*self.0).clone())
    }
}
