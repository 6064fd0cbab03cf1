//! Leader election on a coordination.k8s.io/v1 Lease
//!
//! Only the leader runs the DataExport controller, so two replicas never
//! race on the same worker job. Every write carries the resourceVersion
//! that was read, making acquire, renew and takeover compare-and-swap
//! operations: a concurrent writer gets a 409 and backs off.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kube_utils::is_not_found;

/// Default Lease name
pub const LEADER_LEASE_NAME: &str = "kdmp-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with the lease as last read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease exists yet
    Create,
    /// We hold it; refresh renewTime
    Renew,
    /// Holder let it expire; take it over
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease
    Wait,
}

/// Decide how to act on `lease` as `identity` at `now`
pub fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();

    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration) {
        (Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };

    if expired {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        }
    } else {
        LeaseDecision::Wait
    }
}

pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// 30s lease, renewed every 10s, acquisition retried every 5s
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Block until the lease is ours
    pub async fn acquire(self) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "waiting for leadership");

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return self.into_guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "lease held elsewhere");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "failed to acquire lease");
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn into_guard(self) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let renewal_task = tokio::spawn(async move {
            self.renewal_loop(lost_tx).await;
        });
        LeaderGuard {
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn renewal_loop(self, lost_tx: oneshot::Sender<()>) {
        let mut interval = tokio::time::interval(self.renew_interval);
        // the first tick fires immediately; we just acquired
        interval.tick().await;
        let mut last_success = tokio::time::Instant::now();

        loop {
            interval.tick().await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_success = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken by another holder");
                    break;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease renewal failed");
                    if last_success.elapsed() >= self.lease_duration {
                        warn!(identity = %self.identity, "lease expired while renewals failed");
                        break;
                    }
                }
            }
        }

        let _ = lost_tx.send(());
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(e.into()),
        };

        match decide(existing.as_ref(), &self.identity, now) {
            LeaseDecision::Wait => Ok(false),
            LeaseDecision::Create => {
                let lease = self.lease(None, now, 0);
                self.write(api.create(&PostParams::default(), &lease).await)
            }
            LeaseDecision::Renew => {
                let mut lease = existing.unwrap_or_default();
                if lease.metadata.resource_version.is_none() {
                    return Err(LeaderElectionError::MissingResourceVersion(
                        self.lease_name.clone(),
                    ));
                }
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.write(
                    api.replace(&self.lease_name, &PostParams::default(), &lease)
                        .await,
                )
            }
            LeaseDecision::TakeOver { transitions } => {
                let rv = existing
                    .and_then(|l| l.metadata.resource_version)
                    .ok_or_else(|| {
                        LeaderElectionError::MissingResourceVersion(self.lease_name.clone())
                    })?;
                let lease = self.lease(Some(rv), now, transitions);
                info!(identity = %self.identity, transitions, "taking over expired lease");
                self.write(
                    api.replace(&self.lease_name, &PostParams::default(), &lease)
                        .await,
                )
            }
        }
    }

    /// A 409 means someone else won the race
    fn write(&self, result: Result<Lease, kube::Error>) -> Result<bool, LeaderElectionError> {
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease(&self, resource_version: Option<String>, now: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

/// Held while we are leader; renewal runs in the background
pub struct LeaderGuard {
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves when leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
