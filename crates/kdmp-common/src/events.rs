//! Kubernetes Events for DataExports
//!
//! A trait over `kube::runtime::events::Recorder` so the reconciler can be
//! tested without an API server. Publishing never fails the caller: errors
//! are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    ///
    /// `reason` is a PascalCase machine-readable string from [`reasons`];
    /// `action` comes from [`actions`].
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the Event's reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    pub const STAGE_ADVANCED: &str = "StageAdvanced";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const SNAPSHOT_FAILED: &str = "SnapshotFailed";
    pub const TRANSFER_STARTED: &str = "TransferStarted";
    pub const TRANSFER_FAILED: &str = "TransferFailed";
    pub const TRANSFER_COMPLETED: &str = "TransferCompleted";
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
}

/// Event actions (ACTION column)
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const VALIDATE: &str = "Validate";
    pub const SNAPSHOT: &str = "Snapshot";
    pub const TRANSFER: &str = "Transfer";
    pub const CLEANUP: &str = "Cleanup";
}
