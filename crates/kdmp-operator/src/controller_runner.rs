//! DataExport controller wiring
//!
//! Worker jobs may live in another namespace than their DataExport, where an
//! owner reference is not allowed, so jobs are mapped back to their export
//! through the annotations the drivers stamp on them. Labels only select
//! KDMP jobs; their values may be truncated.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use kdmp_common::crd::DataExport;
use kdmp_common::{DRIVER_NAME_LABEL, EXPORT_NAMESPACE_ANNOTATION, EXPORT_NAME_ANNOTATION};
use kdmp_controller::{error_policy, reconcile, ExportContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// The DataExport a worker job was launched for
pub fn export_for_job(job: &Job) -> Option<ObjectRef<DataExport>> {
    let annotations = job.metadata.annotations.as_ref()?;
    let name = annotations.get(EXPORT_NAME_ANNOTATION)?;
    let namespace = annotations.get(EXPORT_NAMESPACE_ANNOTATION)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Run the DataExport controller until shutdown
pub async fn run_export_controller(client: Client, config_namespace: &str, config_name: &str) {
    let ctx = Arc::new(ExportContext::from_client(
        client.clone(),
        config_namespace,
        config_name,
    ));
    let exports: Api<DataExport> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client);

    tracing::info!("- DataExport controller");

    Controller::new(exports, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .watches(
            jobs,
            WatcherConfig::default()
                .labels(DRIVER_NAME_LABEL)
                .timeout(WATCH_TIMEOUT_SECS),
            |job| export_for_job(&job),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("DataExport"))
        .await;
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
