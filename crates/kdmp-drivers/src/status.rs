//! Job status interpretation

use k8s_openapi::api::batch::v1::{Job, JobCondition};

use kdmp_common::crd::VolumeBackup;

use crate::JobInfo;

fn condition<'a>(job: &'a Job, type_: &str) -> Option<&'a JobCondition> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_ && c.status == "True")
}

/// Combine a Job and its optional VolumeBackup into a [`JobInfo`].
///
/// The Job decides the outcome; the VolumeBackup only adds progress and the
/// engine's last error. A job that no longer exists is a failure because a
/// retried stage would otherwise wait forever.
pub fn job_info(id: &str, job: Option<&Job>, vb: Option<&VolumeBackup>) -> JobInfo {
    let Some(job) = job else {
        return JobInfo::failed(format!("job {} not found", id));
    };

    let vb_status = vb.and_then(|vb| vb.status.as_ref());
    let last_error = vb_status
        .map(|s| s.last_known_error.as_str())
        .unwrap_or_default();

    if let Some(failed) = condition(job, "Failed") {
        let mut reason = format!("check {} job for details", id);
        if let Some(msg) = failed.message.as_deref().filter(|m| !m.is_empty()) {
            reason.push_str(": ");
            reason.push_str(msg);
        }
        if !last_error.is_empty() {
            reason.push_str(": ");
            reason.push_str(last_error);
        }
        return JobInfo::failed(reason).with_last_error(last_error);
    }

    if condition(job, "Complete").is_some() {
        return JobInfo::completed();
    }

    let progress = vb_status
        .map(|s| s.progress_percentage.clamp(0.0, 100.0))
        .unwrap_or(0.0);
    JobInfo::in_progress(progress).with_last_error(last_error)
}
