//! OpenTelemetry instruments for the DataExport reconciler and drivers
//!
//! Instruments bind to the global meter lazily, so recording before
//! telemetry is initialised (tests, the executor) is a cheap no-op.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("kdmp"));

/// Labels: `result` (success, error)
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kdmp_dataexport_reconcile_duration_seconds")
        .with_description("Duration of DataExport reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Labels: `error_type` (transient, permanent)
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kdmp_dataexport_reconcile_errors_total")
        .with_description("Total number of DataExport reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Labels: `stage` (stage entered)
pub static STAGE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kdmp_dataexport_stage_transitions_total")
        .with_description("Total number of DataExport stage transitions")
        .with_unit("{transitions}")
        .build()
});

/// Labels: `driver`
pub static JOBS_STARTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kdmp_worker_jobs_started_total")
        .with_description("Total number of worker jobs created")
        .with_unit("{jobs}")
        .build()
});

/// Labels: `driver`
pub static JOBS_RATE_LIMITED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kdmp_worker_jobs_rate_limited_total")
        .with_description("Total number of job launches deferred by the per-driver limit")
        .with_unit("{jobs}")
        .build()
});

/// Labels: `driver`, `outcome` (completed, failed)
pub static TRANSFER_OUTCOMES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kdmp_transfers_total")
        .with_description("Total number of finished transfers by outcome")
        .with_unit("{transfers}")
        .build()
});

/// Times one reconcile and records it on drop-by-value
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
    }

    pub fn error(self, retryable: bool) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        let error_type = if retryable { "transient" } else { "permanent" };
        RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
    }
}

pub fn record_stage_transition(stage: &str) {
    STAGE_TRANSITIONS.add(1, &[KeyValue::new("stage", stage.to_string())]);
}

pub fn record_job_started(driver: &str) {
    JOBS_STARTED.add(1, &[KeyValue::new("driver", driver.to_string())]);
}

pub fn record_job_rate_limited(driver: &str) {
    JOBS_RATE_LIMITED.add(1, &[KeyValue::new("driver", driver.to_string())]);
}

pub fn record_transfer_outcome(driver: &str, completed: bool) {
    let outcome = if completed { "completed" } else { "failed" };
    TRANSFER_OUTCOMES.add(
        1,
        &[
            KeyValue::new("driver", driver.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}
