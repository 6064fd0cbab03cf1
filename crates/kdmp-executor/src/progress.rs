//! Periodic progress reporting
//!
//! Parsers publish the latest [`VolumeBackupStatus`] on a watch channel.
//! While the engine runs, a ticker pushes it to the [`StatusSink`] every
//! [`REPORT_INTERVAL`], skipping ticks where nothing changed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use kdmp_common::crd::VolumeBackupStatus;

use crate::process::{self, EngineCommand, ProcessOutput, Stream};
use crate::status::StatusSink;
use crate::ExecutorError;

pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Turns engine output into VolumeBackup status
pub trait OutputParser {
    fn observe(&mut self, stream: Stream, line: &str);

    /// Status as of the last observed line
    fn status(&self) -> VolumeBackupStatus;
}

/// Pushes status to a sink, remembering what was last written
pub struct ProgressReporter {
    sink: Arc<dyn StatusSink>,
    last_pushed: Option<VolumeBackupStatus>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            sink,
            last_pushed: None,
        }
    }

    /// Write `status` unless it equals the last write. Returns whether a
    /// write happened.
    pub async fn push(&mut self, status: &VolumeBackupStatus) -> Result<bool, ExecutorError> {
        if self.last_pushed.as_ref() == Some(status) {
            return Ok(false);
        }
        self.sink.update(status).await?;
        self.last_pushed = Some(status.clone());
        Ok(true)
    }

    /// Drive `work` to completion, pushing the latest status from `latest`
    /// on every tick. Failed pushes are logged; the engine keeps running.
    pub async fn report_until<F>(
        &mut self,
        work: F,
        latest: watch::Receiver<VolumeBackupStatus>,
        interval: Duration,
    ) -> F::Output
    where
        F: Future,
    {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    let current = latest.borrow().clone();
                    if let Err(e) = self.push(&current).await {
                        warn!(error = %e, "failed to report progress");
                    }
                }
            }
        }
    }

    /// Run `cmd` through `parser`, reporting progress until it exits
    pub async fn run_reported<P>(
        &mut self,
        cmd: &EngineCommand,
        parser: &mut P,
    ) -> Result<ProcessOutput, ExecutorError>
    where
        P: OutputParser,
    {
        let (tx, rx) = watch::channel(parser.status());
        let work = process::stream(cmd, |which, line| {
            parser.observe(which, line);
            tx.send_replace(parser.status());
        });
        self.report_until(work, rx, REPORT_INTERVAL).await
    }

    /// Write the terminal status of a run. A failure is recorded as the
    /// last known error on top of `last` before it is returned.
    pub async fn finish(
        &mut self,
        mut last: VolumeBackupStatus,
        result: Result<VolumeBackupStatus, ExecutorError>,
    ) -> Result<VolumeBackupStatus, ExecutorError> {
        match result {
            Ok(status) => {
                self.push(&status).await?;
                Ok(status)
            }
            Err(e) => {
                last.last_known_error = e.to_string();
                if let Err(push_err) = self.push(&last).await {
                    warn!(error = %push_err, "failed to record the failure");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MockStatusSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status(progress: f64) -> VolumeBackupStatus {
        VolumeBackupStatus {
            progress_percentage: progress,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unchanged_status_is_not_rewritten() {
        let mut sink = MockStatusSink::new();
        sink.expect_update().times(2).returning(|_| Ok(()));
        let mut reporter = ProgressReporter::new(Arc::new(sink));

        assert!(reporter.push(&status(10.0)).await.unwrap());
        assert!(!reporter.push(&status(10.0)).await.unwrap());
        assert!(reporter.push(&status(20.0)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_writes_are_retried_on_the_next_push() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut sink = MockStatusSink::new();
        sink.expect_update().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ExecutorError::engine("kube", "unavailable"))
            } else {
                Ok(())
            }
        });
        let mut reporter = ProgressReporter::new(Arc::new(sink));

        assert!(reporter.push(&status(10.0)).await.is_err());
        assert!(reporter.push(&status(10.0)).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_push_the_latest_status_while_work_runs() {
        let written = Arc::new(std::sync::Mutex::new(Vec::new()));
        let w = written.clone();
        let mut sink = MockStatusSink::new();
        sink.expect_update().returning(move |s| {
            w.lock().unwrap().push(s.progress_percentage);
            Ok(())
        });
        let mut reporter = ProgressReporter::new(Arc::new(sink));

        let (tx, rx) = watch::channel(status(0.0));
        let work = async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            tx.send_replace(status(40.0));
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send_replace(status(90.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
            "done"
        };

        let output = reporter.report_until(work, rx, REPORT_INTERVAL).await;
        assert_eq!(output, "done");
        // ticks at 5s and 10s see 40; nothing after 90 before the work ends
        assert_eq!(*written.lock().unwrap(), vec![40.0]);
    }

    #[tokio::test]
    async fn failures_are_written_as_the_last_known_error() {
        let mut sink = MockStatusSink::new();
        sink.expect_update()
            .withf(|s| {
                s.last_known_error == "kopia failed: 2 fatal errors"
                    && s.progress_percentage == 60.0
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut reporter = ProgressReporter::new(Arc::new(sink));

        let err = reporter
            .finish(status(60.0), Err(ExecutorError::engine("kopia", "2 fatal errors")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Engine { .. }));
    }
}
