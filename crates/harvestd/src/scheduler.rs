//! Job scheduling.
//!
//! A timer pumps the jobs directory into a bounded channel; a single
//! consumer dispatches one job at a time. The in-flight counter makes the
//! pump skip a tick while anything is still being worked on, so at most
//! one directory sweep is in the pipeline and exactly one job runs at any
//! moment. Retries are not scheduled anywhere: a retryable failure simply
//! leaves the file on disk for the next sweep, which also makes retries
//! survive process restarts.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use harvest_core::job::{CleanupUnparseable, Job};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::JobResult;
use crate::metrics::Metrics;
use crate::store::JobStore;

/// Cadence of the directory sweep.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
/// Bound of the work channel.
pub const QUEUE_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct Scheduler {
    store: Arc<JobStore>,
    metrics: Arc<Metrics>,
    in_flight: AtomicI64,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            metrics,
            in_flight: AtomicI64::new(0),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// One tick: enqueue every persisted job, unless work is still in
    /// flight from a previous tick. Files that fail to decode are
    /// enqueued as cleanup jobs pointing at the offending path.
    pub async fn pump(&self, tx: &mpsc::Sender<Job>) {
        if self.in_flight() > 0 {
            debug!("there are still jobs in-flight, skipping");
            return;
        }

        let paths = match self.store.scan() {
            Ok(paths) => paths,
            Err(err) => {
                error!(error = %err, "failed to walk the jobs directory");
                return;
            }
        };

        for path in paths {
            let job = match JobStore::load(&path) {
                Ok(job) => job,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unparseable job file");
                    Job::CleanupUnparseable(CleanupUnparseable::new(&path))
                }
            };
            if tx.send(job).await.is_err() {
                // Consumer is gone; the daemon is shutting down.
                return;
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.metrics.jobs_scheduled.inc();
        }
    }

    /// Post-handling bookkeeping: success and non-retryable failure both
    /// remove the job file; a retryable failure leaves it for the next
    /// tick.
    pub fn settle(&self, job: &Job, outcome: &JobResult) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                self.metrics.jobs_completed.inc();
                self.store.remove(job);
            }
            Err(err) if err.is_discard() => {
                warn!(job_id = job.id(), error = %err, "discarding job after non-retryable failure");
                self.metrics.jobs_discarded.inc();
                self.store.remove(job);
            }
            Err(err) => {
                debug!(job_id = job.id(), error = %err, "job failed, leaving for retry");
                self.metrics.jobs_retried.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use harvest_core::github::{ArtifactWorkflowRun, WorkflowArtifact};
    use harvest_core::job::{JobKind, SyncWorkflowArtifact};
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir) -> Scheduler {
        let store = Arc::new(JobStore::new(dir.path(), None).unwrap());
        Scheduler::new(store, Arc::new(Metrics::new().unwrap()))
    }

    fn sample_job() -> Job {
        Job::SyncWorkflowArtifact(SyncWorkflowArtifact::new(
            WorkflowArtifact {
                id: Some(7),
                name: Some("bin.zip".to_string()),
                url: Some("https://api.github.com/repos/o/r/actions/artifacts/7".to_string()),
                expired: Some(false),
                workflow_run: Some(ArtifactWorkflowRun {
                    id: Some(9),
                    head_sha: Some("abc".to_string()),
                }),
            },
            "1.0.0".to_string(),
            vec![],
            None,
        ))
    }

    #[tokio::test]
    async fn pump_enqueues_persisted_jobs() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.store.save(&sample_job()).unwrap();

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        scheduler.pump(&tx).await;

        assert_eq!(scheduler.in_flight(), 1);
        let job = rx.try_recv().unwrap();
        assert_eq!(job.kind(), JobKind::SyncWorkflowArtifact);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pump_skips_while_work_is_in_flight() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.store.save(&sample_job()).unwrap();

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        scheduler.pump(&tx).await;
        let _ = rx.try_recv().unwrap();

        // Still in flight: the second tick must not enqueue a duplicate.
        scheduler.pump(&tx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[tokio::test]
    async fn pump_turns_unparseable_files_into_cleanup_jobs() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let bad = dir.path().join("garbage.json");
        std::fs::write(&bad, b"{definitely not a job").unwrap();

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        scheduler.pump(&tx).await;

        let job = rx.try_recv().unwrap();
        assert_eq!(job.kind(), JobKind::CleanupUnparseable);
        assert_eq!(job.persisted_path(), Some(bad.as_path()));
    }

    #[tokio::test]
    async fn retryable_failure_leaves_the_file() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let path = scheduler.store.save(&sample_job()).unwrap();
        let job = JobStore::load(&path).unwrap();

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        scheduler.pump(&tx).await;
        let _ = rx.try_recv().unwrap();

        scheduler.settle(&job, &Err(JobError::retry(eyre::eyre!("transient"))));
        assert!(path.exists());
        assert_eq!(scheduler.in_flight(), 0);

        // Next tick re-enqueues exactly the same job, no duplicates.
        scheduler.pump(&tx).await;
        let again = rx.try_recv().unwrap();
        assert_eq!(again.id(), job.id());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn discard_failure_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let path = scheduler.store.save(&sample_job()).unwrap();
        let job = JobStore::load(&path).unwrap();

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        scheduler.pump(&tx).await;
        let _ = rx.try_recv().unwrap();

        scheduler.settle(&job, &Err(JobError::discard(eyre::eyre!("permanent"))));
        assert!(!path.exists());
        assert_eq!(scheduler.in_flight(), 0);

        scheduler.pump(&tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn success_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let path = scheduler.store.save(&sample_job()).unwrap();
        let job = JobStore::load(&path).unwrap();

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        scheduler.pump(&tx).await;
        let _ = rx.try_recv().unwrap();

        scheduler.settle(&job, &Ok(()));
        assert!(!path.exists());
    }
}
