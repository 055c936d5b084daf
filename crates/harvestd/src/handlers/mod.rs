//! Job handlers.
//!
//! One handler per job variant, dispatched by the scheduler's consumer.
//! Handlers return [`JobResult`]: `Ok` and `Discard` both end with the
//! job file removed, `Retry` leaves it for a later tick.

mod discover;
mod sync;

use harvest_core::job::{CleanupUnparseable, Job};
use tracing::info;

use crate::error::JobResult;
use crate::Daemon;

pub async fn handle(daemon: &Daemon, job: &Job) -> JobResult {
    match job {
        Job::CleanupUnparseable(j) => cleanup_unparseable(j),
        Job::DiscoverWorkflowArtifacts(j) => discover::workflow_artifacts(daemon, j).await,
        Job::SyncWorkflowArtifact(j) => sync::workflow_artifact(daemon, j).await,
        Job::SyncReleaseAsset(j) => sync::release_asset(daemon, j).await,
        Job::SyncContainerRegistryPackage(j) => {
            sync::container_registry_package(daemon, j).await
        }
    }
}

/// The job *is* the bad file: succeeding here lets the scheduler's normal
/// post-handling soft-delete take it off the queue.
fn cleanup_unparseable(job: &CleanupUnparseable) -> JobResult {
    if let Some(path) = &job.meta.persisted_path {
        info!(path = %path.display(), "cleaning up unparseable job");
    }
    Ok(())
}
