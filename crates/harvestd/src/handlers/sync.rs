//! Download-then-upload handlers.
//!
//! Each handler fetches its artifact, hands it to the uploader, and then
//! removes the download whether or not the upload succeeded: the source
//! material can always be re-fetched on retry, keeping the downloads
//! directory from accumulating state.

use eyre::eyre;
use harvest_core::job::{SyncContainerRegistryPackage, SyncReleaseAsset, SyncWorkflowArtifact};
use tracing::info;

use crate::download::remove_download;
use crate::error::{JobError, JobResult};
use crate::Daemon;

pub async fn workflow_artifact(daemon: &Daemon, job: &SyncWorkflowArtifact) -> JobResult {
    info!(
        workflow_run_id = job.run_id(),
        artifact_id = job.artifact_id(),
        artifact = job.artifact_name(),
        version = job.version,
        "synchronising workflow artifact"
    );

    let archive = daemon
        .downloader
        .workflow_artifact(job)
        .await
        .map_err(|err| JobError::retry(eyre!("failed to download workflow artifact: {err}")))?;

    let result = daemon
        .uploader
        .sync_files(&job.destinations, &job.version, &archive)
        .await;
    remove_download(&archive, daemon.config.soft_delete.downloads.as_deref());
    result?;

    info!("done synchronising workflow artifact");
    Ok(())
}

pub async fn release_asset(daemon: &Daemon, job: &SyncReleaseAsset) -> JobResult {
    info!(
        asset_id = job.asset_id(),
        asset = job.asset_name(),
        version = job.version,
        "synchronising release asset"
    );

    let archive = daemon
        .downloader
        .release_asset(job)
        .await
        .map_err(|err| JobError::retry(eyre!("failed to download release asset: {err}")))?;

    let result = daemon
        .uploader
        .sync_files(&job.destinations, &job.version, &archive)
        .await;
    remove_download(&archive, daemon.config.soft_delete.downloads.as_deref());
    result?;

    info!("done synchronising release asset");
    Ok(())
}

pub async fn container_registry_package(
    daemon: &Daemon,
    job: &SyncContainerRegistryPackage,
) -> JobResult {
    info!(
        package = job.package_name(),
        tag = job.tag(),
        digest = job.digest(),
        version_id = job.version_id(),
        "synchronising container registry package"
    );

    let archive = daemon
        .downloader
        .container(job)
        .await
        .map_err(|err| {
            JobError::retry(eyre!("failed to download container registry package: {err}"))
        })?;

    let result = daemon.uploader.sync_container(job, &archive).await;
    remove_download(&archive, daemon.config.soft_delete.downloads.as_deref());
    result?;

    info!("done synchronising container registry package");
    Ok(())
}
