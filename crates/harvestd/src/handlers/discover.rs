//! Workflow artifact discovery.
//!
//! A `discover-workflow-artifacts` job fans out into one
//! `sync-workflow-artifact` job per artifact that matches a configured
//! pattern. Matching happens here rather than at ingress time because the
//! artifact list only exists after the workflow run completes.

use std::path::Path;

use eyre::eyre;
use harvest_core::job::{DiscoverWorkflowArtifacts, Job, SyncWorkflowArtifact};
use tracing::{info, warn};

use crate::error::{flatten_errors, JobError, JobResult};
use crate::Daemon;

pub async fn workflow_artifacts(daemon: &Daemon, job: &DiscoverWorkflowArtifacts) -> JobResult {
    info!(
        repo = job.repo_full_name(),
        workflow = job.workflow_file(),
        workflow_run_id = job.run_id(),
        "discovering artifacts of the workflow"
    );

    let Some(rules) = daemon.config.repository(job.repo_full_name()) else {
        info!("ignoring workflow b/c we don't have configuration for this repo");
        return Ok(());
    };
    let Some(workflow) = rules.workflows.get(job.workflow_file()) else {
        info!("ignoring workflow b/c we don't have configuration for this workflow");
        return Ok(());
    };

    let artifacts = daemon
        .github
        .list_workflow_run_artifacts(job.repo_owner(), job.repo(), job.run_id())
        .await
        .map_err(|err| JobError::retry(eyre!("failed to list workflow artifacts: {err}")))?;

    let mut errs = Vec::new();
    for artifact in artifacts {
        if let Err(err) = artifact.sanitise() {
            warn!(error = %err, "invalid workflow artifact, skipping");
            continue;
        }
        if artifact.is_expired() {
            info!(artifact = artifact.name(), "workflow artifact expired, skipping");
            continue;
        }

        let base_name = Path::new(artifact.name())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        for (pattern, rule) in &workflow.artifacts {
            let Some(captured) = pattern.match_version(&base_name) else {
                continue;
            };
            let version = captured.unwrap_or_else(|| artifact.head_sha().to_string());

            let sync = Job::SyncWorkflowArtifact(SyncWorkflowArtifact::new(
                artifact.clone(),
                version,
                rule.destinations.clone(),
                job.workflow_run_event.workflow_run.clone(),
            ));
            match daemon.store.save(&sync) {
                Ok(path) => info!(job = %path.display(), "persisted job"),
                Err(err) => {
                    warn!(error = %err, "failed to persist a job");
                    errs.push(eyre!("failed to persist {}: {err}", sync.id()));
                }
            }
        }
    }

    info!("done discovering artifacts of the workflow");
    flatten_errors(errs).map_err(JobError::retry)
}
