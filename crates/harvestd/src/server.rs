//! Webhook ingress.
//!
//! A single endpoint accepts signed GitHub events and turns the
//! configured ones into persisted jobs. Everything else is acknowledged
//! and dropped: the webhook delivery must never be retried by the sender
//! because of a mismatch on our side, only signature failures and
//! persistence failures surface as errors.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use harvest_core::config::Config;
use harvest_core::github::{
    parse_event, RegistryPackageEvent, ReleaseEvent, WebhookEvent, WorkflowRunEvent,
};
use harvest_core::job::{
    DiscoverWorkflowArtifacts, Job, SyncContainerRegistryPackage, SyncReleaseAsset,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::store::JobStore;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";

type HmacSha256 = Hmac<Sha256>;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<JobStore>,
    pub metrics: Arc<Metrics>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(liveness).post(webhook))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

/// Validate an `X-Hub-Signature-256` header against the shared secret.
fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(signature) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&state.config.github.webhook_secret, &body, signature) {
        warn!("failed to validate payload signature");
        state.metrics.events_invalid.inc();
        return StatusCode::BAD_REQUEST;
    }

    let Some(event_name) = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok()) else {
        warn!("delivery carried no event name");
        state.metrics.events_invalid.inc();
        return StatusCode::BAD_REQUEST;
    };

    match parse_event(event_name, &body) {
        Err(err) => {
            warn!(event = event_name, error = %err, "failed to parse webhook");
            state.metrics.events_invalid.inc();
            StatusCode::BAD_REQUEST
        }
        Ok(None) => {
            info!(event = event_name, "ignoring event");
            state.metrics.events_ignored.inc();
            StatusCode::OK
        }
        Ok(Some(event)) => {
            state.metrics.events_received.inc();
            match event {
                WebhookEvent::WorkflowRun(e) => process_workflow_run(&state, e),
                WebhookEvent::Release(e) => process_release(&state, &e),
                WebhookEvent::RegistryPackage(e) => process_registry_package(&state, e),
            }
        }
    }
}

fn process_workflow_run(state: &AppState, event: WorkflowRunEvent) -> StatusCode {
    if let Err(err) = event.sanitise() {
        info!(error = %err, "ignoring workflow event");
        state.metrics.events_ignored.inc();
        return StatusCode::OK;
    }

    if event.status() != "completed" {
        debug!(status = event.status(), "ignoring workflow event b/c status is not 'completed'");
        return StatusCode::OK;
    }
    if event.conclusion() != "success" {
        debug!(
            conclusion = event.conclusion(),
            "ignoring workflow event b/c conclusion is not 'success'"
        );
        return StatusCode::OK;
    }

    let Some(rules) = state.config.repository(event.repo_full_name()) else {
        debug!(
            repo = event.repo_full_name(),
            "ignoring workflow event b/c we don't have configuration for this repo"
        );
        return StatusCode::OK;
    };
    if !rules.workflows.contains_key(event.workflow_file()) {
        debug!(
            repo = event.repo_full_name(),
            workflow = event.workflow_file(),
            "ignoring workflow event b/c we don't have configuration for this workflow"
        );
        return StatusCode::OK;
    }

    let job = Job::DiscoverWorkflowArtifacts(DiscoverWorkflowArtifacts::new(event));
    persist(state, job)
}

fn process_release(state: &AppState, event: &ReleaseEvent) -> StatusCode {
    if let Err(err) = event.sanitise() {
        info!(error = %err, "ignoring release event");
        state.metrics.events_ignored.inc();
        return StatusCode::OK;
    }

    if event.action() != "published" {
        debug!(action = event.action(), "ignoring release event b/c it is not 'published'");
        return StatusCode::OK;
    }

    let Some(rules) = state.config.repository(event.repo_full_name()) else {
        debug!(
            repo = event.repo_full_name(),
            "ignoring release event b/c we don't have configuration for this repo"
        );
        return StatusCode::OK;
    };

    for (release_pattern, release_rule) in &rules.releases {
        let Some(captured) = release_pattern.match_version(event.release_name()) else {
            continue;
        };
        let release_version = captured.unwrap_or_else(|| event.release_name().to_string());

        if event.is_draft() && !release_rule.accept_drafts {
            debug!(release = event.release_name(), "ignoring draft release");
            continue;
        }
        if event.is_prerelease() && !release_rule.accept_prereleases {
            debug!(release = event.release_name(), "ignoring pre-release");
            continue;
        }

        for (asset_pattern, asset_rule) in &release_rule.assets {
            for asset in event.assets() {
                if asset.state.as_deref() != Some("uploaded") {
                    continue;
                }
                if asset.content_type.as_deref() != Some("application/zip") {
                    continue;
                }
                let Some(asset_captured) = asset_pattern.match_version(asset.name()) else {
                    continue;
                };
                let version = asset_captured.unwrap_or_else(|| release_version.clone());

                let job = Job::SyncReleaseAsset(SyncReleaseAsset::new(
                    asset.clone(),
                    version,
                    asset_rule.destinations.clone(),
                ));
                let status = persist(state, job);
                if status != StatusCode::OK {
                    return status;
                }
            }
        }
    }

    StatusCode::OK
}

fn process_registry_package(state: &AppState, event: RegistryPackageEvent) -> StatusCode {
    if let Err(err) = event.sanitise() {
        info!(error = %err, "ignoring registry package event");
        state.metrics.events_ignored.inc();
        return StatusCode::OK;
    }

    if event.action() != "published" {
        debug!(action = event.action(), "ignoring registry package event b/c it is not 'published'");
        return StatusCode::OK;
    }
    if event.ecosystem() != "CONTAINER" {
        debug!(
            ecosystem = event.ecosystem(),
            "ignoring registry package event b/c it is not a container"
        );
        return StatusCode::OK;
    }

    let Some(rules) = state.config.repository(event.repo_full_name()) else {
        debug!(
            repo = event.repo_full_name(),
            "ignoring registry package event b/c we don't have configuration for this repo"
        );
        return StatusCode::OK;
    };
    let Some(container) = rules.containers.get(event.package_name()) else {
        debug!(
            repo = event.repo_full_name(),
            package = event.package_name(),
            "ignoring registry package event b/c we don't have configuration for this package"
        );
        return StatusCode::OK;
    };

    let Some(package) = event.registry_package else {
        // Unreachable after sanitise; a broken sanitiser is a server error.
        error!("registry package event lost its package after sanitising");
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    let job = Job::SyncContainerRegistryPackage(SyncContainerRegistryPackage::new(
        package,
        event.repository,
        container.destinations.clone(),
    ));
    persist(state, job)
}

fn persist(state: &AppState, job: Job) -> StatusCode {
    match state.store.save(&job) {
        Ok(path) => {
            info!(job = %path.display(), "persisted job");
            StatusCode::OK
        }
        Err(err) => {
            error!(job_id = job.id(), error = %err, "failed to persist job");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
