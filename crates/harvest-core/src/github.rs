//! GitHub wire types.
//!
//! Serde models for the webhook payloads and REST objects the daemon
//! consumes. Every field that may be absent on the wire is an `Option`;
//! the sanitisers below are the single place where presence of the fields
//! the pipeline dereferences is enforced, so everything downstream can use
//! the defensive accessors without re-checking.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("missing {0}")]
pub struct SanitiseError(pub &'static str);

type Sanitised = Result<(), SanitiseError>;

fn require<T>(field: Option<&T>, name: &'static str) -> Result<(), SanitiseError> {
    field.map(|_| ()).ok_or(SanitiseError(name))
}

// --- Shared objects ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    pub login: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repository {
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub owner: Option<Actor>,
}

impl Repository {
    pub fn full_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn owner(&self) -> &str {
        self.owner
            .as_ref()
            .and_then(|o| o.login.as_deref())
            .unwrap_or_default()
    }
}

// --- workflow_run event ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Option<i64>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub head_sha: Option<String>,
    pub triggering_actor: Option<Actor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRunEvent {
    pub action: Option<String>,
    pub repository: Option<Repository>,
    pub workflow: Option<Workflow>,
    pub workflow_run: Option<WorkflowRun>,
}

impl WorkflowRunEvent {
    pub fn sanitise(&self) -> Sanitised {
        let repo = self.repository.as_ref().ok_or(SanitiseError("repo info"))?;
        require(repo.full_name.as_ref(), "repo full name")?;
        let workflow = self.workflow.as_ref().ok_or(SanitiseError("workflow"))?;
        require(workflow.path.as_ref(), "workflow path")?;
        let run = self
            .workflow_run
            .as_ref()
            .ok_or(SanitiseError("workflow run info"))?;
        require(run.id.as_ref(), "workflow run id")?;
        require(run.status.as_ref(), "workflow run status")?;
        let actor = run
            .triggering_actor
            .as_ref()
            .ok_or(SanitiseError("workflow run triggering actor info"))?;
        require(actor.login.as_ref(), "workflow run triggering actor login")?;
        Ok(())
    }

    pub fn repo_full_name(&self) -> &str {
        self.repository.as_ref().map_or("", Repository::full_name)
    }

    pub fn repo_owner(&self) -> &str {
        self.repository.as_ref().map_or("", Repository::owner)
    }

    pub fn repo_name(&self) -> &str {
        self.repository.as_ref().map_or("", Repository::name)
    }

    /// Workflow file name with the `.github/workflows/` prefix stripped.
    pub fn workflow_file(&self) -> &str {
        let path = self
            .workflow
            .as_ref()
            .and_then(|w| w.path.as_deref())
            .unwrap_or_default();
        path.strip_prefix(".github/workflows/").unwrap_or(path)
    }

    pub fn run_id(&self) -> i64 {
        self.workflow_run
            .as_ref()
            .and_then(|r| r.id)
            .unwrap_or_default()
    }

    pub fn status(&self) -> &str {
        self.workflow_run
            .as_ref()
            .and_then(|r| r.status.as_deref())
            .unwrap_or_default()
    }

    pub fn conclusion(&self) -> &str {
        self.workflow_run
            .as_ref()
            .and_then(|r| r.conclusion.as_deref())
            .unwrap_or_default()
    }

    pub fn head_sha(&self) -> &str {
        self.workflow_run
            .as_ref()
            .and_then(|r| r.head_sha.as_deref())
            .unwrap_or_default()
    }
}

// --- release event ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub state: Option<String>,
    pub content_type: Option<String>,
    pub url: Option<String>,
}

impl ReleaseAsset {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn id(&self) -> i64 {
        self.id.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Release {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub draft: Option<bool>,
    pub prerelease: Option<bool>,
    pub assets: Option<Vec<ReleaseAsset>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub action: Option<String>,
    pub repository: Option<Repository>,
    pub release: Option<Release>,
}

impl ReleaseEvent {
    pub fn sanitise(&self) -> Sanitised {
        require(self.action.as_ref(), "action")?;
        let repo = self.repository.as_ref().ok_or(SanitiseError("repo info"))?;
        require(repo.full_name.as_ref(), "repo full name")?;
        let release = self.release.as_ref().ok_or(SanitiseError("release info"))?;
        let assets = release
            .assets
            .as_ref()
            .ok_or(SanitiseError("release assets"))?;
        for asset in assets {
            require(asset.content_type.as_ref(), "release asset content type")?;
            require(asset.name.as_ref(), "release asset name")?;
            require(asset.state.as_ref(), "release asset state")?;
            require(asset.id.as_ref(), "release asset id")?;
            require(asset.url.as_ref(), "release asset url")?;
        }
        require(release.draft.as_ref(), "release draft marker")?;
        require(release.id.as_ref(), "release id")?;
        require(release.name.as_ref(), "release name")?;
        require(release.prerelease.as_ref(), "release pre-release marker")?;
        Ok(())
    }

    pub fn action(&self) -> &str {
        self.action.as_deref().unwrap_or_default()
    }

    pub fn repo_full_name(&self) -> &str {
        self.repository.as_ref().map_or("", Repository::full_name)
    }

    pub fn release_name(&self) -> &str {
        self.release
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .unwrap_or_default()
    }

    pub fn is_draft(&self) -> bool {
        self.release
            .as_ref()
            .and_then(|r| r.draft)
            .unwrap_or_default()
    }

    pub fn is_prerelease(&self) -> bool {
        self.release
            .as_ref()
            .and_then(|r| r.prerelease)
            .unwrap_or_default()
    }

    pub fn assets(&self) -> &[ReleaseAsset] {
        self.release
            .as_ref()
            .and_then(|r| r.assets.as_deref())
            .unwrap_or_default()
    }
}

// --- registry_package event ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerTag {
    pub name: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub tag: Option<ContainerTag>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageVersion {
    pub id: Option<i64>,
    pub version: Option<String>,
    pub package_url: Option<String>,
    pub container_metadata: Option<ContainerMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryPackage {
    pub ecosystem: Option<String>,
    pub name: Option<String>,
    pub package_type: Option<String>,
    pub package_version: Option<PackageVersion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryPackageEvent {
    pub action: Option<String>,
    pub registry_package: Option<RegistryPackage>,
    pub repository: Option<Repository>,
}

impl RegistryPackageEvent {
    pub fn sanitise(&self) -> Sanitised {
        require(self.action.as_ref(), "action")?;
        let package = self
            .registry_package
            .as_ref()
            .ok_or(SanitiseError("registry package info"))?;
        require(package.ecosystem.as_ref(), "registry package ecosystem")?;
        require(package.name.as_ref(), "registry package name")?;
        require(package.package_type.as_ref(), "registry package type")?;
        let version = package
            .package_version
            .as_ref()
            .ok_or(SanitiseError("registry package version info"))?;
        let metadata = version
            .container_metadata
            .as_ref()
            .ok_or(SanitiseError("registry package container metadata info"))?;
        let tag = metadata
            .tag
            .as_ref()
            .ok_or(SanitiseError("registry package container tag info"))?;
        require(tag.digest.as_ref(), "registry package container digest")?;
        require(tag.name.as_ref(), "registry package container tag name")?;
        require(version.id.as_ref(), "registry package version id")?;
        require(version.package_url.as_ref(), "registry package version url")?;
        require(version.version.as_ref(), "registry package version")?;
        let repo = self.repository.as_ref().ok_or(SanitiseError("repo info"))?;
        require(repo.full_name.as_ref(), "repo full name")?;
        require(repo.name.as_ref(), "repo name")?;
        require(repo.owner.as_ref(), "repo owner")?;
        Ok(())
    }

    pub fn action(&self) -> &str {
        self.action.as_deref().unwrap_or_default()
    }

    pub fn ecosystem(&self) -> &str {
        self.registry_package
            .as_ref()
            .and_then(|p| p.ecosystem.as_deref())
            .unwrap_or_default()
    }

    pub fn package_name(&self) -> &str {
        self.registry_package
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .unwrap_or_default()
    }

    pub fn repo_full_name(&self) -> &str {
        self.repository.as_ref().map_or("", Repository::full_name)
    }
}

// --- REST objects ---

/// Workflow-run context attached to an artifact listing entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactWorkflowRun {
    pub id: Option<i64>,
    pub head_sha: Option<String>,
}

/// A build output of a completed workflow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowArtifact {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub expired: Option<bool>,
    pub workflow_run: Option<ArtifactWorkflowRun>,
}

impl WorkflowArtifact {
    pub fn sanitise(&self) -> Sanitised {
        require(self.expired.as_ref(), "expiration")?;
        require(self.name.as_ref(), "name")?;
        let run = self
            .workflow_run
            .as_ref()
            .ok_or(SanitiseError("workflow run"))?;
        require(run.id.as_ref(), "workflow run id")?;
        require(run.head_sha.as_ref(), "workflow run head sha")?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn id(&self) -> i64 {
        self.id.unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        self.expired.unwrap_or_default()
    }

    pub fn run_id(&self) -> i64 {
        self.workflow_run
            .as_ref()
            .and_then(|r| r.id)
            .unwrap_or_default()
    }

    pub fn head_sha(&self) -> &str {
        self.workflow_run
            .as_ref()
            .and_then(|r| r.head_sha.as_deref())
            .unwrap_or_default()
    }
}

/// Paginated artifact listing response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactList {
    pub total_count: Option<i64>,
    #[serde(default)]
    pub artifacts: Vec<WorkflowArtifact>,
}

// --- Event parsing ---

/// A recognised inbound event, keyed by the `X-GitHub-Event` header.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    WorkflowRun(WorkflowRunEvent),
    Release(ReleaseEvent),
    RegistryPackage(RegistryPackageEvent),
}

/// Decode a webhook body into a recognised event. Unrecognised event names
/// yield `Ok(None)` so the ingress can acknowledge and drop them.
pub fn parse_event(name: &str, body: &[u8]) -> Result<Option<WebhookEvent>, serde_json::Error> {
    match name {
        "workflow_run" => Ok(Some(WebhookEvent::WorkflowRun(serde_json::from_slice(
            body,
        )?))),
        "release" => Ok(Some(WebhookEvent::Release(serde_json::from_slice(body)?))),
        "registry_package" => Ok(Some(WebhookEvent::RegistryPackage(
            serde_json::from_slice(body)?,
        ))),
        _ => Ok(None),
    }
}

/// Extract `(owner, repo)` from an `api.github.com/repos/...` object URL.
pub fn owner_repo_from_api_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("https://api.github.com/repos/")?;
    let mut parts = rest.split('/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}
