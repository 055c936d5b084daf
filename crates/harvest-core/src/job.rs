//! Persisted job records.
//!
//! A job is one unit of mirroring work, written to the jobs directory as
//! `<id>.json` and re-read on every scheduler tick until it is removed.
//! The wire format is `{"meta":{"id","type"},…variant fields…}`; the
//! `type` tag selects the variant on decode. IDs derive from the GitHub
//! identifiers of the triggering object so a re-delivered event lands on
//! the same file, and fall back to `<type>-noid-<random64>` so the file
//! name is always unique.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Destination;
use crate::github::{
    owner_repo_from_api_url, RegistryPackage, ReleaseAsset, Repository, WorkflowArtifact,
    WorkflowRun, WorkflowRunEvent,
};

pub const KIND_CLEANUP_UNPARSEABLE: &str = "cleanup-unparseable";
pub const KIND_DISCOVER_WORKFLOW_ARTIFACTS: &str = "discover-workflow-artifacts";
pub const KIND_SYNC_WORKFLOW_ARTIFACT: &str = "sync-workflow-artifact";
pub const KIND_SYNC_RELEASE_ASSET: &str = "sync-release-asset";
pub const KIND_SYNC_CONTAINER_REGISTRY_PACKAGE: &str = "sync-container-registry-package";

#[derive(Debug, Error)]
pub enum JobDecodeError {
    #[error("unknown job type: {0}")]
    UnknownKind(String),
    #[error("malformed job record: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "cleanup-unparseable")]
    CleanupUnparseable,
    #[serde(rename = "discover-workflow-artifacts")]
    DiscoverWorkflowArtifacts,
    #[serde(rename = "sync-workflow-artifact")]
    SyncWorkflowArtifact,
    #[serde(rename = "sync-release-asset")]
    SyncReleaseAsset,
    #[serde(rename = "sync-container-registry-package")]
    SyncContainerRegistryPackage,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CleanupUnparseable => KIND_CLEANUP_UNPARSEABLE,
            Self::DiscoverWorkflowArtifacts => KIND_DISCOVER_WORKFLOW_ARTIFACTS,
            Self::SyncWorkflowArtifact => KIND_SYNC_WORKFLOW_ARTIFACT,
            Self::SyncReleaseAsset => KIND_SYNC_RELEASE_ASSET,
            Self::SyncContainerRegistryPackage => KIND_SYNC_CONTAINER_REGISTRY_PACKAGE,
        }
    }
}

/// Envelope shared by every job variant. `persisted_path` is set only on
/// records loaded back from disk and never serialised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    #[serde(skip)]
    pub persisted_path: Option<PathBuf>,
}

impl Meta {
    fn new(kind: JobKind, id: String) -> Self {
        Self {
            id,
            kind,
            persisted_path: None,
        }
    }
}

fn noid(kind: &str) -> String {
    format!("{kind}-noid-{}", rand::random::<u64>())
}

/// Synthetic job pointing at a file in the jobs directory that failed to
/// decode; handling it removes the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupUnparseable {
    pub meta: Meta,
}

impl CleanupUnparseable {
    pub fn new(path: &Path) -> Self {
        let mut meta = Meta::new(JobKind::CleanupUnparseable, noid(KIND_CLEANUP_UNPARSEABLE));
        meta.persisted_path = Some(path.to_path_buf());
        Self { meta }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverWorkflowArtifacts {
    pub meta: Meta,
    pub workflow_run_event: WorkflowRunEvent,
}

impl DiscoverWorkflowArtifacts {
    pub fn new(event: WorkflowRunEvent) -> Self {
        let id = match event.workflow_run.as_ref().and_then(|r| r.id) {
            Some(run_id) => format!("{KIND_DISCOVER_WORKFLOW_ARTIFACTS}-{run_id}"),
            None => noid(KIND_DISCOVER_WORKFLOW_ARTIFACTS),
        };
        Self {
            meta: Meta::new(JobKind::DiscoverWorkflowArtifacts, id),
            workflow_run_event: event,
        }
    }

    pub fn repo_full_name(&self) -> &str {
        self.workflow_run_event.repo_full_name()
    }

    pub fn repo_owner(&self) -> &str {
        self.workflow_run_event.repo_owner()
    }

    pub fn repo(&self) -> &str {
        self.workflow_run_event.repo_name()
    }

    pub fn workflow_file(&self) -> &str {
        self.workflow_run_event.workflow_file()
    }

    pub fn run_id(&self) -> i64 {
        self.workflow_run_event.run_id()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncWorkflowArtifact {
    pub meta: Meta,
    pub artifact: WorkflowArtifact,
    pub version: String,
    pub destinations: Vec<Destination>,
    pub workflow_run: Option<WorkflowRun>,
}

impl SyncWorkflowArtifact {
    pub fn new(
        artifact: WorkflowArtifact,
        version: String,
        destinations: Vec<Destination>,
        workflow_run: Option<WorkflowRun>,
    ) -> Self {
        let id = match (
            artifact.id,
            artifact.workflow_run.as_ref().and_then(|r| r.id),
        ) {
            (Some(artifact_id), Some(run_id)) => {
                format!("{KIND_SYNC_WORKFLOW_ARTIFACT}-{run_id}-{artifact_id}")
            }
            _ => noid(KIND_SYNC_WORKFLOW_ARTIFACT),
        };
        Self {
            meta: Meta::new(JobKind::SyncWorkflowArtifact, id),
            artifact,
            version,
            destinations,
            workflow_run,
        }
    }

    pub fn artifact_id(&self) -> i64 {
        self.artifact.id()
    }

    pub fn artifact_name(&self) -> &str {
        self.artifact.name()
    }

    pub fn run_id(&self) -> i64 {
        self.artifact.run_id()
    }

    pub fn repo_owner(&self) -> &str {
        self.artifact
            .url
            .as_deref()
            .and_then(owner_repo_from_api_url)
            .map(|(owner, _)| owner)
            .unwrap_or_default()
    }

    pub fn repo(&self) -> &str {
        self.artifact
            .url
            .as_deref()
            .and_then(owner_repo_from_api_url)
            .map(|(_, repo)| repo)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReleaseAsset {
    pub meta: Meta,
    pub asset: ReleaseAsset,
    pub destinations: Vec<Destination>,
    pub version: String,
}

impl SyncReleaseAsset {
    pub fn new(asset: ReleaseAsset, version: String, destinations: Vec<Destination>) -> Self {
        let id = match asset.id {
            Some(asset_id) => format!("{KIND_SYNC_RELEASE_ASSET}-{asset_id}"),
            None => noid(KIND_SYNC_RELEASE_ASSET),
        };
        Self {
            meta: Meta::new(JobKind::SyncReleaseAsset, id),
            asset,
            destinations,
            version,
        }
    }

    pub fn asset_id(&self) -> i64 {
        self.asset.id()
    }

    pub fn asset_name(&self) -> &str {
        self.asset.name()
    }

    pub fn asset_url(&self) -> &str {
        self.asset.url.as_deref().unwrap_or_default()
    }

    pub fn repo_owner(&self) -> &str {
        self.asset
            .url
            .as_deref()
            .and_then(owner_repo_from_api_url)
            .map(|(owner, _)| owner)
            .unwrap_or_default()
    }

    pub fn repo(&self) -> &str {
        self.asset
            .url
            .as_deref()
            .and_then(owner_repo_from_api_url)
            .map(|(_, repo)| repo)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncContainerRegistryPackage {
    pub meta: Meta,
    pub package: RegistryPackage,
    pub repository: Option<Repository>,
    pub destinations: Vec<Destination>,
}

impl SyncContainerRegistryPackage {
    pub fn new(
        package: RegistryPackage,
        repository: Option<Repository>,
        destinations: Vec<Destination>,
    ) -> Self {
        let id = match package.package_version.as_ref().and_then(|v| v.id) {
            Some(version_id) => {
                format!("{KIND_SYNC_CONTAINER_REGISTRY_PACKAGE}-{version_id}")
            }
            None => noid(KIND_SYNC_CONTAINER_REGISTRY_PACKAGE),
        };
        Self {
            meta: Meta::new(JobKind::SyncContainerRegistryPackage, id),
            package,
            repository,
            destinations,
        }
    }

    pub fn package_name(&self) -> &str {
        self.package.name.as_deref().unwrap_or_default()
    }

    pub fn version_id(&self) -> i64 {
        self.package
            .package_version
            .as_ref()
            .and_then(|v| v.id)
            .unwrap_or_default()
    }

    pub fn tag(&self) -> &str {
        self.package
            .package_version
            .as_ref()
            .and_then(|v| v.container_metadata.as_ref())
            .and_then(|m| m.tag.as_ref())
            .and_then(|t| t.name.as_deref())
            .unwrap_or_default()
    }

    pub fn digest(&self) -> &str {
        self.package
            .package_version
            .as_ref()
            .and_then(|v| v.container_metadata.as_ref())
            .and_then(|m| m.tag.as_ref())
            .and_then(|t| t.digest.as_deref())
            .unwrap_or_default()
    }

    pub fn is_tagless(&self) -> bool {
        self.tag().is_empty()
    }

    /// Source reference for the package. A URL ending in `:` is the
    /// registry's way of publishing a tag-less version; those are
    /// re-addressed by digest.
    pub fn package_url(&self) -> String {
        let Some(version) = self.package.package_version.as_ref() else {
            return String::new();
        };
        let url = version.package_url.as_deref().unwrap_or_default();
        if let Some(bare) = url.strip_suffix(':') {
            return match version.version.as_deref() {
                Some(digest) => format!("{bare}@{digest}"),
                None => url.to_string(),
            };
        }
        url.to_string()
    }

    /// Reference the image is pushed to. Tag-less packages fall back to
    /// the digest with `:` flattened to `-` so it stays a valid tag.
    pub fn destination_reference(&self, dst: &Destination) -> String {
        let tag = self.tag();
        let tag = if tag.is_empty() {
            self.digest().replace(':', "-")
        } else {
            tag.to_string()
        };
        format!("{}/{}:{}", dst.path, dst.package, tag)
    }

    pub fn repo_full_name(&self) -> &str {
        self.repository.as_ref().map_or("", Repository::full_name)
    }

    pub fn repo_owner(&self) -> &str {
        self.repository
            .as_ref()
            .map(Repository::full_name)
            .and_then(|full| full.split('/').next())
            .unwrap_or_default()
    }

    pub fn repo(&self) -> &str {
        self.repository
            .as_ref()
            .map(Repository::full_name)
            .and_then(|full| full.split('/').nth(1))
            .unwrap_or_default()
    }
}

/// One persisted unit of mirroring work.
#[derive(Debug, Clone)]
pub enum Job {
    CleanupUnparseable(CleanupUnparseable),
    DiscoverWorkflowArtifacts(DiscoverWorkflowArtifacts),
    SyncWorkflowArtifact(SyncWorkflowArtifact),
    SyncReleaseAsset(SyncReleaseAsset),
    SyncContainerRegistryPackage(SyncContainerRegistryPackage),
}

impl Job {
    pub fn meta(&self) -> &Meta {
        match self {
            Self::CleanupUnparseable(j) => &j.meta,
            Self::DiscoverWorkflowArtifacts(j) => &j.meta,
            Self::SyncWorkflowArtifact(j) => &j.meta,
            Self::SyncReleaseAsset(j) => &j.meta,
            Self::SyncContainerRegistryPackage(j) => &j.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Self::CleanupUnparseable(j) => &mut j.meta,
            Self::DiscoverWorkflowArtifacts(j) => &mut j.meta,
            Self::SyncWorkflowArtifact(j) => &mut j.meta,
            Self::SyncReleaseAsset(j) => &mut j.meta,
            Self::SyncContainerRegistryPackage(j) => &mut j.meta,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn kind(&self) -> JobKind {
        self.meta().kind
    }

    pub fn persisted_path(&self) -> Option<&Path> {
        self.meta().persisted_path.as_deref()
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::CleanupUnparseable(j) => serde_json::to_vec(j),
            Self::DiscoverWorkflowArtifacts(j) => serde_json::to_vec(j),
            Self::SyncWorkflowArtifact(j) => serde_json::to_vec(j),
            Self::SyncReleaseAsset(j) => serde_json::to_vec(j),
            Self::SyncContainerRegistryPackage(j) => serde_json::to_vec(j),
        }
    }

    /// Decode a persisted record: peek at the `meta.type` tag, then decode
    /// the matching variant in full.
    pub fn decode(bytes: &[u8]) -> Result<Self, JobDecodeError> {
        #[derive(Deserialize)]
        struct HeaderMeta {
            #[serde(rename = "type")]
            kind: String,
        }
        #[derive(Deserialize)]
        struct Header {
            meta: HeaderMeta,
        }

        let header: Header = serde_json::from_slice(bytes)?;
        match header.meta.kind.as_str() {
            KIND_CLEANUP_UNPARSEABLE => {
                Ok(Self::CleanupUnparseable(serde_json::from_slice(bytes)?))
            }
            KIND_DISCOVER_WORKFLOW_ARTIFACTS => Ok(Self::DiscoverWorkflowArtifacts(
                serde_json::from_slice(bytes)?,
            )),
            KIND_SYNC_WORKFLOW_ARTIFACT => {
                Ok(Self::SyncWorkflowArtifact(serde_json::from_slice(bytes)?))
            }
            KIND_SYNC_RELEASE_ASSET => Ok(Self::SyncReleaseAsset(serde_json::from_slice(bytes)?)),
            KIND_SYNC_CONTAINER_REGISTRY_PACKAGE => Ok(Self::SyncContainerRegistryPackage(
                serde_json::from_slice(bytes)?,
            )),
            other => Err(JobDecodeError::UnknownKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DestinationKind;
    use crate::github::{ArtifactWorkflowRun, ContainerMetadata, ContainerTag, PackageVersion};

    fn destination() -> Destination {
        Destination {
            kind: DestinationKind::GcpArtifactRegistryGeneric,
            path: "projects/p/locations/us/repositories/generic".to_string(),
            package: "pkg".to_string(),
            platforms: Vec::new(),
        }
    }

    fn artifact() -> WorkflowArtifact {
        WorkflowArtifact {
            id: Some(7),
            name: Some("bin-1.2.3.zip".to_string()),
            url: Some("https://api.github.com/repos/o/r/actions/artifacts/7".to_string()),
            expired: Some(false),
            workflow_run: Some(ArtifactWorkflowRun {
                id: Some(9),
                head_sha: Some("abc".to_string()),
            }),
        }
    }

    fn container_package(tag: &str, digest: &str) -> RegistryPackage {
        RegistryPackage {
            ecosystem: Some("CONTAINER".to_string()),
            name: Some("app".to_string()),
            package_type: Some("CONTAINER".to_string()),
            package_version: Some(PackageVersion {
                id: Some(42),
                version: Some(digest.to_string()),
                package_url: Some("ghcr.io/o/app:v1".to_string()),
                container_metadata: Some(ContainerMetadata {
                    tag: Some(ContainerTag {
                        name: Some(tag.to_string()),
                        digest: Some(digest.to_string()),
                    }),
                }),
            }),
        }
    }

    #[test]
    fn sync_workflow_artifact_id_combines_run_and_artifact() {
        let job = SyncWorkflowArtifact::new(artifact(), "1.2.3".to_string(), vec![], None);
        assert_eq!(job.meta.id, "sync-workflow-artifact-9-7");
        assert_eq!(job.repo_owner(), "o");
        assert_eq!(job.repo(), "r");
    }

    #[test]
    fn missing_ids_fall_back_to_noid() {
        let mut a = artifact();
        a.id = None;
        let job = SyncWorkflowArtifact::new(a, String::new(), vec![], None);
        assert!(job.meta.id.starts_with("sync-workflow-artifact-noid-"));

        let other = SyncWorkflowArtifact::new(
            WorkflowArtifact::default(),
            String::new(),
            vec![],
            None,
        );
        assert_ne!(job.meta.id, other.meta.id);
    }

    #[test]
    fn encode_decode_round_trips_modulo_persisted_path() {
        let job = Job::SyncWorkflowArtifact(SyncWorkflowArtifact::new(
            artifact(),
            "1.2.3".to_string(),
            vec![destination()],
            None,
        ));
        let bytes = job.encode().unwrap();
        let decoded = Job::decode(&bytes).unwrap();
        assert_eq!(decoded.id(), job.id());
        assert_eq!(decoded.kind(), JobKind::SyncWorkflowArtifact);
        assert!(decoded.persisted_path().is_none());
        match decoded {
            Job::SyncWorkflowArtifact(j) => {
                assert_eq!(j.version, "1.2.3");
                assert_eq!(j.destinations, vec![destination()]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn wire_format_nests_meta() {
        let job = SyncReleaseAsset::new(
            ReleaseAsset {
                id: Some(3),
                name: Some("cli.zip".to_string()),
                state: Some("uploaded".to_string()),
                content_type: Some("application/zip".to_string()),
                url: Some("https://api.github.com/repos/o/r/releases/assets/3".to_string()),
            },
            "1.0.0".to_string(),
            vec![destination()],
        );
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["meta"]["id"], "sync-release-asset-3");
        assert_eq!(value["meta"]["type"], "sync-release-asset");
        assert!(value["meta"].get("persisted_path").is_none());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let err = Job::decode(br#"{"meta":{"id":"x","type":"frobnicate"}}"#).unwrap_err();
        assert!(matches!(err, JobDecodeError::UnknownKind(k) if k == "frobnicate"));
    }

    #[test]
    fn decode_rejects_malformed_record() {
        assert!(matches!(
            Job::decode(b"{not json"),
            Err(JobDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn container_destination_reference_prefers_tag() {
        let job = SyncContainerRegistryPackage::new(
            container_package("v1", "sha256:abc123"),
            None,
            vec![],
        );
        let dst = Destination {
            kind: DestinationKind::GcpArtifactRegistryDocker,
            path: "us-docker.pkg.dev/p/images".to_string(),
            package: "app".to_string(),
            platforms: Vec::new(),
        };
        assert_eq!(
            job.destination_reference(&dst),
            "us-docker.pkg.dev/p/images/app:v1"
        );
        assert!(!job.is_tagless());
    }

    #[test]
    fn tagless_container_reference_dashes_the_digest() {
        let job = SyncContainerRegistryPackage::new(
            container_package("", "sha256:abc123"),
            None,
            vec![],
        );
        let dst = Destination {
            kind: DestinationKind::GcpArtifactRegistryDocker,
            path: "us-docker.pkg.dev/p/images".to_string(),
            package: "app".to_string(),
            platforms: Vec::new(),
        };
        assert!(job.is_tagless());
        assert_eq!(
            job.destination_reference(&dst),
            "us-docker.pkg.dev/p/images/app:sha256-abc123"
        );
    }

    #[test]
    fn tagless_package_url_readdressed_by_digest() {
        let mut package = container_package("", "sha256:abc123");
        package.package_version.as_mut().unwrap().package_url =
            Some("ghcr.io/o/app:".to_string());
        let job = SyncContainerRegistryPackage::new(package, None, vec![]);
        assert_eq!(job.package_url(), "ghcr.io/o/app@sha256:abc123");
    }

    #[test]
    fn container_repo_split_from_full_name() {
        let job = SyncContainerRegistryPackage::new(
            container_package("v1", "sha256:abc123"),
            Some(Repository {
                name: Some("r".to_string()),
                full_name: Some("o/r".to_string()),
                owner: None,
            }),
            vec![],
        );
        assert_eq!(job.meta.id, "sync-container-registry-package-42");
        assert_eq!(job.repo_owner(), "o");
        assert_eq!(job.repo(), "r");
    }
}
