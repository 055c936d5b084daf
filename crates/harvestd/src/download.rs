//! Artifact download routines.
//!
//! Everything lands under the downloads directory, namespaced by
//! repository and kind: workflow artifact zips, raw release assets, and
//! container image archives assembled from the source registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use harvest_core::job::{SyncContainerRegistryPackage, SyncReleaseAsset, SyncWorkflowArtifact};
use harvest_core::manifest::{
    is_image_media_type, is_index_media_type, Digest, ImageManifest, IndexManifest,
};
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, info};

use crate::github::{GithubClient, GithubError};
use crate::image::{ImageError, TarballImage};
use crate::registry::{Reference, RegistryAuth, RegistryClient, RegistryError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Github(#[from] GithubError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("malformed manifest from source registry: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("no images to download: {0}")]
    NoImages(String),
    #[error("invalid container image: duplicate platform: {0}")]
    DuplicatePlatform(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug)]
pub struct Downloader {
    downloads_dir: PathBuf,
    github: Arc<GithubClient>,
    registry: Arc<RegistryClient>,
}

impl Downloader {
    pub fn new(
        downloads_dir: PathBuf,
        github: Arc<GithubClient>,
        registry: Arc<RegistryClient>,
    ) -> Self {
        Self {
            downloads_dir,
            github,
            registry,
        }
    }

    /// Fetch a workflow artifact zip via a freshly minted one-shot link.
    pub async fn workflow_artifact(&self, job: &SyncWorkflowArtifact) -> Result<PathBuf> {
        let dir = self
            .downloads_dir
            .join(job.repo_owner())
            .join(job.repo())
            .join("workflows")
            .join(job.run_id().to_string());
        std::fs::create_dir_all(&dir)?;

        let url = self
            .github
            .artifact_download_url(job.repo_owner(), job.repo(), job.artifact_id())
            .await?;

        let destination = dir.join(job.artifact_name());
        // The minted link is pre-signed; no credentials on the fetch.
        self.github
            .download_to_file(&url, false, &destination)
            .await?;

        info!(artifact = job.artifact_name(), path = %destination.display(), "downloaded a workflow artifact");
        Ok(destination)
    }

    /// Fetch a release asset as raw bytes.
    pub async fn release_asset(&self, job: &SyncReleaseAsset) -> Result<PathBuf> {
        let dir = self
            .downloads_dir
            .join(job.repo_owner())
            .join(job.repo())
            .join("assets")
            .join(job.asset_id().to_string());
        std::fs::create_dir_all(&dir)?;

        let destination = dir.join(job.asset_name());
        self.github
            .download_to_file(job.asset_url(), true, &destination)
            .await?;

        info!(asset = job.asset_name(), path = %destination.display(), "downloaded a release asset");
        Ok(destination)
    }

    /// Fetch a container package into an image archive: the index JSON
    /// verbatim (when the package is multi-platform) plus one docker-save
    /// tarball per image, keyed by the registry-observed digest.
    pub async fn container(&self, job: &SyncContainerRegistryPackage) -> Result<PathBuf> {
        let dir = self
            .downloads_dir
            .join(job.repo_owner())
            .join(job.repo())
            .join("containers")
            .join(job.package_name())
            .join(job.tag());
        std::fs::create_dir_all(&dir)?;

        let token = self.github.create_installation_token().await?;
        let auth = RegistryAuth::oauth2(token);

        let package_url = job.package_url();
        let reference = Reference::parse(&package_url)?;
        let root = self.registry.get_manifest(&reference, &auth).await?;

        let mut index_entry: Option<(String, Vec<u8>)> = None;
        let mut images: Vec<(String, Digest, TarballImage)> = Vec::new();

        if is_image_media_type(&root.media_type) {
            let manifest: ImageManifest = serde_json::from_slice(&root.bytes)?;
            let image = self.fetch_image(&reference, &manifest, &auth).await?;
            images.push(("unknown/unknown".to_string(), root.digest.clone(), image));
        } else if is_index_media_type(&root.media_type) {
            index_entry = Some((format!("{}.json", root.digest.hex), root.bytes.clone()));

            let index: IndexManifest = serde_json::from_slice(&root.bytes)?;
            let mut seen = std::collections::BTreeSet::new();
            for desc in &index.manifests {
                if !is_image_media_type(&desc.media_type) {
                    continue;
                }
                let Some(platform) = &desc.platform else {
                    continue;
                };
                let label = platform.to_string();
                if !platform.is_unknown() && !seen.insert(label.clone()) {
                    return Err(DownloadError::DuplicatePlatform(label));
                }

                let response = self
                    .registry
                    .get_manifest_by_digest(&reference, &desc.digest, &auth)
                    .await?;
                let manifest: ImageManifest = serde_json::from_slice(&response.bytes)?;
                let image = self.fetch_image(&reference, &manifest, &auth).await?;

                debug!(digest = %desc.digest, platform = %label, "downloaded a container image");
                images.push((label, desc.digest.clone(), image));
            }
        }

        if images.is_empty() {
            return Err(DownloadError::NoImages(package_url));
        }

        let archive_path = dir.join(format!("{}.zip", root.digest.hex));
        let file = std::fs::File::create(&archive_path)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();

        if let Some((name, bytes)) = index_entry {
            writer.start_file(name, options)?;
            writer.write_all(&bytes)?;
        }
        for (platform, original_digest, image) in &images {
            writer.start_file(
                format!("{platform}/{}.tar", original_digest.file_stem()),
                options,
            )?;
            let mut tar_bytes = Vec::new();
            image.write_tarball(&mut tar_bytes)?;
            writer.write_all(&tar_bytes)?;
        }
        writer.finish()?;

        info!(
            package = job.package_name(),
            images = images.len(),
            path = %archive_path.display(),
            "downloaded a container package"
        );
        Ok(archive_path)
    }

    /// Pull config and layers for one image manifest, decompressing
    /// gzipped layers so the tarball carries plain tar blobs.
    async fn fetch_image(
        &self,
        reference: &Reference,
        manifest: &ImageManifest,
        auth: &RegistryAuth,
    ) -> Result<TarballImage> {
        let config_bytes = self
            .registry
            .get_blob(reference, &manifest.config.digest, auth)
            .await?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let bytes = self.registry.get_blob(reference, &layer.digest, auth).await?;
            let bytes = if layer.media_type.ends_with("+gzip")
                || layer.media_type.ends_with(".gzip")
            {
                let mut decompressed = Vec::new();
                GzDecoder::new(&bytes[..]).read_to_end(&mut decompressed)?;
                decompressed
            } else {
                bytes
            };
            layers.push(bytes);
        }

        Ok(TarballImage::from_parts(config_bytes, layers)?)
    }
}

/// Soft-delete a downloaded file and prune its now-empty directory.
pub fn remove_download(path: &Path, quarantine: Option<&Path>) {
    if let Err(err) = crate::store::soft_delete(path, quarantine) {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove downloaded file");
        return;
    }
    if let Some(parent) = path.parent() {
        // Only removes when empty; shared parents survive.
        let _ = std::fs::remove_dir(parent);
    }
    debug!(path = %path.display(), "removed a downloaded file");
}
