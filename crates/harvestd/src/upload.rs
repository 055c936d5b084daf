//! Destination upload pass.
//!
//! Generic destinations receive the contents of a downloaded zip file by
//! file, skipping anything whose destination-side hash already matches.
//! Docker destinations receive the prepared image or rebuilt index, then
//! the per-platform sub-images get convenience tags. Failures against the
//! registry are classified: temporary transport conditions leave the job
//! for a later tick, everything else discards it.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::eyre;
use harvest_core::config::{Destination, DestinationKind};
use harvest_core::hash::{md5_base64, sha256_base64};
use harvest_core::job::SyncContainerRegistryPackage;
use harvest_core::manifest::{Digest, IndexManifest, MEDIA_TYPE_OCI_INDEX};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{flatten_errors, JobError, JobResult};
use crate::gcp::{GcpClient, SCOPE_CLOUD_PLATFORM};
use crate::image::{prepare_for_push, PushTarget, TarballImage};
use crate::metrics::Metrics;
use crate::registry::{Reference, RegistryAuth, RegistryClient, RegistryError};

/// Upper bound for one destination's upload pass.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct Uploader {
    gcp: Arc<GcpClient>,
    registry: Arc<RegistryClient>,
    metrics: Arc<Metrics>,
}

impl Uploader {
    pub fn new(gcp: Arc<GcpClient>, registry: Arc<RegistryClient>, metrics: Arc<Metrics>) -> Self {
        Self {
            gcp,
            registry,
            metrics,
        }
    }

    /// Upload the files inside `archive` to every generic destination.
    /// Per-file failures are collected so one bad file does not abort the
    /// rest; the joined error leaves the job retryable.
    pub async fn sync_files(
        &self,
        destinations: &[Destination],
        version: &str,
        archive: &Path,
    ) -> JobResult {
        let mut errs = Vec::new();
        for dst in destinations {
            match dst.kind {
                DestinationKind::GcpArtifactRegistryGeneric => {
                    let result = timeout(
                        UPLOAD_TIMEOUT,
                        self.upload_zip_to_generic(dst, version, archive),
                    )
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => errs.push(err),
                        Err(_) => errs.push(eyre!(
                            "upload to {} timed out after {:?}",
                            dst.path,
                            UPLOAD_TIMEOUT
                        )),
                    }
                }
                DestinationKind::GcpArtifactRegistryDocker => {
                    return Err(JobError::discard(eyre!(
                        "unexpected destination type for a file artifact: {}",
                        dst.kind.as_str()
                    )));
                }
            }
        }
        flatten_errors(errs).map_err(JobError::retry)
    }

    async fn upload_zip_to_generic(
        &self,
        dst: &Destination,
        version: &str,
        archive: &Path,
    ) -> eyre::Result<()> {
        let token = self.gcp.access_token(SCOPE_CLOUD_PLATFORM).await?;

        let file = std::fs::File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file)?;

        let mut errs = Vec::new();
        for i in 0..zip.len() {
            let (name, bytes) = match read_zip_entry(&mut zip, i)? {
                ZipEntryOutcome::Dir => continue,
                ZipEntryOutcome::ReadError { name, err } => {
                    warn!(file = %name, error = %err, "failed to extract artifact from the zip file");
                    errs.push(err);
                    continue;
                }
                ZipEntryOutcome::Extracted { name, bytes } => (name, bytes),
            };

            match self
                .upload_one_file(dst, version, &name, bytes, &token)
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    warn!(file = %name, error = %err, "failed to upload artifact");
                    errs.push(err);
                }
            }
        }
        flatten_errors(errs)
    }

    async fn upload_one_file(
        &self,
        dst: &Destination,
        version: &str,
        name: &str,
        bytes: Vec<u8>,
        token: &str,
    ) -> eyre::Result<()> {
        let filter = format!(
            r#"name="{}/files/{}:{}:{}""#,
            dst.path, dst.package, version, name
        );
        let existing = self.gcp.list_files(&dst.path, &filter, token).await?;

        if let Some(first) = existing.first() {
            if existing.len() > 1 {
                warn!(
                    file = name,
                    "more than 1 artifact with the same name already exists at the destination"
                );
            }
            for hash in &first.hashes {
                match hash.hash_type.as_str() {
                    "SHA256" => {
                        if sha256_base64(&mut &bytes[..])? == hash.value {
                            info!(file = name, "artifact file is already uploaded, skipping");
                            self.metrics.files_skipped.inc();
                            return Ok(());
                        }
                        break;
                    }
                    "MD5" => {
                        if md5_base64(&mut &bytes[..])? == hash.value {
                            info!(file = name, "artifact file is already uploaded, skipping");
                            self.metrics.files_skipped.inc();
                            return Ok(());
                        }
                        break;
                    }
                    other => {
                        warn!(hash_type = other, "unexpected hash type");
                    }
                }
            }
            info!(
                file = name,
                "artifact file already exists at the destination, but hashes don't match, overwriting"
            );
        }

        let size = bytes.len();
        self.gcp
            .upload_generic(&dst.path, name, &dst.package, version, bytes, token)
            .await?;
        self.metrics.files_uploaded.inc();
        info!(file = name, size, "uploaded artifact to the destination");
        Ok(())
    }

    /// Push the prepared image or index to every docker destination.
    pub async fn sync_container(
        &self,
        job: &SyncContainerRegistryPackage,
        archive: &Path,
    ) -> JobResult {
        for dst in &job.destinations {
            match dst.kind {
                DestinationKind::GcpArtifactRegistryDocker => {
                    if job.is_tagless() {
                        info!(package = job.package_name(), "image is tag-less, skipping");
                        continue;
                    }
                    match timeout(UPLOAD_TIMEOUT, self.push_container(job, dst, archive)).await {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(JobError::retry(eyre!(
                                "push to {} timed out after {:?}",
                                dst.path,
                                UPLOAD_TIMEOUT
                            )));
                        }
                    }
                }
                DestinationKind::GcpArtifactRegistryGeneric => {
                    return Err(JobError::discard(eyre!(
                        "unexpected destination type for a container package: {}",
                        dst.kind.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn push_container(
        &self,
        job: &SyncContainerRegistryPackage,
        dst: &Destination,
        archive: &Path,
    ) -> JobResult {
        let reference = job.destination_reference(dst);
        let prepared = prepare_for_push(archive, &reference, dst)
            .map_err(|err| JobError::discard(eyre!("failed to prepare image: {err}")))?;
        let Some(prepared) = prepared else {
            return Ok(());
        };

        let token = self
            .gcp
            .access_token(SCOPE_CLOUD_PLATFORM)
            .await
            .map_err(|err| JobError::retry(eyre!("failed to get destination token: {err}")))?;
        let auth = RegistryAuth::oauth2(token);

        debug!(reference = %prepared.reference, "pushing container to the destination");
        match &prepared.target {
            PushTarget::Image(image) => {
                self.push_image(&prepared.reference, image, None, &auth)
                    .await
                    .map_err(classify_push_error)?;
            }
            PushTarget::Index {
                manifest: _,
                bytes,
                digest: _,
                images,
            } => {
                for image in images {
                    let identifier = image.digest.to_string();
                    self.push_image(&prepared.reference, image, Some(&identifier), &auth)
                        .await
                        .map_err(classify_push_error)?;
                }
                self.registry
                    .put_manifest(
                        &prepared.reference,
                        &prepared.reference.identifier(),
                        MEDIA_TYPE_OCI_INDEX,
                        bytes.clone(),
                        &auth,
                    )
                    .await
                    .map_err(classify_push_error)?;

                if let Err(err) = self.tag_sub_images(&prepared.reference, &auth).await {
                    warn!(
                        reference = %prepared.reference,
                        error = %err,
                        "failed to tag sub-images of the container index"
                    );
                }
            }
        }

        self.metrics.images_pushed.inc();
        info!(reference = %prepared.reference, "pushed container image to the destination");
        Ok(())
    }

    /// Upload an image's blobs and its manifest. The manifest lands under
    /// `identifier` when given (sub-images go by digest), else under the
    /// reference's own tag.
    async fn push_image(
        &self,
        reference: &Reference,
        image: &TarballImage,
        identifier: Option<&str>,
        auth: &RegistryAuth,
    ) -> Result<(), RegistryError> {
        for layer in &image.layers {
            self.upload_blob_if_missing(reference, &layer.digest, &layer.bytes, auth)
                .await?;
        }
        self.upload_blob_if_missing(
            reference,
            &image.manifest.config.digest,
            &image.config_bytes,
            auth,
        )
        .await?;

        let identifier = identifier
            .map(str::to_string)
            .unwrap_or_else(|| reference.identifier());
        let media_type = image
            .manifest
            .media_type
            .clone()
            .unwrap_or_else(|| harvest_core::manifest::MEDIA_TYPE_OCI_MANIFEST.to_string());
        self.registry
            .put_manifest(
                reference,
                &identifier,
                &media_type,
                image.manifest_bytes.clone(),
                auth,
            )
            .await
    }

    async fn upload_blob_if_missing(
        &self,
        reference: &Reference,
        digest: &Digest,
        bytes: &[u8],
        auth: &RegistryAuth,
    ) -> Result<(), RegistryError> {
        if self.registry.blob_exists(reference, digest, auth).await? {
            return Ok(());
        }
        self.registry
            .upload_blob(reference, digest, bytes.to_vec(), auth)
            .await
    }

    /// Fetch the just-pushed index back and tag its members:
    /// `<tag>-<os>-<arch>` per image, `<tag>-<os>-<arch>-attestation` per
    /// attestation, keyed by the image it references.
    async fn tag_sub_images(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
    ) -> eyre::Result<()> {
        let Some(base_tag) = reference.tag.clone() else {
            return Ok(());
        };

        let pushed = self.registry.get_manifest(reference, auth).await?;
        let index: IndexManifest = serde_json::from_slice(&pushed.bytes)?;

        let mut errs = Vec::new();
        for desc in &index.manifests {
            let tag = if desc.is_attestation() {
                let referenced = desc.reference_digest().and_then(|digest| {
                    index
                        .manifests
                        .iter()
                        .find(|m| m.digest.to_string() == digest)
                });
                let Some(platform) = referenced.and_then(|m| m.platform.as_ref()) else {
                    continue;
                };
                format!(
                    "{base_tag}-{}-{}-attestation",
                    platform.os, platform.architecture
                )
            } else {
                let Some(platform) = desc.platform.as_ref() else {
                    continue;
                };
                if platform.is_unknown() {
                    continue;
                }
                format!("{base_tag}-{}-{}", platform.os, platform.architecture)
            };

            let result: eyre::Result<()> = async {
                let manifest = self
                    .registry
                    .get_manifest_by_digest(reference, &desc.digest, auth)
                    .await?;
                self.registry
                    .put_manifest(reference, &tag, &manifest.media_type, manifest.bytes, auth)
                    .await?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => debug!(tag, "tagged a sub-image"),
                Err(err) => {
                    warn!(tag, error = %err, "failed to tag a sub-image");
                    errs.push(err);
                }
            }
        }
        flatten_errors(errs)
    }
}

/// Outcome of extracting a single zip entry.
enum ZipEntryOutcome {
    Dir,
    Extracted { name: String, bytes: Vec<u8> },
    ReadError { name: String, err: eyre::Error },
}

/// Extracts the `i`-th entry of `zip` into memory. Kept as a synchronous
/// helper so the non-`Send` `ZipFile` handle never needs to live across an
/// `.await` point in the caller.
fn read_zip_entry(
    zip: &mut zip::ZipArchive<std::fs::File>,
    i: usize,
) -> eyre::Result<ZipEntryOutcome> {
    let mut entry = zip.by_index(i)?;
    if entry.is_dir() {
        return Ok(ZipEntryOutcome::Dir);
    }
    let name = entry.name().to_string();
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    if let Err(err) = entry.read_to_end(&mut bytes) {
        return Ok(ZipEntryOutcome::ReadError {
            name,
            err: err.into(),
        });
    }
    Ok(ZipEntryOutcome::Extracted { name, bytes })
}

/// Chosen retry policy for registry pushes: a non-temporary transport
/// error will fail the same way next tick, so the job is discarded;
/// everything temporary stays retryable.
fn classify_push_error(err: RegistryError) -> JobError {
    if err.is_temporary() {
        JobError::retry(eyre!("failed to push container image: {err}"))
    } else {
        JobError::discard(eyre!("failed to push container image: {err}"))
    }
}
