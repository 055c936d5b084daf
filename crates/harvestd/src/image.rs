//! Container image preparation.
//!
//! Consumes the downloaded archive (optional verbatim index JSON plus one
//! docker-save tarball per platform, named after the registry-observed
//! digest) and produces what the uploader pushes: either a single image
//! or a rebuilt multi-platform index.
//!
//! Reconstructing an image from its tarball yields a different manifest
//! digest than the registry served (the layers are stored decompressed),
//! so the archive keys every tarball by the *original* digest recovered
//! from the filename. Attestation manifests reference their subject by
//! that original digest; the rebuild rewrites those references to the
//! post-reconstruction digests, otherwise the destination would reject an
//! attestation pointing at a manifest that was never uploaded.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use harvest_core::config::Destination;
use harvest_core::manifest::{
    ConfigFile, Descriptor, Digest, DigestError, ImageManifest, IndexManifest, Platform,
    ANNOTATION_REFERENCE_DIGEST, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER,
    MEDIA_TYPE_OCI_MANIFEST,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::registry::{Reference, RegistryError};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("malformed {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },
    #[error("tarball carries no manifest.json")]
    MissingTarballManifest,
    #[error("tarball manifest lists no image")]
    EmptyTarballManifest,
    #[error("tarball is missing entry {0}")]
    MissingTarballEntry(String),
    #[error("archive entry {0} does not encode a digest")]
    BadEntryName(#[source] DigestError),
    #[error("index references {0} but the archive has no matching tarball")]
    MissingContainer(Digest),
    #[error("index contains reference w/o digest: {0}")]
    AttestationWithoutReference(Digest),
    #[error("index contains multiple attestations for the same reference: {reference}: {first} vs. {second}")]
    AttestationConflict {
        reference: String,
        first: Digest,
        second: Digest,
    },
    #[error(transparent)]
    Reference(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, ImageError>;

fn json_err(context: &str) -> impl FnOnce(serde_json::Error) -> ImageError + '_ {
    move |source| ImageError::Json {
        context: context.to_string(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub digest: Digest,
    pub bytes: Vec<u8>,
}

/// An image reconstructed from (or destined for) a docker-save tarball.
/// The manifest is rebuilt from the actual blob contents, so `digest`
/// reflects the bytes that will be pushed, not what the source registry
/// served.
#[derive(Debug, Clone)]
pub struct TarballImage {
    pub digest: Digest,
    pub manifest: ImageManifest,
    pub manifest_bytes: Vec<u8>,
    pub config: ConfigFile,
    pub config_bytes: Vec<u8>,
    pub layers: Vec<LayerBlob>,
}

/// docker-save top-level manifest entry.
#[derive(Debug, Serialize, Deserialize)]
struct TarballEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

impl TarballImage {
    /// Assemble an image from a config blob and ordered, decompressed
    /// layer blobs.
    pub fn from_parts(config_bytes: Vec<u8>, layer_bytes: Vec<Vec<u8>>) -> Result<Self> {
        let config: ConfigFile =
            serde_json::from_slice(&config_bytes).map_err(json_err("image config"))?;

        let layers: Vec<LayerBlob> = layer_bytes
            .into_iter()
            .map(|bytes| LayerBlob {
                digest: Digest::from_bytes(&bytes),
                bytes,
            })
            .collect();

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor {
                media_type: MEDIA_TYPE_OCI_CONFIG.to_string(),
                digest: Digest::from_bytes(&config_bytes),
                size: config_bytes.len() as i64,
                platform: None,
                annotations: BTreeMap::new(),
            },
            layers: layers
                .iter()
                .map(|layer| Descriptor {
                    media_type: MEDIA_TYPE_OCI_LAYER.to_string(),
                    digest: layer.digest.clone(),
                    size: layer.bytes.len() as i64,
                    platform: None,
                    annotations: BTreeMap::new(),
                })
                .collect(),
            annotations: BTreeMap::new(),
        };
        let manifest_bytes =
            serde_json::to_vec(&manifest).map_err(json_err("image manifest"))?;
        let digest = Digest::from_bytes(&manifest_bytes);

        Ok(Self {
            digest,
            manifest,
            manifest_bytes,
            config,
            config_bytes,
            layers,
        })
    }

    /// Read a docker-save tarball back into an image.
    pub fn read<R: Read>(reader: R) -> Result<Self> {
        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            entries.insert(name, bytes);
        }

        let manifest_bytes = entries
            .get("manifest.json")
            .ok_or(ImageError::MissingTarballManifest)?;
        let tarball_manifest: Vec<TarballEntry> =
            serde_json::from_slice(manifest_bytes).map_err(json_err("tarball manifest"))?;
        let entry = tarball_manifest
            .into_iter()
            .next()
            .ok_or(ImageError::EmptyTarballManifest)?;

        let config_bytes = entries
            .remove(&entry.config)
            .ok_or_else(|| ImageError::MissingTarballEntry(entry.config.clone()))?;
        let mut layers = Vec::with_capacity(entry.layers.len());
        for layer in &entry.layers {
            layers.push(
                entries
                    .remove(layer)
                    .ok_or_else(|| ImageError::MissingTarballEntry(layer.clone()))?,
            );
        }

        Self::from_parts(config_bytes, layers)
    }

    /// Write the image in docker-save layout: config and layer blobs
    /// named after their digests, plus the manifest.json directory.
    pub fn write_tarball<W: Write>(&self, writer: W) -> std::io::Result<()> {
        let mut builder = tar::Builder::new(writer);

        let config_name = format!("{}.json", self.manifest.config.digest.hex);
        append_file(&mut builder, &config_name, &self.config_bytes)?;

        let mut layer_names = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let name = format!("{}.tar", layer.digest.hex);
            append_file(&mut builder, &name, &layer.bytes)?;
            layer_names.push(name);
        }

        let manifest = vec![TarballEntry {
            config: config_name,
            repo_tags: Vec::new(),
            layers: layer_names,
        }];
        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        append_file(&mut builder, "manifest.json", &manifest_bytes)?;

        builder.into_inner()?.flush()
    }

    pub fn platform(&self) -> Option<Platform> {
        self.config.platform()
    }
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}

/// What the uploader pushes for one destination.
#[derive(Debug)]
pub enum PushTarget {
    Image(TarballImage),
    Index {
        manifest: IndexManifest,
        bytes: Vec<u8>,
        digest: Digest,
        images: Vec<TarballImage>,
    },
}

#[derive(Debug)]
pub struct PreparedPush {
    pub reference: Reference,
    pub target: PushTarget,
}

/// Filter an index down to the platforms a destination accepts.
///
/// Images and their attestations travel as pairs: dropping an image drops
/// its attestation, and the surviving manifest list interleaves each image
/// with its attestation. An attestation without a reference digest, or two
/// attestations claiming the same reference, reject the whole archive.
pub fn prepare_index_for_destination(
    index: &mut IndexManifest,
    dst: &Destination,
) -> Result<()> {
    let mut images: Vec<Descriptor> = Vec::new();
    let mut attestations: BTreeMap<String, Descriptor> = BTreeMap::new();

    for desc in index.manifests.drain(..) {
        if !desc.is_attestation() {
            images.push(desc);
            continue;
        }

        let Some(reference) = desc.reference_digest().map(str::to_string) else {
            return Err(ImageError::AttestationWithoutReference(desc.digest));
        };
        if let Some(previous) = attestations.get(&reference) {
            return Err(ImageError::AttestationConflict {
                reference,
                first: previous.digest.clone(),
                second: desc.digest,
            });
        }
        attestations.insert(reference, desc);
    }

    images.retain(|image| dst.accepts_platform(image.platform.as_ref()));

    let mut manifests = Vec::with_capacity(images.len() * 2);
    for image in images {
        let attestation = attestations.remove(&image.digest.to_string());
        manifests.push(image);
        if let Some(attestation) = attestation {
            manifests.push(attestation);
        }
    }
    index.manifests = manifests;

    Ok(())
}

/// Parse the image archive, filter by the destination's platforms and
/// produce the push target. `Ok(None)` means nothing matched, which is a
/// no-op rather than an error.
pub fn prepare_for_push(
    archive_path: &Path,
    reference: &str,
    dst: &Destination,
) -> Result<Option<PreparedPush>> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut containers: BTreeMap<Digest, TarballImage> = BTreeMap::new();
    let mut index: Option<IndexManifest> = None;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let path = Path::new(&name);
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                index = Some(
                    serde_json::from_slice(&bytes).map_err(json_err("index manifest"))?,
                );
            }
            Some("tar") => {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default();
                let original_digest =
                    Digest::from_file_stem(stem).map_err(ImageError::BadEntryName)?;
                let image = TarballImage::read(&mut entry)?;
                containers.insert(original_digest, image);
            }
            _ => {}
        }
    }

    match index.as_mut() {
        None => {
            containers.retain(|_, image| dst.accepts_platform(image.platform().as_ref()));
        }
        Some(index) => {
            prepare_index_for_destination(index, dst)?;
            let keep: Vec<Digest> = index.manifests.iter().map(|d| d.digest.clone()).collect();
            containers.retain(|original, _| keep.contains(original));
        }
    }

    if containers.is_empty() {
        debug!(archive = %archive_path.display(), "no matching platforms, skipping");
        return Ok(None);
    }

    let reference = Reference::parse(reference)?;

    let index = match index {
        Some(index) if index.manifests.len() > 1 => index,
        // No index, or a single surviving entry: push the one image.
        _ => {
            let Some(image) = containers.into_values().next() else {
                return Ok(None);
            };
            return Ok(Some(PreparedPush {
                reference,
                target: PushTarget::Image(image),
            }));
        }
    };
    let mut rebuilt = IndexManifest::empty();
    let mut images = Vec::with_capacity(index.manifests.len());
    for desc in &index.manifests {
        let container = containers
            .get(&desc.digest)
            .ok_or_else(|| ImageError::MissingContainer(desc.digest.clone()))?;

        let mut annotations = desc.annotations.clone();
        if desc.is_attestation() {
            if let Some(original_reference) = desc.reference_digest() {
                if let Ok(original) = Digest::parse(original_reference) {
                    if let Some(referenced) = containers.get(&original) {
                        annotations.insert(
                            ANNOTATION_REFERENCE_DIGEST.to_string(),
                            referenced.digest.to_string(),
                        );
                    }
                }
            }
        }

        rebuilt.manifests.push(Descriptor {
            media_type: container
                .manifest
                .media_type
                .clone()
                .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string()),
            digest: container.digest.clone(),
            size: container.manifest_bytes.len() as i64,
            platform: container.platform(),
            annotations,
        });
        images.push(container.clone());
    }

    let bytes = serde_json::to_vec(&rebuilt).map_err(json_err("rebuilt index"))?;
    let digest = Digest::from_bytes(&bytes);

    Ok(Some(PreparedPush {
        reference,
        target: PushTarget::Index {
            manifest: rebuilt,
            bytes,
            digest,
            images,
        },
    }))
}
