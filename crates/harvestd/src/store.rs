//! Filesystem job store.
//!
//! The jobs directory is the authoritative work queue: one `<id>.json`
//! file per pending job, written atomically (temp file in the same
//! directory, then rename) so a concurrent reader sees either the old
//! record or the new one, never a partial write. Removal goes through
//! soft-delete: when a quarantine directory is configured the file is
//! moved there instead of unlinked.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use harvest_core::job::{Job, JobDecodeError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to decode job {path}: {source}")]
    Decode {
        path: PathBuf,
        source: JobDecodeError,
    },
    #[error("failed to persist job {path}: {source}")]
    Persist {
        path: PathBuf,
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct JobStore {
    jobs_dir: PathBuf,
    soft_delete_jobs: Option<PathBuf>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs_dir", &self.jobs_dir)
            .field("soft_delete_jobs", &self.soft_delete_jobs)
            .finish()
    }
}

impl JobStore {
    pub fn new(jobs_dir: &Path, soft_delete_jobs: Option<&Path>) -> Result<Self> {
        fs::create_dir_all(jobs_dir)?;
        if let Some(dir) = soft_delete_jobs {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            jobs_dir: jobs_dir.to_path_buf(),
            soft_delete_jobs: soft_delete_jobs.map(Path::to_path_buf),
        })
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Persist a job as `<jobs_dir>/<id>.json`. Saving the same ID again
    /// replaces the previous record via the same atomic rename.
    pub fn save(&self, job: &Job) -> Result<PathBuf> {
        let bytes = job.encode()?;
        let path = self.jobs_dir.join(format!("{}.json", job.id()));

        let mut tmp = tempfile::NamedTempFile::new_in(&self.jobs_dir)?;
        io::Write::write_all(&mut tmp, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o640))?;
        }
        tmp.persist(&path).map_err(|e| StoreError::Persist {
            path: path.clone(),
            source: e.error,
        })?;

        Ok(path)
    }

    /// Read a job record back, remembering where it came from.
    pub fn load(path: &Path) -> Result<Job> {
        let bytes = fs::read(path)?;
        let mut job = Job::decode(&bytes).map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        job.meta_mut().persisted_path = Some(path.to_path_buf());
        Ok(job)
    }

    /// Enumerate persisted job files. Dot-files and anything that is not
    /// `*.json` are scratch files of the atomic writer and are skipped.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            paths.push(path);
        }
        paths.sort();
        Ok(paths)
    }

    /// Remove a handled job file via soft-delete.
    pub fn remove(&self, job: &Job) {
        let Some(path) = job.persisted_path() else {
            return;
        };
        if let Err(err) = soft_delete(path, self.soft_delete_jobs.as_deref()) {
            warn!(path = %path.display(), error = %err, "failed to remove persisted job");
            return;
        }
        debug!(path = %path.display(), "removed persisted job");
    }
}

/// Move `path` into `quarantine`, falling back to a copy across
/// filesystems, or hard-remove when no quarantine is configured.
/// A source that is already gone is not an error.
pub fn soft_delete(path: &Path, quarantine: Option<&Path>) -> io::Result<()> {
    let Some(quarantine) = quarantine else {
        return match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        };
    };

    let Some(base) = path.file_name() else {
        return Ok(());
    };
    let target = quarantine.join(base);

    match fs::rename(path, &target) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(path, &target)?;
            fs::remove_file(path)
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                target = %target.display(),
                error = %err,
                "soft-delete rename failed, hard-removing"
            );
            match fs::remove_file(path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::github::WorkflowArtifact;
    use harvest_core::job::SyncWorkflowArtifact;
    use tempfile::TempDir;

    fn sample_job() -> Job {
        Job::SyncWorkflowArtifact(SyncWorkflowArtifact::new(
            WorkflowArtifact {
                id: Some(7),
                name: Some("bin.zip".to_string()),
                url: Some("https://api.github.com/repos/o/r/actions/artifacts/7".to_string()),
                expired: Some(false),
                workflow_run: Some(harvest_core::github::ArtifactWorkflowRun {
                    id: Some(9),
                    head_sha: Some("abc".to_string()),
                }),
            },
            "1.2.3".to_string(),
            vec![],
            None,
        ))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path(), None).unwrap();

        let job = sample_job();
        let path = store.save(&job).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("{}.json", job.id())
        );

        let loaded = JobStore::load(&path).unwrap();
        assert_eq!(loaded.id(), job.id());
        assert_eq!(loaded.persisted_path(), Some(path.as_path()));
    }

    #[test]
    fn loaded_id_matches_file_stem() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path(), None).unwrap();
        let path = store.save(&sample_job()).unwrap();

        let loaded = JobStore::load(&path).unwrap();
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(loaded.id(), stem);
    }

    #[test]
    fn save_same_id_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path(), None).unwrap();

        store.save(&sample_job()).unwrap();
        store.save(&sample_job()).unwrap();
        assert_eq!(store.scan().unwrap().len(), 1);
    }

    #[test]
    fn scan_skips_scratch_files() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path(), None).unwrap();
        let path = store.save(&sample_job()).unwrap();

        fs::write(dir.path().join(".tmp123456"), b"partial").unwrap();
        fs::write(dir.path().join("notes.txt"), b"not a job").unwrap();
        fs::create_dir(dir.path().join("subdir.json")).unwrap();

        assert_eq!(store.scan().unwrap(), vec![path]);
    }

    #[test]
    fn load_reports_unknown_kind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mystery.json");
        fs::write(&path, br#"{"meta":{"id":"mystery","type":"mystery"}}"#).unwrap();

        let err = JobStore::load(&path).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Decode {
                source: JobDecodeError::UnknownKind(_),
                ..
            }
        ));
    }

    #[test]
    fn soft_delete_without_quarantine_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("victim");
        fs::write(&path, b"x").unwrap();

        soft_delete(&path, None).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn soft_delete_moves_into_quarantine() {
        let dir = TempDir::new().unwrap();
        let quarantine = dir.path().join("trash");
        fs::create_dir(&quarantine).unwrap();
        let path = dir.path().join("victim.json");
        fs::write(&path, b"x").unwrap();

        soft_delete(&path, Some(&quarantine)).unwrap();
        assert!(!path.exists());
        assert!(quarantine.join("victim.json").exists());
    }

    #[test]
    fn soft_delete_of_missing_source_is_ok() {
        let dir = TempDir::new().unwrap();
        soft_delete(&dir.path().join("never-existed"), None).unwrap();
        soft_delete(&dir.path().join("never-existed"), Some(dir.path())).unwrap();
    }

    #[test]
    fn remove_uses_quarantine_for_jobs() {
        let dir = TempDir::new().unwrap();
        let quarantine = TempDir::new().unwrap();
        let store = JobStore::new(dir.path(), Some(quarantine.path())).unwrap();

        let path = store.save(&sample_job()).unwrap();
        let loaded = JobStore::load(&path).unwrap();
        store.remove(&loaded);

        assert!(!path.exists());
        assert!(quarantine
            .path()
            .join(path.file_name().unwrap())
            .exists());
    }
}
