//! On-disk recognition artifact with atomic publish and snapshot reads.
//!
//! Writers serialize to a temporary file in the artifact's directory and
//! rename it over the target, so a reader of the file sees either the old
//! or the new model in full. In-process readers never touch the file at all:
//! they clone an `Arc` to the last published model.

use crate::lbph::{LbphError, LbphModel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Bumped whenever the serialized layout changes incompatibly.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("artifact {} has format version {found}, expected {}", .path.display(), ARTIFACT_FORMAT_VERSION)]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error("artifact {} is inconsistent: {source}", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: LbphError,
    },
}

/// A trained model plus its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub format_version: u32,
    pub trained_at: DateTime<Utc>,
    pub model: LbphModel,
}

impl Artifact {
    pub fn new(model: LbphModel) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            trained_at: Utc::now(),
            model,
        }
    }
}

/// Owner of the single artifact file and its in-memory snapshot.
pub struct ArtifactStore {
    path: PathBuf,
    current: RwLock<Option<Arc<Artifact>>>,
    /// Serializes publishers; readers never take it.
    write_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Open the store at `path`, loading the existing artifact if there is one.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let path = path.into();
        let current = read_artifact(&path)?.map(Arc::new);
        if let Some(artifact) = &current {
            tracing::info!(
                path = %path.display(),
                trained_at = %artifact.trained_at,
                identities = artifact.model.identity_count(),
                "loaded recognition artifact"
            );
        }

        Ok(Self {
            path,
            current: RwLock::new(current),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recently published artifact, if any.
    pub fn snapshot(&self) -> Option<Arc<Artifact>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Durably write `model` and make it the current snapshot.
    pub fn publish(&self, model: LbphModel) -> Result<Arc<Artifact>, ArtifactError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let artifact = Arc::new(Artifact::new(model));
        write_atomic(&self.path, &artifact)?;

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(artifact.clone());
        tracing::info!(
            path = %self.path.display(),
            identities = artifact.model.identity_count(),
            samples = artifact.model.samples().len(),
            "recognition artifact published"
        );
        Ok(artifact)
    }

    /// Re-read the artifact file, replacing the snapshot. Returns whether an
    /// artifact is now loaded.
    pub fn reload(&self) -> Result<bool, ArtifactError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let loaded = read_artifact(&self.path)?.map(Arc::new);
        let present = loaded.is_some();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(present)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_artifact(path: &Path) -> Result<Option<Artifact>, ArtifactError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };

    let artifact: Artifact =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ArtifactError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

    if artifact.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(ArtifactError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: artifact.format_version,
        });
    }
    artifact
        .model
        .validate()
        .map_err(|source| ArtifactError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(Some(artifact))
}

fn write_atomic(path: &Path, artifact: &Artifact) -> Result<(), ArtifactError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err(dir))?;

    // Same directory as the target so the final rename stays on one filesystem.
    let tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer(&mut writer, artifact).map_err(|source| ArtifactError::Corrupt {
            path: tmp.path().to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io_err(tmp.path()))?;
    }
    tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
    tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    Ok(())
}
