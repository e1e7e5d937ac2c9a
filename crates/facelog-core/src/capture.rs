//! Per-identity capture storage with a quota.
//!
//! Layout: `<root>/<identity>/<identity>.<index>.png`, indices starting at 1.

use crate::types::Identity;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Maximum number of captures kept per identity.
pub const MAX_CAPTURES_PER_IDENTITY: usize = 20;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("identity {identity} already has the maximum of {limit} captures")]
    QuotaExceeded { identity: Identity, limit: usize },
    #[error("capture storage: {0}")]
    Storage(#[from] std::io::Error),
    #[error("capture log: {0}")]
    Log(String),
}

/// Receives one record per stored capture.
pub trait CaptureLog {
    fn append(&self, identity: Identity, path: &Path) -> Result<(), String>;
}

/// Capture log that only emits a tracing event.
pub struct TracingCaptureLog;

impl CaptureLog for TracingCaptureLog {
    fn append(&self, identity: Identity, path: &Path) -> Result<(), String> {
        tracing::info!(%identity, path = %path.display(), "capture recorded");
        Ok(())
    }
}

/// A stored capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRef {
    pub identity: Identity,
    pub index: u32,
    pub path: PathBuf,
}

/// Directory-backed capture store.
pub struct CaptureStore {
    root: PathBuf,
    quota: usize,
    /// One mutex per identity so count-then-write cannot race.
    locks: Mutex<HashMap<Identity, Arc<Mutex<()>>>>,
}

impl CaptureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_quota(root, MAX_CAPTURES_PER_IDENTITY)
    }

    pub fn with_quota(root: impl Into<PathBuf>, quota: usize) -> Self {
        Self {
            root: root.into(),
            quota,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    fn identity_dir(&self, identity: Identity) -> PathBuf {
        self.root.join(identity.to_string())
    }

    fn identity_lock(&self, identity: Identity) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity)
            .or_default()
            .clone()
    }

    /// Decode `image_bytes`, store them as the identity's next capture and
    /// append a record to `log`.
    ///
    /// Nothing is left on disk when the quota is exhausted, the write fails
    /// or the log append fails.
    pub fn enroll(
        &self,
        identity: Identity,
        image_bytes: &[u8],
        log: &dyn CaptureLog,
    ) -> Result<CaptureRef, CaptureError> {
        let image = image::load_from_memory(image_bytes)?;

        let lock = self.identity_lock(identity);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let existing = self.captures(identity)?;
        if existing.len() >= self.quota {
            return Err(CaptureError::QuotaExceeded {
                identity,
                limit: self.quota,
            });
        }

        let index = match existing.last() {
            None => 1,
            Some(last) => last.index.checked_add(1).ok_or_else(|| {
                CaptureError::Storage(std::io::Error::other(format!(
                    "capture index {} for identity {identity} cannot be incremented",
                    last.index
                )))
            })?,
        };
        let dir = self.identity_dir(identity);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{identity}.{index}.png"));
        write_atomic(&dir, &path, |file| encode_png(&image, file))?;

        if let Err(e) = log.append(identity, &path) {
            if let Err(rm) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %rm, "failed to roll back capture");
            }
            return Err(CaptureError::Log(e));
        }

        tracing::info!(%identity, index, path = %path.display(), "capture stored");
        Ok(CaptureRef {
            identity,
            index,
            path,
        })
    }

    /// Existing captures for `identity`, ordered by index.
    pub fn captures(&self, identity: Identity) -> Result<Vec<CaptureRef>, CaptureError> {
        let dir = self.identity_dir(identity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut captures = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(|n| parse_capture_name(identity, n)) {
                captures.push(CaptureRef {
                    identity,
                    index,
                    path: entry.path(),
                });
            }
        }
        captures.sort_by_key(|c| c.index);
        Ok(captures)
    }

    /// Identities with a capture directory, ascending.
    pub fn identities(&self) -> Result<Vec<Identity>, CaptureError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Parse `<identity>.<index>.png`, returning the index.
fn parse_capture_name(identity: Identity, name: &str) -> Option<u32> {
    let rest = name.strip_prefix(&format!("{identity}."))?;
    let index = rest.strip_suffix(".png")?;
    index.parse().ok().filter(|&i| i > 0)
}

/// Write into a temp file in `dir`, then rename it to `path`. On error the
/// temp file is removed and `path` is never created.
fn write_atomic(
    dir: &Path,
    path: &Path,
    write: impl FnOnce(&File) -> Result<(), CaptureError>,
) -> Result<(), CaptureError> {
    let tmp = NamedTempFile::new_in(dir)?;
    write(tmp.as_file())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CaptureError::Storage(e.error))?;
    Ok(())
}

fn encode_png(image: &DynamicImage, file: &File) -> Result<(), CaptureError> {
    let mut writer = BufWriter::new(file);
    match image.write_to(&mut writer, ImageFormat::Png) {
        Ok(()) => {}
        Err(image::ImageError::IoError(e)) => return Err(CaptureError::Storage(e)),
        Err(e) => return Err(CaptureError::Storage(std::io::Error::other(e))),
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::collections::BTreeSet;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_bytes(shade: u8) -> Vec<u8> {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([shade])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    /// Records appends; optionally refuses them.
    #[derive(Default)]
    struct MemoryLog {
        fail: bool,
        records: Mutex<Vec<(Identity, PathBuf)>>,
    }

    impl CaptureLog for MemoryLog {
        fn append(&self, identity: Identity, path: &Path) -> Result<(), String> {
            if self.fail {
                return Err("database unavailable".into());
            }
            self.records.lock().unwrap().push((identity, path.to_path_buf()));
            Ok(())
        }
    }

    fn files_in(dir: &Path) -> BTreeSet<String> {
        match fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => BTreeSet::new(),
        }
    }

    #[test]
    fn test_enroll_assigns_sequential_indices() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let log = MemoryLog::default();
        let id = Identity::new(7);

        for expected in 1..=3 {
            let c = store.enroll(id, &png_bytes(100), &log).unwrap();
            assert_eq!(c.index, expected);
            assert_eq!(c.path, dir.path().join("7").join(format!("7.{expected}.png")));
        }
        assert_eq!(log.records.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_enroll_rejects_invalid_image() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let log = MemoryLog::default();
        let result = store.enroll(Identity::new(1), b"not an image", &log);
        assert!(matches!(result, Err(CaptureError::InvalidImage(_))));
        assert!(files_in(&dir.path().join("1")).is_empty());
        assert!(log.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_quota_exceeded_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let log = MemoryLog::default();
        let id = Identity::new(3);

        for _ in 0..MAX_CAPTURES_PER_IDENTITY {
            store.enroll(id, &png_bytes(50), &log).unwrap();
        }
        let before = files_in(&dir.path().join("3"));
        assert_eq!(before.len(), MAX_CAPTURES_PER_IDENTITY);

        let result = store.enroll(id, &png_bytes(50), &log);
        assert!(matches!(
            result,
            Err(CaptureError::QuotaExceeded { limit: MAX_CAPTURES_PER_IDENTITY, .. })
        ));
        assert_eq!(files_in(&dir.path().join("3")), before);
        assert_eq!(log.records.lock().unwrap().len(), MAX_CAPTURES_PER_IDENTITY);
    }

    #[test]
    fn test_quota_is_per_identity() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::with_quota(dir.path(), 2);
        let log = MemoryLog::default();
        store.enroll(Identity::new(1), &png_bytes(1), &log).unwrap();
        store.enroll(Identity::new(1), &png_bytes(1), &log).unwrap();
        assert!(store.enroll(Identity::new(1), &png_bytes(1), &log).is_err());
        assert!(store.enroll(Identity::new(2), &png_bytes(1), &log).is_ok());
    }

    #[test]
    fn test_log_failure_rolls_back_file() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let log = MemoryLog { fail: true, ..Default::default() };
        let result = store.enroll(Identity::new(9), &png_bytes(10), &log);
        assert!(matches!(result, Err(CaptureError::Log(_))));
        assert!(files_in(&dir.path().join("9")).is_empty());

        // The index is reused once logging recovers.
        let ok = store.enroll(Identity::new(9), &png_bytes(10), &MemoryLog::default()).unwrap();
        assert_eq!(ok.index, 1);
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let id_dir = dir.path().join("6");
        fs::create_dir_all(&id_dir).unwrap();
        fs::write(id_dir.join("6.1.png"), png_bytes(1)).unwrap();
        let before = files_in(&id_dir);

        let target = id_dir.join("6.2.png");
        let result = write_atomic(&id_dir, &target, |mut file| {
            file.write_all(b"\x89PNG truncated")?;
            Err(CaptureError::Storage(std::io::Error::other("disk full")))
        });
        assert!(matches!(result, Err(CaptureError::Storage(_))));
        assert_eq!(files_in(&id_dir), before);

        let store = CaptureStore::new(dir.path());
        let next = store.enroll(Identity::new(6), &png_bytes(1), &MemoryLog::default()).unwrap();
        assert_eq!(next.index, 2);
        assert!(image::open(&next.path).is_ok());
    }

    #[test]
    fn test_exhausted_index_is_rejected() {
        let dir = TempDir::new().unwrap();
        let id_dir = dir.path().join("4");
        fs::create_dir_all(&id_dir).unwrap();
        fs::write(id_dir.join(format!("4.{}.png", u32::MAX)), png_bytes(1)).unwrap();
        let before = files_in(&id_dir);

        let log = MemoryLog::default();
        let result = CaptureStore::new(dir.path()).enroll(Identity::new(4), &png_bytes(1), &log);
        assert!(matches!(result, Err(CaptureError::Storage(_))));
        assert_eq!(files_in(&id_dir), before);
        assert!(log.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_next_index_follows_max_existing() {
        let dir = TempDir::new().unwrap();
        let id_dir = dir.path().join("4");
        fs::create_dir_all(&id_dir).unwrap();
        fs::write(id_dir.join("4.1.png"), png_bytes(1)).unwrap();
        fs::write(id_dir.join("4.5.png"), png_bytes(1)).unwrap();
        fs::write(id_dir.join("notes.txt"), b"ignored").unwrap();

        let store = CaptureStore::new(dir.path());
        let c = store.enroll(Identity::new(4), &png_bytes(1), &MemoryLog::default()).unwrap();
        assert_eq!(c.index, 6);
        assert_eq!(store.captures(Identity::new(4)).unwrap().len(), 3);
    }

    #[test]
    fn test_concurrent_enrollments_have_no_gaps() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CaptureStore::new(dir.path()));
        let id = Identity::new(11);
        let bytes = Arc::new(png_bytes(77));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let bytes = bytes.clone();
                std::thread::spawn(move || {
                    let log = MemoryLog::default();
                    (0..4)
                        .filter_map(|_| store.enroll(id, &bytes, &log).ok())
                        .count()
                })
            })
            .collect();
        let stored: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // 32 attempts, quota 20.
        assert_eq!(stored, MAX_CAPTURES_PER_IDENTITY);
        let indices: Vec<u32> = store.captures(id).unwrap().iter().map(|c| c.index).collect();
        assert_eq!(indices, (1..=MAX_CAPTURES_PER_IDENTITY as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_identities_lists_numeric_dirs() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let log = MemoryLog::default();
        store.enroll(Identity::new(20), &png_bytes(1), &log).unwrap();
        store.enroll(Identity::new(3), &png_bytes(1), &log).unwrap();
        fs::create_dir_all(dir.path().join("scratch")).unwrap();

        assert_eq!(store.identities().unwrap(), vec![Identity::new(3), Identity::new(20)]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path().join("nope"));
        assert!(store.identities().unwrap().is_empty());
        assert!(store.captures(Identity::new(1)).unwrap().is_empty());
    }

    #[test]
    fn test_parse_capture_name() {
        let id = Identity::new(12);
        assert_eq!(parse_capture_name(id, "12.3.png"), Some(3));
        assert_eq!(parse_capture_name(id, "12.0.png"), None);
        assert_eq!(parse_capture_name(id, "1.3.png"), None);
        assert_eq!(parse_capture_name(id, "12.3.jpg"), None);
        assert_eq!(parse_capture_name(id, "12.x.png"), None);
    }
}
