//! Object-writer seam between the metadata reporter and the artifact
//! store. The real store is an external collaborator; a local-filesystem
//! implementation ships for single-machine use, and an in-memory one for
//! tests and dry runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use prow_api::storage::StoragePath;
use tracing::debug;

/// Destination for small metadata blobs next to job artifacts.
pub trait ObjectWriter: Send + Sync {
    /// Write `data` at `path`. When `overwrite` is false an existing
    /// object is left untouched. Returns whether a write happened.
    fn write(&self, path: &StoragePath, data: &[u8], overwrite: bool) -> Result<bool>;
}

/// Lays objects out as `<root>/<bucket>/<path>` on local disk.
pub struct FsObjectWriter {
    root: PathBuf,
}

impl FsObjectWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &StoragePath) -> PathBuf {
        let mut resolved = self.root.join(path.bucket());
        for segment in path.path().split('/').filter(|s| !s.is_empty()) {
            resolved = resolved.join(segment);
        }
        resolved
    }
}

impl ObjectWriter for FsObjectWriter {
    fn write(&self, path: &StoragePath, data: &[u8], overwrite: bool) -> Result<bool> {
        let target = self.resolve(path);
        if !overwrite && target.exists() {
            debug!(path = %path, "object exists, skipping write");
            return Ok(false);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&target, data).with_context(|| format!("Failed to write {}", target.display()))?;
        Ok(true)
    }
}

/// Keeps objects in a map, keyed by the rendered path.
#[derive(Default)]
pub struct InMemoryObjectWriter {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("object map lock poisoned")
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("object map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectWriter for InMemoryObjectWriter {
    fn write(&self, path: &StoragePath, data: &[u8], overwrite: bool) -> Result<bool> {
        let mut objects = self.objects.lock().expect("object map lock poisoned");
        let key = path.to_string();
        if !overwrite && objects.contains_key(&key) {
            return Ok(false);
        }
        objects.insert(key, data.to_vec());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_writer_first_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsObjectWriter::new(dir.path());
        let path = StoragePath::parse("gs://bucket/logs/unit/1/started.json").unwrap();

        assert!(writer.write(&path, b"first", false).unwrap());
        assert!(!writer.write(&path, b"second", false).unwrap());
        let on_disk = fs::read(dir.path().join("bucket/logs/unit/1/started.json")).unwrap();
        assert_eq!(on_disk, b"first");
    }

    #[test]
    fn test_fs_writer_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsObjectWriter::new(dir.path());
        let path = StoragePath::parse("gs://bucket/logs/unit/1/prowjob.json").unwrap();

        assert!(writer.write(&path, b"v1", true).unwrap());
        assert!(writer.write(&path, b"v2", true).unwrap());
        let on_disk = fs::read(dir.path().join("bucket/logs/unit/1/prowjob.json")).unwrap();
        assert_eq!(on_disk, b"v2");
    }

    #[test]
    fn test_in_memory_writer() {
        let writer = InMemoryObjectWriter::new();
        let path = StoragePath::parse("gs://bucket/started.json").unwrap();
        assert!(writer.write(&path, b"a", false).unwrap());
        assert!(!writer.write(&path, b"b", false).unwrap());
        assert_eq!(writer.get("gs://bucket/started.json").unwrap(), b"a");
        assert!(writer.write(&path, b"c", true).unwrap());
        assert_eq!(writer.get("gs://bucket/started.json").unwrap(), b"c");
    }
}
