//! Best-effort on-disk snapshot of the instance cache.
//!
//! Layout: `<cache_dir>/naming/<namespace>/<cache key>.json`, one file per
//! service key, content is the serialized snapshot. Names are escaped so any
//! key maps to a single file name. The directory can be deleted at any time.
//! Failures are logged and reported as "nothing cached" or "not persisted".

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{NamingError, Result};
use crate::model::{ServiceKey, ServiceSnapshot};

const BACKUP_SEGMENT: &str = "naming";
const FILE_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// File-backed snapshot store.
#[derive(Debug, Clone)]
pub struct LocalBackup {
    root: PathBuf,
}

impl LocalBackup {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            root: cache_dir.as_ref().join(BACKUP_SEGMENT),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that holds the snapshot for `key`.
    pub fn path_for(&self, key: &ServiceKey) -> PathBuf {
        self.root
            .join(encode_segment(key.namespace()))
            .join(format!("{}{}", encode_segment(&key.cache_key()), FILE_SUFFIX))
    }

    /// Read the stored snapshot for `key`, marked provisional.
    pub fn read(&self, key: &ServiceKey) -> Option<ServiceSnapshot> {
        let path = self.path_for(key);
        match read_snapshot(&path) {
            Ok(Some(snapshot)) if &snapshot.key == key => Some(snapshot.into_provisional()),
            Ok(Some(snapshot)) => {
                warn!(
                    path = %path.display(),
                    expected = %key,
                    found = %snapshot.key,
                    "Backup file holds a different key, ignoring"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read backup");
                None
            }
        }
    }

    /// Read every stored snapshot under `namespace`.
    pub fn read_namespace(&self, namespace: &str) -> Vec<ServiceSnapshot> {
        let dir = self.root.join(encode_segment(namespace));
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to list backup directory");
                return Vec::new();
            }
        };

        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(FILE_SUFFIX))
                .unwrap_or(false);
            if !is_snapshot {
                continue;
            }
            match read_snapshot(&path) {
                Ok(Some(snapshot)) => snapshots.push(snapshot.into_provisional()),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable backup"),
            }
        }
        debug!(namespace = %namespace, count = snapshots.len(), "Loaded backup snapshots");
        snapshots
    }

    /// Persist `snapshot`. Returns false if the write failed.
    pub fn write(&self, snapshot: &ServiceSnapshot) -> bool {
        match self.try_write(snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %snapshot.key, error = %e, "Failed to persist backup");
                false
            }
        }
    }

    /// Delete the stored snapshot for `key`, if any.
    pub fn remove(&self, key: &ServiceKey) {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key = %key, error = %e, "Failed to remove backup");
            }
        }
    }

    fn try_write(&self, snapshot: &ServiceSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(storage_error)?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| NamingError::LocalStorage(e.to_string()))?;

        // Write aside then rename so readers never see a torn file.
        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);
        {
            let mut file = fs::File::create(&temp).map_err(storage_error)?;
            file.write_all(&bytes).map_err(storage_error)?;
            file.sync_all().map_err(storage_error)?;
        }
        fs::rename(&temp, &path).map_err(storage_error)?;
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<ServiceSnapshot>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(storage_error(e)),
    };
    let snapshot: ServiceSnapshot =
        serde_json::from_slice(&bytes).map_err(|e| NamingError::LocalStorage(e.to_string()))?;
    Ok(Some(snapshot))
}

fn storage_error(e: std::io::Error) -> NamingError {
    NamingError::LocalStorage(e.to_string())
}

/// Escape a string into a single path segment.
///
/// Keeps `[A-Za-z0-9._@-]`, percent-encodes every other byte.
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'@' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    // "." and ".." are not usable as names.
    if out.chars().all(|c| c == '.') {
        out = out.replace('.', "%2E");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceRecord;
    use tempfile::TempDir;

    fn snapshot(key: &ServiceKey) -> ServiceSnapshot {
        ServiceSnapshot::new(key.clone(), vec![InstanceRecord::new("1.1.1.1", 8888)], 5)
    }

    #[test]
    fn test_write_then_read_is_provisional() {
        let dir = TempDir::new().unwrap();
        let backup = LocalBackup::new(dir.path());
        let key = ServiceKey::simple("s1");

        assert!(backup.write(&snapshot(&key)));
        let restored = backup.read(&key).unwrap();
        assert!(restored.provisional);
        assert_eq!(restored, snapshot(&key));
        assert_eq!(restored.revision, 5);
    }

    #[test]
    fn test_path_layout() {
        let backup = LocalBackup::new("/cache");
        let key = ServiceKey::new("dev", "g1", "orders").with_clusters(["b", "a"]);
        assert_eq!(
            backup.path_for(&key),
            PathBuf::from("/cache/naming/dev/g1@@orders@@a%2Cb.json")
        );
    }

    #[test]
    fn test_encode_segment_escapes_separators() {
        assert_eq!(encode_segment("a/b"), "a%2Fb");
        assert_eq!(encode_segment(".."), "%2E%2E");
        assert_eq!(encode_segment("ok-name_1.x"), "ok-name_1.x");
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let backup = LocalBackup::new(dir.path());
        assert!(backup.read(&ServiceKey::simple("nope")).is_none());
        assert!(backup.read_namespace("public").is_empty());
    }

    #[test]
    fn test_corrupt_file_degrades_to_none() {
        let dir = TempDir::new().unwrap();
        let backup = LocalBackup::new(dir.path());
        let key = ServiceKey::simple("s1");
        let path = backup.path_for(&key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();

        assert!(backup.read(&key).is_none());
        assert!(backup.read_namespace("public").is_empty());
    }

    #[test]
    fn test_unwritable_root_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        // A regular file where the directory should be.
        let backup = LocalBackup::new(&blocker);
        assert!(!backup.write(&snapshot(&ServiceKey::simple("s1"))));
    }

    #[test]
    fn test_read_namespace_and_remove() {
        let dir = TempDir::new().unwrap();
        let backup = LocalBackup::new(dir.path());
        let a = ServiceKey::simple("a");
        let b = ServiceKey::simple("b");
        backup.write(&snapshot(&a));
        backup.write(&snapshot(&b));

        let mut keys: Vec<_> = backup
            .read_namespace("public")
            .into_iter()
            .map(|s| s.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec![a.clone(), b]);

        backup.remove(&a);
        assert!(backup.read(&a).is_none());
    }
}
