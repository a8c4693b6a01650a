use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Failure modes of the document store.
///
/// A missing document is deliberately *not* represented here: callers get
/// `Ok(None)` (or a default) and the store never refuses to start because a
/// file is absent. A document that exists but cannot be parsed is data
/// corruption and is always surfaced.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("corrupt document {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backup '{0}' not found")]
    BackupMissing(String),
}

/// Directory-backed store of JSON documents with per-document locking and
/// snapshot backup/restore. Knows nothing about chat semantics.
pub struct DocumentStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    // Held for read by every document operation, for write by backup/restore.
    maintenance: RwLock<()>,
}

pub const BACKUPS_DIR: &str = "backups";

impl DocumentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [
            root.clone(),
            root.join("chats"),
            root.join("diary"),
            root.join("memory"),
            root.join(BACKUPS_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
            maintenance: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_lock(&self, rel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(PathBuf::from(rel))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_doc<T: DeserializeOwned>(&self, rel: &str) -> Result<Option<T>, StorageError> {
        let path = self.root.join(rel);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        let value = serde_json::from_str(&raw).map_err(|source| StorageError::Corrupt {
            path: path.clone(),
            source,
        })?;
        Ok(Some(value))
    }

    fn write_doc<T: Serialize>(&self, rel: &str, value: &T) -> Result<(), StorageError> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let raw = serde_json::to_string_pretty(value).map_err(|source| StorageError::Corrupt {
            path: path.clone(),
            source,
        })?;
        // Write-then-rename so a crash mid-write never leaves a torn document.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StorageError::Io { path, source })?;
        Ok(())
    }

    /// Load a document, `None` when the file does not exist.
    pub fn load<T: DeserializeOwned>(&self, rel: &str) -> Result<Option<T>, StorageError> {
        let _online = self.maintenance.read().expect("maintenance lock poisoned");
        let lock = self.doc_lock(rel);
        let _guard = lock.lock().expect("document lock poisoned");
        self.read_doc(rel)
    }

    /// Load a document, substituting the type's default when absent.
    pub fn load_or_default<T: DeserializeOwned + Default>(
        &self,
        rel: &str,
    ) -> Result<T, StorageError> {
        Ok(self.load(rel)?.unwrap_or_default())
    }

    pub fn save<T: Serialize>(&self, rel: &str, value: &T) -> Result<(), StorageError> {
        let _online = self.maintenance.read().expect("maintenance lock poisoned");
        let lock = self.doc_lock(rel);
        let _guard = lock.lock().expect("document lock poisoned");
        self.write_doc(rel, value)
    }

    /// Read-modify-write a single document, holding its lock for the whole
    /// cycle so an interleaved writer cannot lose this update.
    pub fn update<T, F>(&self, rel: &str, f: F) -> Result<T, StorageError>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T),
    {
        let _online = self.maintenance.read().expect("maintenance lock poisoned");
        let lock = self.doc_lock(rel);
        let _guard = lock.lock().expect("document lock poisoned");
        let mut value: T = self.read_doc(rel)?.unwrap_or_default();
        f(&mut value);
        self.write_doc(rel, &value)?;
        Ok(value)
    }

    /// Read-modify-write two documents under both locks. Locks are acquired
    /// in sorted path order regardless of argument order, so concurrent
    /// callers touching the same pair can never deadlock.
    pub fn update_pair<A, B, F>(&self, rel_a: &str, rel_b: &str, f: F) -> Result<(), StorageError>
    where
        A: DeserializeOwned + Serialize + Default,
        B: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut A, &mut B),
    {
        let _online = self.maintenance.read().expect("maintenance lock poisoned");
        let lock_a = self.doc_lock(rel_a);
        let lock_b = self.doc_lock(rel_b);
        let (first, second) = if rel_a <= rel_b {
            (&lock_a, &lock_b)
        } else {
            (&lock_b, &lock_a)
        };
        let _g1 = first.lock().expect("document lock poisoned");
        let _g2 = second.lock().expect("document lock poisoned");

        let mut a: A = self.read_doc(rel_a)?.unwrap_or_default();
        let mut b: B = self.read_doc(rel_b)?.unwrap_or_default();
        f(&mut a, &mut b);
        self.write_doc(rel_a, &a)?;
        self.write_doc(rel_b, &b)
    }

    /// List document file names (without extension) inside a sub-directory,
    /// sorted ascending. Used for day shards.
    pub fn list_documents(&self, sub: &str) -> Result<Vec<String>, StorageError> {
        let _online = self.maintenance.read().expect("maintenance lock poisoned");
        let dir = self.root.join(sub);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { path: dir, source }),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Snapshot every live document into `backups/<name>`. Stop-the-world:
    /// no document operation runs while the copy is in progress.
    pub fn backup(&self, name: Option<&str>) -> Result<PathBuf, StorageError> {
        let _world = self.maintenance.write().expect("maintenance lock poisoned");
        let name = match name {
            Some(n) => n.to_string(),
            None => Local::now().format("%Y%m%d_%H%M%S").to_string(),
        };
        let dest = self.root.join(BACKUPS_DIR).join(&name);
        copy_tree(&self.root, &dest, true)?;
        tracing::info!("Backup created: {}", dest.display());
        Ok(dest)
    }

    /// Overwrite all live documents with a named backup's contents.
    pub fn restore(&self, name: &str) -> Result<(), StorageError> {
        let _world = self.maintenance.write().expect("maintenance lock poisoned");
        let src = self.root.join(BACKUPS_DIR).join(name);
        if !src.is_dir() {
            return Err(StorageError::BackupMissing(name.to_string()));
        }
        // Clear live documents first so files absent from the snapshot do not
        // survive the restore.
        remove_live_documents(&self.root)?;
        copy_tree(&src, &self.root, false)?;
        tracing::info!("Restored backup '{}'", name);
        Ok(())
    }

    pub fn list_backups(&self) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(BACKUPS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { path: dir, source }),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
            if entry.path().is_dir() {
                if let Some(n) = entry.file_name().to_str() {
                    names.push(n.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn copy_tree(src: &Path, dest: &Path, skip_backups: bool) -> Result<(), StorageError> {
    fs::create_dir_all(dest).map_err(|source| StorageError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    let entries = fs::read_dir(src).map_err(|source| StorageError::Io {
        path: src.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let name = entry.file_name();
        if skip_backups && name.to_str() == Some(BACKUPS_DIR) {
            continue;
        }
        let target = dest.join(&name);
        if path.is_dir() {
            copy_tree(&path, &target, false)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            fs::copy(&path, &target).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

fn remove_live_documents(root: &Path) -> Result<(), StorageError> {
    let entries = fs::read_dir(root).map_err(|source| StorageError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if entry.file_name().to_str() == Some(BACKUPS_DIR) {
            continue;
        }
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|source| StorageError::Io { path, source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        items: Vec<String>,
    }

    #[test]
    fn missing_document_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let loaded: Option<Doc> = store.load("nothing.json").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let doc = Doc {
            items: vec!["a".into(), "b".into()],
        };
        store.save("doc.json", &doc).unwrap();
        let loaded: Doc = store.load("doc.json").unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn corrupt_document_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("doc.json"), "{not json").unwrap();
        let result: Result<Option<Doc>, _> = store.load("doc.json");
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn update_applies_mutation_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store
            .update::<Doc, _>("doc.json", |d| d.items.push("x".into()))
            .unwrap();
        store
            .update::<Doc, _>("doc.json", |d| d.items.push("y".into()))
            .unwrap();
        let loaded: Doc = store.load("doc.json").unwrap().unwrap();
        assert_eq!(loaded.items, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn update_pair_writes_both_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store
            .update_pair::<Doc, Doc, _>("a.json", "chats/b.json", |a, b| {
                a.items.push("one".into());
                b.items.push("two".into());
            })
            .unwrap();
        let a: Doc = store.load("a.json").unwrap().unwrap();
        let b: Doc = store.load("chats/b.json").unwrap().unwrap();
        assert_eq!(a.items, vec!["one".to_string()]);
        assert_eq!(b.items, vec!["two".to_string()]);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let before = Doc {
            items: vec!["keep".into()],
        };
        store.save("doc.json", &before).unwrap();
        store.backup(Some("snap")).unwrap();

        store
            .save(
                "doc.json",
                &Doc {
                    items: vec!["mutated".into()],
                },
            )
            .unwrap();
        store.save("chats/2026-01-01.json", &Doc::default()).unwrap();

        store.restore("snap").unwrap();
        let after: Doc = store.load("doc.json").unwrap().unwrap();
        assert_eq!(after, before);
        let shard: Option<Doc> = store.load("chats/2026-01-01.json").unwrap();
        assert!(shard.is_none(), "documents absent from the snapshot are removed");
    }

    #[test]
    fn restore_of_unknown_backup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.restore("ghost"),
            Err(StorageError::BackupMissing(_))
        ));
    }

    #[test]
    fn backups_are_excluded_from_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store.save("doc.json", &Doc::default()).unwrap();
        store.backup(Some("first")).unwrap();
        store.backup(Some("second")).unwrap();
        assert!(!dir.path().join("backups/second/backups").exists());
        assert_eq!(
            store.list_backups().unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
    }
}
