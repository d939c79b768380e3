// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Durable key-to-bytes store with atomic writes.
//!
//! Every persisted artifact (task records, traces, state snapshots,
//! checkpoints) goes through this store. Writes are atomic: the payload is
//! written to a uniquely named temp file, fsynced, then renamed over the
//! target. Concurrent writers to *different* keys proceed independently;
//! writers to the *same* key are serialized by a per-key lock.
//!
//! Layout under the store root:
//!
//! ```text
//! tasks/<task-id>/task.json
//! tasks/<task-id>/trace.json
//! tasks/<task-id>/checkpoint_<NNN>.json
//! tasks/<task-id>/state.json
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Durable JSON blob store rooted at a directory.
pub struct DurableStore {
    root: PathBuf,
    // Per-key write locks. The outer mutex only guards the map itself.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DurableStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::Store {
            path: root.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative key for a file inside a task's directory.
    #[must_use]
    pub fn task_key(task_id: &str, file: &str) -> String {
        format!("tasks/{task_id}/{file}")
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn io_err(path: &Path, e: std::io::Error) -> Error {
        Error::Store {
            path: path.display().to_string(),
            source: e,
        }
    }

    /// Write `bytes` to `key` atomically (temp file + fsync + rename).
    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(parent, e))?;
        }

        let temp_name = format!(
            ".{}.{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
            crate::ids::new_id()
        );
        let temp_path = path.with_file_name(&temp_name);

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| Self::io_err(&temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Self::io_err(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::io_err(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| Self::io_err(&path, e))?;
        Ok(())
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write(key, &bytes).await
    }

    /// Read the raw bytes stored at `key`.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::io_err(&path, e))
    }

    /// Read and deserialize the JSON value stored at `key`.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let bytes = self.read(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whether a key currently exists.
    pub async fn exists(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .unwrap_or(false)
    }

    /// List file names (not paths) directly under a directory key.
    ///
    /// Returns an empty list when the directory does not exist.
    pub async fn list_dir(&self, key: &str) -> Result<Vec<String>> {
        let path = self.path_for(key);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&path, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err(&path, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a directory key and everything under it.
    pub async fn remove_dir(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&path, e)),
        }
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn store() -> (tempfile::TempDir, DurableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, store) = store();
        let sample = Sample {
            name: "alpha".to_string(),
            count: 3,
        };
        store.write_json("tasks/t1/task.json", &sample).await.unwrap();
        let restored: Sample = store.read_json("tasks/t1/task.json").await.unwrap();
        assert_eq!(sample, restored);
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let (_dir, store) = store();
        store.write("tasks/deep/nested/state.json", b"{}").await.unwrap();
        assert!(store.exists("tasks/deep/nested/state.json").await);
    }

    #[tokio::test]
    async fn write_leaves_no_temp_files() {
        let (_dir, store) = store();
        store.write("tasks/t1/task.json", b"{}").await.unwrap();
        let names = store.list_dir("tasks/t1").await.unwrap();
        assert_eq!(names, vec!["task.json".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_key_serialize() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let value = Sample {
                    name: "writer".to_string(),
                    count: i,
                };
                store.write_json("tasks/t1/state.json", &value).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // The winner is unknown, but the file must be a complete JSON value.
        let restored: Sample = store.read_json("tasks/t1/state.json").await.unwrap();
        assert_eq!(restored.name, "writer");
    }

    #[tokio::test]
    async fn list_dir_missing_is_empty() {
        let (_dir, store) = store();
        assert!(store.list_dir("tasks/absent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_dir_is_idempotent() {
        let (_dir, store) = store();
        store.write("tasks/t2/task.json", b"{}").await.unwrap();
        store.remove_dir("tasks/t2").await.unwrap();
        store.remove_dir("tasks/t2").await.unwrap();
        assert!(!store.exists("tasks/t2/task.json").await);
    }

    #[test]
    fn task_key_layout() {
        assert_eq!(
            DurableStore::task_key("abc", "trace.json"),
            "tasks/abc/trace.json"
        );
    }
}
