// src/engine/stash.rs

//! Device-local, non-authoritative key-value store.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static UNSAFE_KEY_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^A-Za-z0-9_-]").expect("static stash key pattern is valid")
});

#[derive(Debug, Error)]
pub enum StashError {
    #[error("stash I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stash entry is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Key of a stash entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StashKey(String);

impl StashKey {
    /// In-flight answers of the attempt at one exam.
    pub fn session(exam_id: i64) -> Self {
        Self(format!("session:{exam_id}"))
    }

    /// Violation reports not yet acknowledged by the server.
    pub fn violations(exam_id: i64) -> Self {
        Self(format!("violations:{exam_id}"))
    }

    /// Question-authoring draft; `None` for a question that does not exist yet.
    pub fn draft(bank_id: i64, question_id: Option<i64>) -> Self {
        match question_id {
            Some(id) => Self(format!("draft:{bank_id}:{id}")),
            None => Self(format!("draft:{bank_id}:new")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stashed payload with the local time it was saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashEntry {
    pub saved_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait LocalStash: Send + Sync + 'static {
    async fn put(&self, key: &StashKey, entry: &StashEntry) -> Result<(), StashError>;
    async fn get(&self, key: &StashKey) -> Result<Option<StashEntry>, StashError>;
    async fn remove(&self, key: &StashKey) -> Result<(), StashError>;
}

#[async_trait]
impl<T: LocalStash + ?Sized> LocalStash for Arc<T> {
    async fn put(&self, key: &StashKey, entry: &StashEntry) -> Result<(), StashError> {
        (**self).put(key, entry).await
    }

    async fn get(&self, key: &StashKey) -> Result<Option<StashEntry>, StashError> {
        (**self).get(key).await
    }

    async fn remove(&self, key: &StashKey) -> Result<(), StashError> {
        (**self).remove(key).await
    }
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStash {
    dir: PathBuf,
}

impl FileStash {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StashKey) -> PathBuf {
        let file = UNSAFE_KEY_CHARS.replace_all(key.as_str(), "_");
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl LocalStash for FileStash {
    async fn put(&self, key: &StashKey, entry: &StashEntry) -> Result<(), StashError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(entry)?;

        // Write-then-rename so a crash never leaves a torn entry behind.
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &StashKey) -> Result<Option<StashEntry>, StashError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &StashKey) -> Result<(), StashError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local stash, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStash {
    entries: Mutex<HashMap<StashKey, StashEntry>>,
}

impl MemoryStash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A panic in another holder leaves the map intact, so the guard is recovered.
    fn entries(&self) -> MutexGuard<'_, HashMap<StashKey, StashEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocalStash for MemoryStash {
    async fn put(&self, key: &StashKey, entry: &StashEntry) -> Result<(), StashError> {
        self.entries().insert(key.clone(), entry.clone());
        Ok(())
    }

    async fn get(&self, key: &StashKey) -> Result<Option<StashEntry>, StashError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn remove(&self, key: &StashKey) -> Result<(), StashError> {
        self.entries().remove(key);
        Ok(())
    }
}
