//! Persisted meal-plan cache.
//!
//! Maps device ids to the last encoded meal plan applied to or reported by
//! each feeder. Every update rewrites the whole file. A failed write is
//! logged and the in-memory value is kept, so the cache is last-writer-wins
//! and converges on the next successful write.

use crate::error::StorageResult;
use crate::json_file::JsonFile;
use pethub_core::DeviceId;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

type CacheFile = JsonFile<BTreeMap<String, String>>;

#[derive(Debug)]
pub struct MealPlanCache {
    file: CacheFile,
    entries: RwLock<BTreeMap<String, String>>,
    // orders snapshots so the file never regresses to an older map
    write_lock: tokio::sync::Mutex<()>,
}

impl MealPlanCache {
    /// Open the cache, loading whatever the file holds.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let file = CacheFile::new(path);
        let entries = file.load().await?;
        debug!("Meal plan cache holds {} entries", entries.len());

        Ok(Self {
            file,
            entries: RwLock::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// An empty cache backed by `path`, ignoring current file content.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            file: CacheFile::new(path),
            entries: RwLock::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<String> {
        self.read().get(id.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Store `encoded` for `id` and persist the cache.
    ///
    /// Returns whether the in-memory value changed, whether or not the disk
    /// write then succeeds. Persisting is skipped when nothing changed. Disk
    /// failures are logged only; [`flush`](Self::flush) reports them.
    pub async fn set(&self, id: &DeviceId, encoded: impl Into<String>) -> bool {
        let encoded = encoded.into();
        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let mut entries = self.write();
            if entries.get(id.as_str()) == Some(&encoded) {
                return false;
            }
            entries.insert(id.to_string(), encoded);
            entries.clone()
        };

        if let Err(e) = self.file.save(&snapshot).await {
            warn!(device = %id, "Failed to persist meal plan cache: {}", e);
        }
        true
    }

    /// Write the current map to disk.
    pub async fn flush(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.read().clone();
        self.file.save(&snapshot).await
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
