//! Whole-file JSON persistence.
//!
//! Every save rewrites the file: the new content goes to a sibling
//! `*.tmp` file which is then renamed over the target, so readers see the
//! old or the new content and never a torn write.

use crate::error::{StorageError, StorageResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::trace;

/// A JSON document of type `T` stored at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing or blank file yields `T::default()`.
    pub async fn load(&self) -> StorageResult<T> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %self.path.display(), "File missing, using defaults");
                return Ok(T::default());
            }
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }

        serde_json::from_slice(&bytes).map_err(|e| StorageError::json(&self.path, e))
    }

    /// Replace the document, creating parent directories as needed.
    pub async fn save(&self, value: &T) -> StorageResult<()> {
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| StorageError::json(&self.path, e))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;

        trace!(path = %self.path.display(), bytes = bytes.len(), "Saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let file: JsonFile<Vec<String>> = JsonFile::new(dir.path().join("absent.json"));
        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let file: JsonFile<BTreeMap<String, String>> =
            JsonFile::new(dir.path().join("nested/dir/map.json"));

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), "b".to_string());
        file.save(&map).await.unwrap();

        assert_eq!(file.load().await.unwrap(), map);
        assert!(!dir.path().join("nested/dir/map.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let file: JsonFile<Vec<String>> = JsonFile::new(&path);
        assert!(matches!(file.load().await, Err(StorageError::Json { .. })));
    }

    #[tokio::test]
    async fn test_blank_file_is_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank.json");
        tokio::fs::write(&path, b"  \n").await.unwrap();

        let file: JsonFile<Vec<String>> = JsonFile::new(&path);
        assert!(file.load().await.unwrap().is_empty());
    }
}
