use crate::error::StorageResult;
use crate::json_file::JsonFile;
use pethub_core::LampConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The lamp-config file: a JSON array of [`LampConfig`].
///
/// The lamp manager owns the live records and hands the full list over on
/// every mutation.
#[derive(Debug, Clone)]
pub struct LampConfigStore {
    file: JsonFile<Vec<LampConfig>>,
}

impl LampConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Load all records. Later duplicates of an id are dropped.
    pub async fn load(&self) -> StorageResult<Vec<LampConfig>> {
        let mut lamps = self.file.load().await?;
        let mut seen = std::collections::HashSet::new();
        lamps.retain(|lamp: &LampConfig| seen.insert(lamp.id.clone()));
        debug!("Loaded {} lamp configs", lamps.len());
        Ok(lamps)
    }

    /// Replace the file with `lamps`, sorted by id.
    pub async fn save(&self, lamps: &[LampConfig]) -> StorageResult<()> {
        let mut lamps = lamps.to_vec();
        lamps.sort_by(|a, b| a.id.cmp(&b.id));
        self.file.save(&lamps).await
    }
}
