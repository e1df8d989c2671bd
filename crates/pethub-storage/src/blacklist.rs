//! Persisted set of BLE addresses that are never managed automatically.

use crate::error::StorageResult;
use crate::json_file::JsonFile;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

/// Canonical address form: trimmed, upper case.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

#[derive(Debug)]
pub struct Blacklist {
    file: JsonFile<BTreeSet<String>>,
    addresses: RwLock<BTreeSet<String>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Blacklist {
    /// Open the blacklist file. Entries are normalised on load.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let file = JsonFile::<BTreeSet<String>>::new(path);
        let addresses: BTreeSet<String> = file
            .load()
            .await?
            .iter()
            .map(|a| normalize_address(a))
            .collect();

        Ok(Self {
            file,
            addresses: RwLock::new(addresses),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn contains(&self, address: &str) -> bool {
        self.read().contains(&normalize_address(address))
    }

    /// Sorted addresses.
    pub fn list(&self) -> Vec<String> {
        self.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Add an address. The in-memory set is updated even if persisting fails.
    ///
    /// Returns whether the address was newly added.
    pub async fn insert(&self, address: &str) -> StorageResult<bool> {
        let address = normalize_address(address);
        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let mut addresses = self.write();
            if !addresses.insert(address.clone()) {
                return Ok(false);
            }
            addresses.clone()
        };

        info!(address = %address, "Blacklisted");
        self.persist(&snapshot).await?;
        Ok(true)
    }

    /// Remove an address. Returns whether it was present.
    pub async fn remove(&self, address: &str) -> StorageResult<bool> {
        let address = normalize_address(address);
        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let mut addresses = self.write();
            if !addresses.remove(&address) {
                return Ok(false);
            }
            addresses.clone()
        };

        info!(address = %address, "Removed from blacklist");
        self.persist(&snapshot).await?;
        Ok(true)
    }

    async fn persist(&self, snapshot: &BTreeSet<String>) -> StorageResult<()> {
        self.file.save(snapshot).await.inspect_err(|e| {
            warn!("Failed to persist blacklist: {}", e);
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<String>> {
        self.addresses.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<String>> {
        self.addresses.write().unwrap_or_else(|e| e.into_inner())
    }
}
