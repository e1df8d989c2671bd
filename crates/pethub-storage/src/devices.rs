use crate::error::{StorageError, StorageResult};
use crate::json_file::JsonFile;
use pethub_core::DeviceConfig;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Load the device-config file (a JSON array of [`DeviceConfig`]).
///
/// A missing file yields no devices.
///
/// # Errors
/// Returns `StorageError::Validation` if two entries share an id or an entry
/// has an empty address.
pub async fn load_device_configs(path: impl AsRef<Path>) -> StorageResult<Vec<DeviceConfig>> {
    let path = path.as_ref();
    let configs: Vec<DeviceConfig> = JsonFile::new(path).load().await?;

    let mut seen = HashSet::with_capacity(configs.len());
    for config in &configs {
        if !seen.insert(config.id.as_str()) {
            return Err(StorageError::Validation(format!(
                "Duplicate device id '{}' in {}",
                config.id,
                path.display()
            )));
        }
        if config.ip.trim().is_empty() {
            return Err(StorageError::Validation(format!(
                "Device '{}' has no address",
                config.id
            )));
        }
    }

    info!("Loaded {} device configs from {}", configs.len(), path.display());
    Ok(configs)
}

/// Write the device-config file.
pub async fn save_device_configs(
    path: impl AsRef<Path>,
    configs: &[DeviceConfig],
) -> StorageResult<()> {
    JsonFile::new(path.as_ref()).save(&configs.to_vec()).await
}
