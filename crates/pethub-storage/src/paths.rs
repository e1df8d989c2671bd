use std::path::{Path, PathBuf};

pub const DEVICES_FILE: &str = "devices.json";
pub const MEAL_PLANS_FILE: &str = "meal_plans.json";
pub const LAMPS_FILE: &str = "lamps.json";
pub const BLACKLIST_FILE: &str = "blacklist.json";

/// Locations of the hub's JSON files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubPaths {
    pub data_dir: PathBuf,
    pub devices: PathBuf,
    pub meal_plans: PathBuf,
    pub lamps: PathBuf,
    pub blacklist: PathBuf,
}

impl Default for HubPaths {
    fn default() -> Self {
        Self::new("data")
    }
}

impl HubPaths {
    /// All four files inside `data_dir`, with their default names.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            devices: data_dir.join(DEVICES_FILE),
            meal_plans: data_dir.join(MEAL_PLANS_FILE),
            lamps: data_dir.join(LAMPS_FILE),
            blacklist: data_dir.join(BLACKLIST_FILE),
            data_dir,
        }
    }

    /// Read device configs from another file
    pub fn devices(mut self, path: impl Into<PathBuf>) -> Self {
        self.devices = path.into();
        self
    }
}
