//! JSON persistence for the pethub device hub.
//!
//! The hub keeps four plain JSON files in one data directory (see
//! [`HubPaths`]):
//!
//! | File | Content | Owner |
//! |---|---|---|
//! | `devices.json` | array of `DeviceConfig` | read once at startup |
//! | `meal_plans.json` | device id → base64 meal plan | [`MealPlanCache`] |
//! | `lamps.json` | array of `LampConfig` | [`LampConfigStore`] |
//! | `blacklist.json` | array of BLE addresses | [`Blacklist`] |
//!
//! All files are rewritten wholesale on every mutation through
//! [`JsonFile`], which writes a temporary sibling and renames it into place.
//!
//! # Examples
//!
//! ```no_run
//! use pethub_core::DeviceId;
//! use pethub_storage::{HubPaths, MealPlanCache, load_device_configs};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = HubPaths::new("./data");
//! let devices = load_device_configs(&paths.devices).await?;
//!
//! let cache = MealPlanCache::open(&paths.meal_plans).await?;
//! if let Some(device) = devices.first() {
//!     cache.set(&device.id, "EQceAgE=").await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod blacklist;
pub mod devices;
pub mod error;
pub mod json_file;
pub mod lamps;
pub mod meal_plans;
pub mod paths;

pub use blacklist::{Blacklist, normalize_address};
pub use devices::{load_device_configs, save_device_configs};
pub use error::{StorageError, StorageResult};
pub use json_file::JsonFile;
pub use lamps::LampConfigStore;
pub use meal_plans::MealPlanCache;
pub use paths::HubPaths;
