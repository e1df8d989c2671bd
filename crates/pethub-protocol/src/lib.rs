//! Pure data handling for local-protocol appliances.
//!
//! Nothing in this crate performs I/O:
//!
//! - [`meal_plan`]: the 5-byte-per-record feeding schedule codec carried as
//!   base64 in the feeder's meal-plan data point.
//! - [`status`]: translators from raw data point maps into typed status
//!   structures for feeders, litter boxes and fountains.
//! - [`classify`]: appliance kind inference from category codes and product
//!   names.
//! - [`payload`]: detection of corrupted inbound payloads.

pub mod classify;
pub mod meal_plan;
pub mod payload;
pub mod status;

pub use classify::{classify, classify_config};
pub use meal_plan::{
    EntryStatus, MealPlanEntry, MealPlanEntryInput, MealTime, Weekday, decode, encode, format,
    validate,
};
pub use payload::{is_corrupted, is_corrupted_bytes};
pub use status::{DeviceStatus, translate};
