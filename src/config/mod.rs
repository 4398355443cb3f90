//! Configuration Module
//!
//! Settings file, tier catalog and on-disk locations.

pub mod settings;
pub mod storage;
pub mod templates;

pub use settings::Settings;
pub use storage::{config_dir, JsonStore, StorageError};
pub use templates::{CloudType, TemplateRegistry, Tier};
