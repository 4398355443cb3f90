//! Session Management Module
//!
//! Pod lifecycle state machine, the registry that owns every pod record, and
//! persistence of that registry across restarts.

pub mod registry;
pub mod state;
pub mod store;

pub use registry::{CostSample, PodRecord, RegistryError, SessionRegistry};
pub use state::{Actor, PodState};
pub use store::{reconciled_state, PodStore};
