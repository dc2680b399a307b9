//! Durable workflow state.
//!
//! A single JSON document maps feature ids to [`FeatureRecord`]s. Writes go
//! through a temp file and a rename, and every save first copies the current
//! file into a bounded set of backups.

pub mod record;
pub mod store;

pub use record::{FeatureRecord, FeatureStatus, Phase, StateDocument};
pub use store::{LoadedState, PersistentStateStore, StateError, StateResult, StateStoreConfig};
