mod conflict;
mod engine;
mod error;
mod manager;
mod mapping_store;
mod report;
mod retry;

pub use conflict::{ConflictStrategy, ConflictType, Outcome, Resolution, SyncConflict, resolve};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use manager::SyncManager;
pub use mapping_store::{MappingStore, MappingStoreError, ProviderStats};
pub use report::{SyncResult, SyncStatus, SyncSummary};
pub use retry::RetryPolicy;
