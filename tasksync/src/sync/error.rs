use std::time::Duration;

use thiserror::Error;

use super::conflict::{ConflictStrategy, ConflictType};
use super::mapping_store::MappingStoreError;
use crate::model::{Provider, TaskId};
use crate::provider::ProviderError;
use crate::task_store::TaskStoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error(
        "{provider} item {external_id} is mapped to task {existing_local_id}, refusing to map it to task {conflicting_local_id}"
    )]
    DuplicateMapping {
        provider: Provider,
        external_id: String,
        existing_local_id: TaskId,
        conflicting_local_id: TaskId,
    },
    #[error("task {local_id} is already mapped to {provider} item {external_id}")]
    LocalIdTaken {
        provider: Provider,
        local_id: TaskId,
        external_id: String,
    },
    #[error("strategy {strategy} cannot resolve a {conflict_type} conflict")]
    ConflictStrategyMismatch {
        strategy: ConflictStrategy,
        conflict_type: ConflictType,
    },
    #[error("mapping store: {0}")]
    MappingStore(MappingStoreError),
    #[error("task store: {0}")]
    TaskStore(#[from] TaskStoreError),
    #[error("no adapter registered for {0}")]
    UnknownProvider(Provider),
    #[error("conflict {0} not found")]
    ConflictNotFound(i64),
    #[error("conflict {0} is already resolved")]
    ConflictAlreadyResolved(i64),
    #[error("conflict {0} is no longer current: {1}")]
    StaleConflict(i64, String),
    #[error("conflict record is missing its {0}")]
    IncompleteConflict(&'static str),
    #[error("sync direction {0} does not allow this change")]
    DirectionBlocked(&'static str),
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Authentication(message) => SyncError::Authentication(message),
            ProviderError::Unavailable(message) => SyncError::ProviderUnavailable(message),
            ProviderError::Provider(message) => SyncError::Provider(message),
            ProviderError::Timeout(after) => SyncError::Timeout(after),
            ProviderError::Credentials(err) => SyncError::Authentication(err.to_string()),
        }
    }
}

impl From<MappingStoreError> for SyncError {
    fn from(err: MappingStoreError) -> Self {
        match err {
            MappingStoreError::DuplicateMapping {
                provider,
                external_id,
                existing_local_id,
                conflicting_local_id,
            } => SyncError::DuplicateMapping {
                provider,
                external_id,
                existing_local_id,
                conflicting_local_id,
            },
            other => SyncError::MappingStore(other),
        }
    }
}
