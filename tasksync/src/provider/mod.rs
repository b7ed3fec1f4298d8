mod pacing;
mod priority;
mod todoist;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::{ExternalItem, Provider, Task};
use crate::storage::CredentialError;

pub use pacing::Pacer;
pub use priority::PriorityScale;
pub use todoist::{TOKEN_ENV, TOKEN_KEY, TodoistAdapter};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rejected the request: {0}")]
    Provider(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("credential storage: {0}")]
    Credentials(#[from] CredentialError),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

/// One external task service.
///
/// Write calls must tolerate being repeated with the same logical change:
/// the engine may replay the last change of a pass that died before its
/// mapping was recorded.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn authenticate(&self) -> Result<bool, ProviderError>;

    /// Items changed after `since`, or every item when `since` is `None`.
    async fn fetch_items(
        &self,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<ExternalItem>, ProviderError>;

    /// Whether a full fetch returns every item that exists remotely. When it
    /// leaves some out, a missing item must be confirmed with
    /// `verify_item_exists` before it counts as deleted.
    fn full_fetch_is_complete(&self) -> bool {
        true
    }

    async fn create_item(&self, task: &Task) -> Result<String, ProviderError>;

    /// Returns false when the item no longer exists remotely.
    async fn update_item(&self, external_id: &str, task: &Task) -> Result<bool, ProviderError>;

    /// Deleting an item that is already gone succeeds.
    async fn delete_item(&self, external_id: &str) -> Result<bool, ProviderError>;

    async fn verify_item_exists(&self, external_id: &str) -> Result<bool, ProviderError>;

    fn map_to_external(&self, task: &Task) -> ExternalItem;

    /// The returned task has id 0; the caller assigns the local id.
    fn map_from_external(&self, item: &ExternalItem) -> Task;
}

/// Adapters registered at startup, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }
}
