use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::conflict::{ConflictStrategy, Resolution, SyncConflict};
use super::engine::SyncEngine;
use super::error::SyncError;
use super::mapping_store::{MappingStore, ProviderStats};
use super::report::{SyncResult, SyncSummary};
use crate::config::ProviderConfig;
use crate::model::Provider;
use crate::provider::ProviderRegistry;
use crate::task_store::TaskStore;

/// Entry point for everything that syncs or inspects sync state.
///
/// Passes for one provider never overlap; different providers run
/// concurrently.
pub struct SyncManager {
    settings: BTreeMap<Provider, ProviderConfig>,
    registry: ProviderRegistry,
    tasks: Arc<dyn TaskStore>,
    mappings: Arc<MappingStore>,
    locks: HashMap<Provider, Arc<Mutex<()>>>,
}

impl SyncManager {
    pub fn new(
        settings: BTreeMap<Provider, ProviderConfig>,
        registry: ProviderRegistry,
        tasks: Arc<dyn TaskStore>,
        mappings: Arc<MappingStore>,
    ) -> Self {
        let locks = Provider::ALL
            .into_iter()
            .map(|provider| (provider, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            settings,
            registry,
            tasks,
            mappings,
            locks,
        }
    }

    fn engine(&self, provider: Provider) -> Result<SyncEngine, SyncError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or(SyncError::UnknownProvider(provider))?;
        let settings = self.settings.get(&provider).cloned().unwrap_or_default();
        Ok(SyncEngine::new(
            adapter,
            self.tasks.clone(),
            self.mappings.clone(),
            settings,
        ))
    }

    fn lock(&self, provider: Provider) -> Arc<Mutex<()>> {
        self.locks
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())))
    }

    /// Runs one pass for `provider`, waiting for any pass already running.
    pub async fn sync_provider(
        &self,
        provider: Provider,
        strategy: Option<ConflictStrategy>,
    ) -> Result<SyncResult, SyncError> {
        let engine = self.engine(provider)?;
        let lock = self.lock(provider);
        let _guard = lock.lock().await;
        Ok(engine.run(strategy).await)
    }

    /// Runs every enabled provider concurrently. One provider failing does
    /// not affect the others.
    pub async fn sync_all(
        &self,
        strategy: Option<ConflictStrategy>,
    ) -> BTreeMap<Provider, SyncResult> {
        let enabled: Vec<Provider> = self
            .settings
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(provider, _)| *provider)
            .collect();
        let passes = enabled.into_iter().map(|provider| async move {
            let result = match self.sync_provider(provider, strategy).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(%provider, error = %err, "provider skipped");
                    SyncResult::failed(provider, err)
                }
            };
            (provider, result)
        });
        join_all(passes).await.into_iter().collect()
    }

    pub async fn get_conflicts(
        &self,
        provider: Option<Provider>,
        resolved: bool,
    ) -> Result<Vec<SyncConflict>, SyncError> {
        Ok(self.mappings.list_conflicts(provider, resolved).await?)
    }

    /// Applies `strategy` to a pending conflict.
    pub async fn resolve_conflict(
        &self,
        id: i64,
        strategy: ConflictStrategy,
    ) -> Result<Resolution, SyncError> {
        let conflict = self
            .mappings
            .get_conflict(id)
            .await?
            .ok_or(SyncError::ConflictNotFound(id))?;
        let engine = self.engine(conflict.provider)?;
        let lock = self.lock(conflict.provider);
        let _guard = lock.lock().await;
        engine.resolve_stored(conflict, strategy).await
    }

    pub async fn status(&self) -> Result<Vec<ProviderStats>, SyncError> {
        Ok(self.mappings.stats().await?)
    }

    /// Most recent passes first.
    pub async fn history(
        &self,
        provider: Option<Provider>,
        limit: usize,
    ) -> Result<Vec<SyncSummary>, SyncError> {
        Ok(self.mappings.sync_history(provider, limit).await?)
    }

    /// Deletes resolved conflicts resolved before `older_than`.
    pub async fn prune_resolved_conflicts(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<u64, SyncError> {
        let removed = self.mappings.delete_resolved_conflicts(older_than).await?;
        tracing::info!(removed, "pruned resolved conflicts");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::provider::fake::FakeAdapter;
    use crate::sync::report::SyncStatus;
    use crate::task_store::MemoryTaskStore;
    use sqlx::SqlitePool;

    async fn manager(
        adapter: Arc<FakeAdapter>,
        settings: BTreeMap<Provider, ProviderConfig>,
    ) -> (SyncManager, Arc<MemoryTaskStore>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let mappings = MappingStore::from_pool(pool);
        mappings.init().await.unwrap();
        let tasks = Arc::new(MemoryTaskStore::with_tasks([Task::new(1, "Buy milk")]));
        let mut registry = ProviderRegistry::new();
        registry.register(adapter);
        let manager = SyncManager::new(settings, registry, tasks.clone(), Arc::new(mappings));
        (manager, tasks)
    }

    fn todoist(settings: ProviderConfig) -> BTreeMap<Provider, ProviderConfig> {
        BTreeMap::from([(Provider::Todoist, settings)])
    }

    #[tokio::test]
    async fn sync_all_reports_every_enabled_provider() {
        let adapter = Arc::new(FakeAdapter::new());
        let mut settings = todoist(ProviderConfig::default());
        settings.insert(Provider::AppleReminders, ProviderConfig::default());
        let (manager, _) = manager(adapter.clone(), settings).await;

        let results = manager.sync_all(None).await;

        assert_eq!(results[&Provider::Todoist].status, SyncStatus::Success);
        assert_eq!(results[&Provider::Todoist].remote_created, 1);
        // No adapter is registered for reminders.
        let reminders = &results[&Provider::AppleReminders];
        assert_eq!(reminders.status, SyncStatus::Error);
        assert!(reminders.errors[0].contains("no adapter"));
        assert_eq!(adapter.remote_items().len(), 1);

        // Only passes that ran are kept in the history.
        let history = manager.history(None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].provider, Provider::Todoist);
        assert_eq!(history[0].items_created, 1);
    }

    #[tokio::test]
    async fn disabled_providers_are_not_synced() {
        let adapter = Arc::new(FakeAdapter::new());
        let settings = todoist(ProviderConfig {
            enabled: false,
            ..ProviderConfig::default()
        });
        let (manager, _) = manager(adapter.clone(), settings).await;

        assert!(manager.sync_all(None).await.is_empty());
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let (manager, _) = manager(Arc::new(FakeAdapter::new()), BTreeMap::new()).await;

        let err = manager
            .sync_provider(Provider::AppleReminders, None)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::UnknownProvider(Provider::AppleReminders)));
    }

    #[tokio::test]
    async fn resolves_pending_conflict_by_id() {
        let adapter = Arc::new(FakeAdapter::new());
        let settings = todoist(ProviderConfig {
            conflict_strategy: ConflictStrategy::Manual,
            ..ProviderConfig::default()
        });
        let (manager, tasks) = manager(adapter.clone(), settings).await;
        manager.sync_provider(Provider::Todoist, None).await.unwrap();
        let mut task = tasks.load_todo(1).unwrap().unwrap();
        task.text = "Buy oat milk".into();
        tasks.save_todo(&task).unwrap();
        adapter.edit_remote("r1", |item| item.title = "Buy soy milk".into());
        let result = manager.sync_provider(Provider::Todoist, None).await.unwrap();
        assert_eq!(result.status, SyncStatus::Conflict);

        let pending = manager.get_conflicts(Some(Provider::Todoist), false).await.unwrap();
        let id = pending[0].id.unwrap();
        let resolution = manager
            .resolve_conflict(id, ConflictStrategy::RemoteWins)
            .await
            .unwrap();

        assert_eq!(resolution.strategy, ConflictStrategy::RemoteWins);
        assert_eq!(tasks.load_todo(1).unwrap().unwrap().text, "Buy soy milk");
        assert!(manager.get_conflicts(None, false).await.unwrap().is_empty());
        assert_eq!(manager.get_conflicts(None, true).await.unwrap().len(), 1);

        let history = manager.history(Some(Provider::Todoist), 10).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|entry| entry.status).collect();
        assert_eq!(statuses, vec![SyncStatus::Conflict, SyncStatus::Success]);
        assert_eq!(history[0].conflicts, 1);
        assert_eq!(history[0].pending_conflicts, 1);

        let status = manager.status().await.unwrap();
        assert_eq!(status[0].mappings, 1);
        assert_eq!(status[0].pending_conflicts, 0);
        assert_eq!(status[0].resolved_conflicts, 1);

        let removed = manager
            .prune_resolved_conflicts(OffsetDateTime::now_utc() + time::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn missing_conflict_is_reported() {
        let (manager, _) = manager(Arc::new(FakeAdapter::new()), BTreeMap::new()).await;

        let err = manager
            .resolve_conflict(42, ConflictStrategy::LocalWins)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::ConflictNotFound(42)));
    }
}
