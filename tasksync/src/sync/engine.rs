use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use super::conflict::{
    ConflictStrategy, ConflictType, Outcome, Resolution, SyncConflict, resolve,
};
use super::error::SyncError;
use super::mapping_store::{HISTORY_LIMIT, MappingStore};
use super::report::{SyncResult, SyncSummary};
use super::retry::RetryPolicy;
use crate::config::ProviderConfig;
use crate::hasher::hash_fields;
use crate::model::{ExternalItem, Provider, SyncMapping, Task, TaskId};
use crate::provider::{ProviderAdapter, ProviderError};
use crate::task_store::TaskStore;

/// Both sides of one provider as seen at the start of a pass.
struct Discovery {
    full: bool,
    remote: BTreeMap<String, ExternalItem>,
    /// External ids of mapped items confirmed gone remotely.
    deleted_remotely: HashSet<String>,
    tasks: BTreeMap<TaskId, Task>,
    mappings: Vec<SyncMapping>,
}

/// One reconciled change, ready to apply.
#[derive(Debug)]
enum Action {
    CreateRemote(Task),
    CreateLocal(ExternalItem),
    PushUpdate {
        task: Task,
        mapping: SyncMapping,
    },
    PullUpdate {
        task: Task,
        item: ExternalItem,
        mapping: SyncMapping,
    },
    DeleteLocal(SyncMapping),
    DeleteRemote(SyncMapping),
    /// Deleted on both sides.
    DropMapping(SyncMapping),
    /// Changed on both sides to the same content. `remote_hash` is the
    /// hash observed during discovery.
    Refresh {
        task: Task,
        mapping: SyncMapping,
        remote_hash: String,
    },
    Conflict {
        conflict: SyncConflict,
        mapping: SyncMapping,
    },
}

impl Action {
    fn label(&self) -> String {
        match self {
            Action::CreateRemote(task) => format!("task {}", task.id),
            Action::CreateLocal(item) => format!("remote item {}", item.external_id),
            Action::PushUpdate { mapping, .. }
            | Action::PullUpdate { mapping, .. }
            | Action::Refresh { mapping, .. }
            | Action::Conflict { mapping, .. }
            | Action::DeleteLocal(mapping)
            | Action::DeleteRemote(mapping)
            | Action::DropMapping(mapping) => format!("task {}", mapping.local_id),
        }
    }
}

/// Runs discover, reconcile and apply for one provider.
///
/// Callers must not run two passes for the same provider at once; the
/// manager serializes them.
pub struct SyncEngine {
    provider: Provider,
    adapter: Arc<dyn ProviderAdapter>,
    tasks: Arc<dyn TaskStore>,
    mappings: Arc<MappingStore>,
    settings: ProviderConfig,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl SyncEngine {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        tasks: Arc<dyn TaskStore>,
        mappings: Arc<MappingStore>,
        settings: ProviderConfig,
    ) -> Self {
        Self {
            provider: adapter.provider(),
            retry: RetryPolicy::with_attempts(settings.max_retries),
            call_timeout: settings.timeout(),
            adapter,
            tasks,
            mappings,
            settings,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// One full pass. Never fails: a discovery error is reported as an
    /// `Error` result and item errors are collected in `errors`.
    pub async fn run(&self, strategy_override: Option<ConflictStrategy>) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::new(self.provider);
        let pass_started_at = result.started_at;

        let discovery = match self.discover().await {
            Ok(discovery) => discovery,
            Err(err) => {
                tracing::warn!(provider = %self.provider, error = %err, "discovery failed, pass aborted");
                let mut failed = SyncResult::failed(self.provider, &err);
                failed.finish(started);
                self.record_history(&failed).await;
                return failed;
            }
        };
        let full = discovery.full;
        let actions = self.reconcile(discovery);
        tracing::debug!(
            provider = %self.provider,
            full,
            actions = actions.len(),
            "reconciled"
        );

        let strategy = strategy_override.unwrap_or(self.settings.conflict_strategy);
        for action in actions {
            let label = action.label();
            if let Err(err) = self.apply(action, strategy, &mut result).await {
                tracing::warn!(provider = %self.provider, item = %label, error = %err, "sync item failed");
                result.record_error(format!("{label}: {err}"));
            }
        }

        // Anything left behind must be seen again, so only a clean pass
        // moves the cursor forward.
        let cursor = if result.is_clean() {
            self.mappings
                .set_sync_state(self.provider, pass_started_at)
                .await
        } else {
            self.mappings.clear_sync_state(self.provider).await
        };
        if let Err(err) = cursor {
            result.record_error(format!("sync state: {err}"));
        }

        result.finish(started);
        tracing::info!(
            provider = %self.provider,
            status = %result.status,
            created = result.items_created(),
            updated = result.items_updated(),
            deleted = result.items_deleted(),
            conflicts = result.conflict_count(),
            errors = result.errors.len(),
            elapsed_ms = result.duration.as_millis() as u64,
            "sync pass finished"
        );
        self.record_history(&result).await;
        result
    }

    /// History is informational; failing to write it does not change the
    /// outcome of the pass.
    async fn record_history(&self, result: &SyncResult) {
        if let Err(err) = self
            .mappings
            .record_sync(&SyncSummary::from(result), HISTORY_LIMIT)
            .await
        {
            tracing::warn!(provider = %self.provider, error = %err, "failed to record sync history");
        }
    }

    async fn discover(&self) -> Result<Discovery, SyncError> {
        let mappings = self.mappings.list_mappings(self.provider).await?;
        let since = if mappings.is_empty() {
            None
        } else {
            self.mappings.get_sync_state(self.provider).await?
        };

        if !self
            .call("authenticate", || self.adapter.authenticate())
            .await?
        {
            return Err(SyncError::Authentication(format!(
                "{} rejected the stored credentials",
                self.provider
            )));
        }
        let fetched = self
            .call("fetch_items", || self.adapter.fetch_items(since))
            .await?;
        let full = since.is_none();
        let remote: BTreeMap<String, ExternalItem> = fetched
            .into_iter()
            .map(|item| (item.external_id.clone(), item))
            .collect();

        // Absence from a complete listing already means deletion; anything
        // else has to be asked about.
        let listing_complete = full && self.adapter.full_fetch_is_complete();
        let mut deleted_remotely = HashSet::new();
        for mapping in &mappings {
            if remote.contains_key(&mapping.external_id) {
                continue;
            }
            let exists = !listing_complete
                && self
                    .call("verify_item_exists", || {
                        self.adapter.verify_item_exists(&mapping.external_id)
                    })
                    .await?;
            if !exists {
                deleted_remotely.insert(mapping.external_id.clone());
            }
        }

        let tasks = self
            .tasks
            .list_todos()?
            .into_iter()
            .map(|task| (task.id, task))
            .collect();

        Ok(Discovery {
            full,
            remote,
            deleted_remotely,
            tasks,
            mappings,
        })
    }

    fn reconcile(&self, mut discovery: Discovery) -> Vec<Action> {
        let mut actions = Vec::new();
        for mapping in discovery.mappings {
            let local = discovery.tasks.remove(&mapping.local_id);
            let remote = discovery.remote.remove(&mapping.external_id);
            let remote_deleted = discovery.deleted_remotely.contains(&mapping.external_id);
            if let Some(action) = self.reconcile_mapping(mapping, local, remote, remote_deleted) {
                actions.push(action);
            }
        }
        // Whatever is left has never been synced. No content matching is
        // attempted: an identical remote item is still created locally.
        actions.extend(discovery.tasks.into_values().map(Action::CreateRemote));
        actions.extend(discovery.remote.into_values().map(Action::CreateLocal));
        actions
    }

    fn reconcile_mapping(
        &self,
        mapping: SyncMapping,
        local: Option<Task>,
        remote: Option<ExternalItem>,
        remote_deleted: bool,
    ) -> Option<Action> {
        let remote_hash = remote.as_ref().map(|item| self.remote_hash(item));
        let remote_changed = remote_hash
            .as_ref()
            .is_some_and(|hash| *hash != mapping.remote_hash);

        let Some(task) = local else {
            return Some(if remote_deleted {
                Action::DropMapping(mapping)
            } else if remote_changed {
                let conflict = self.detect(
                    ConflictType::LocalDeletedRemoteModified,
                    &mapping,
                    None,
                    remote,
                );
                Action::Conflict { conflict, mapping }
            } else {
                Action::DeleteRemote(mapping)
            });
        };

        let local_hash = hash_fields(&task.sync_fields());
        let local_changed = local_hash != mapping.local_hash;
        if remote_deleted {
            return Some(if local_changed {
                let conflict = self.detect(
                    ConflictType::RemoteDeletedLocalModified,
                    &mapping,
                    Some(task),
                    None,
                );
                Action::Conflict { conflict, mapping }
            } else {
                Action::DeleteLocal(mapping)
            });
        }

        match (local_changed, remote_changed, remote, remote_hash) {
            (true, true, Some(item), Some(remote_hash)) => Some(if remote_hash == local_hash {
                Action::Refresh {
                    task,
                    mapping,
                    remote_hash,
                }
            } else {
                let conflict =
                    self.detect(ConflictType::UpdateConflict, &mapping, Some(task), Some(item));
                Action::Conflict { conflict, mapping }
            }),
            (true, _, _, _) => Some(Action::PushUpdate { task, mapping }),
            (false, true, Some(item), _) => Some(Action::PullUpdate {
                task,
                item,
                mapping,
            }),
            _ => None,
        }
    }

    fn detect(
        &self,
        conflict_type: ConflictType,
        mapping: &SyncMapping,
        local: Option<Task>,
        remote: Option<ExternalItem>,
    ) -> SyncConflict {
        let remote_task = remote.as_ref().map(|item| {
            let mut task = self.adapter.map_from_external(item);
            task.id = mapping.local_id;
            task
        });
        tracing::debug!(
            provider = %self.provider,
            task = mapping.local_id,
            kind = %conflict_type,
            "conflict detected"
        );
        SyncConflict {
            external_id: Some(mapping.external_id.clone()),
            local,
            remote: remote_task,
            remote_item: remote,
            baseline: mapping.snapshot.clone(),
            ..SyncConflict::new(self.provider, mapping.local_id, conflict_type)
        }
    }

    /// Hash of a remote item in local terms, comparable with local hashes.
    fn remote_hash(&self, item: &ExternalItem) -> String {
        hash_fields(&self.adapter.map_from_external(item).sync_fields())
    }

    /// Hash the provider will report for `task` once it holds it.
    fn pushed_hash(&self, task: &Task) -> String {
        let echoed = self
            .adapter
            .map_from_external(&self.adapter.map_to_external(task));
        hash_fields(&echoed.sync_fields())
    }

    async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        Ok(self.retry.run(operation, self.call_timeout, call).await?)
    }

    /// A fresh local id. Ids of deleted tasks stay reserved while a mapping
    /// or pending conflict still refers to them.
    async fn allocate_local_id(&self) -> Result<TaskId, SyncError> {
        let next = self.tasks.next_id()?;
        let reserved = self.mappings.highest_local_id().await?;
        Ok(reserved.map_or(next, |highest| next.max(highest + 1)))
    }

    /// Records that `task` and `external_id` now agree. `remote_hash` is what
    /// the provider side hashes to at this point.
    async fn record_mapping(
        &self,
        task: &Task,
        external_id: &str,
        remote_hash: String,
        previous: Option<&SyncMapping>,
    ) -> Result<(), SyncError> {
        let now = OffsetDateTime::now_utc();
        let fields = task.sync_fields();
        let mapping = SyncMapping {
            provider: self.provider,
            local_id: task.id,
            external_id: external_id.to_string(),
            local_hash: hash_fields(&fields),
            remote_hash,
            snapshot: Some(fields),
            last_synced: now,
            created_at: previous.map_or(now, |m| m.created_at),
            sync_count: previous.map_or(1, |m| m.sync_count + 1),
        };
        self.mappings.upsert_mapping(&mapping).await?;
        Ok(())
    }

    /// Resolves a stored conflict against the current local task.
    pub async fn resolve_stored(
        &self,
        mut conflict: SyncConflict,
        strategy: ConflictStrategy,
    ) -> Result<Resolution, SyncError> {
        let Some(id) = conflict.id else {
            return Err(SyncError::IncompleteConflict("id"));
        };
        if conflict.resolved {
            return Err(SyncError::ConflictAlreadyResolved(id));
        }

        conflict.local = self.tasks.load_todo(conflict.local_id)?;
        let stale = match conflict.conflict_type {
            ConflictType::LocalDeletedRemoteModified => conflict
                .local
                .is_some()
                .then_some("the local task exists again"),
            ConflictType::BothDeleted => None,
            _ => conflict
                .local
                .is_none()
                .then_some("the local task no longer exists"),
        };
        if let Some(reason) = stale {
            return Err(SyncError::StaleConflict(id, reason.to_string()));
        }
        let mapping = self
            .mappings
            .get_mapping(self.provider, conflict.local_id)
            .await?
            .ok_or_else(|| SyncError::StaleConflict(id, "the task is no longer mapped".into()))?;

        let resolution = resolve(&conflict, strategy)?;
        if resolution.is_pending() {
            return Ok(resolution);
        }

        let mut scratch = SyncResult::new(self.provider);
        match self
            .apply_outcome(&conflict, &mapping, strategy, &resolution.outcome, &mut scratch)
            .await
        {
            Ok(true) => {
                self.mappings
                    .mark_conflict_resolved(id, strategy, OffsetDateTime::now_utc())
                    .await?;
                tracing::info!(
                    provider = %self.provider,
                    conflict = id,
                    strategy = %strategy,
                    "conflict resolved"
                );
                Ok(resolution)
            }
            Ok(false) => {
                let err = SyncError::DirectionBlocked(self.settings.sync_direction.as_str());
                self.mappings
                    .record_conflict_error(id, &err.to_string())
                    .await?;
                Err(err)
            }
            Err(err) => {
                self.mappings
                    .record_conflict_error(id, &err.to_string())
                    .await?;
                Err(err)
            }
        }
    }
}

include!("engine_apply.rs");

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
