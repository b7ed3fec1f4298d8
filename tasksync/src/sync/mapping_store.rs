use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

use super::conflict::{ConflictStrategy, ConflictType, SyncConflict};
use super::report::{SyncStatus, SyncSummary};
use crate::model::{Provider, SyncMapping, TaskId, UnknownVariant};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum MappingStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] time::error::ComponentRange),
    #[error(transparent)]
    UnknownVariant(#[from] UnknownVariant),
    #[error(
        "{provider} item {external_id} is already mapped to task {existing_local_id}, cannot map it to task {conflicting_local_id}"
    )]
    DuplicateMapping {
        provider: Provider,
        external_id: String,
        existing_local_id: TaskId,
        conflicting_local_id: TaskId,
    },
}

/// Per-provider counters reported by `tasksync status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStats {
    pub provider: Provider,
    pub mappings: i64,
    pub pending_conflicts: i64,
    pub resolved_conflicts: i64,
    pub last_sync: Option<OffsetDateTime>,
}

impl ProviderStats {
    fn empty(provider: Provider) -> Self {
        Self {
            provider,
            mappings: 0,
            pending_conflicts: 0,
            resolved_conflicts: 0,
            last_sync: None,
        }
    }
}

/// Passes kept per provider in the sync history.
pub const HISTORY_LIMIT: usize = 100;

/// Durable sync state: mappings, per-provider cursors, conflicts and a short
/// history of finished passes.
pub struct MappingStore {
    pool: SqlitePool,
}

impl MappingStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, MappingStoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, MappingStoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, MappingStoreError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), MappingStoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_mapping(
        &self,
        provider: Provider,
        local_id: TaskId,
    ) -> Result<Option<SyncMapping>, MappingStoreError> {
        let row = sqlx::query(
            "SELECT provider, local_id, external_id, local_hash, remote_hash, snapshot, last_synced, created_at, sync_count
             FROM sync_mappings WHERE provider = ?1 AND local_id = ?2",
        )
        .bind(provider.as_str())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    pub async fn get_mapping_by_external(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<SyncMapping>, MappingStoreError> {
        let row = sqlx::query(
            "SELECT provider, local_id, external_id, local_hash, remote_hash, snapshot, last_synced, created_at, sync_count
             FROM sync_mappings WHERE provider = ?1 AND external_id = ?2",
        )
        .bind(provider.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    pub async fn list_mappings(
        &self,
        provider: Provider,
    ) -> Result<Vec<SyncMapping>, MappingStoreError> {
        let rows = sqlx::query(
            "SELECT provider, local_id, external_id, local_hash, remote_hash, snapshot, last_synced, created_at, sync_count
             FROM sync_mappings WHERE provider = ?1 ORDER BY local_id ASC",
        )
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mapping_from_row).collect()
    }

    /// Creates or replaces the mapping of `(provider, local_id)`. Mapping an
    /// external id that already belongs to another task fails and leaves
    /// both rows as they were.
    pub async fn upsert_mapping(&self, mapping: &SyncMapping) -> Result<(), MappingStoreError> {
        let snapshot = mapping
            .snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "INSERT INTO sync_mappings (
                provider, local_id, external_id, local_hash, remote_hash, snapshot, last_synced, created_at, sync_count
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
             ON CONFLICT(provider, local_id) DO UPDATE SET
                external_id = excluded.external_id,
                local_hash = excluded.local_hash,
                remote_hash = excluded.remote_hash,
                snapshot = excluded.snapshot,
                last_synced = excluded.last_synced,
                sync_count = sync_mappings.sync_count + 1",
        )
        .bind(mapping.provider.as_str())
        .bind(mapping.local_id)
        .bind(&mapping.external_id)
        .bind(&mapping.local_hash)
        .bind(&mapping.remote_hash)
        .bind(snapshot)
        .bind(mapping.last_synced.unix_timestamp())
        .bind(mapping.created_at.unix_timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let existing = self
                    .get_mapping_by_external(mapping.provider, &mapping.external_id)
                    .await?;
                Err(MappingStoreError::DuplicateMapping {
                    provider: mapping.provider,
                    external_id: mapping.external_id.clone(),
                    existing_local_id: existing.map_or(mapping.local_id, |m| m.local_id),
                    conflicting_local_id: mapping.local_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns false when there was no such mapping.
    pub async fn delete_mapping(
        &self,
        provider: Provider,
        local_id: TaskId,
    ) -> Result<bool, MappingStoreError> {
        let result = sqlx::query("DELETE FROM sync_mappings WHERE provider = ?1 AND local_id = ?2")
            .bind(provider.as_str())
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Highest local id still referenced by a mapping or a pending conflict,
    /// across every provider. New local tasks must be numbered above it.
    pub async fn highest_local_id(&self) -> Result<Option<TaskId>, MappingStoreError> {
        let row = sqlx::query(
            "SELECT MAX(local_id) AS highest FROM (
                SELECT local_id FROM sync_mappings
                UNION ALL
                SELECT local_id FROM sync_conflicts WHERE resolved = 0
             )",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("highest")?)
    }

    pub async fn get_sync_state(
        &self,
        provider: Provider,
    ) -> Result<Option<OffsetDateTime>, MappingStoreError> {
        let row = sqlx::query("SELECT last_sync FROM sync_state WHERE provider = ?1")
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(from_unix(row.try_get("last_sync")?)?))
    }

    pub async fn set_sync_state(
        &self,
        provider: Provider,
        last_sync: OffsetDateTime,
    ) -> Result<(), MappingStoreError> {
        sqlx::query(
            "INSERT INTO sync_state (provider, last_sync) VALUES (?1, ?2)
             ON CONFLICT(provider) DO UPDATE SET last_sync = excluded.last_sync",
        )
        .bind(provider.as_str())
        .bind(last_sync.unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forgets the cursor so the next pass fetches everything.
    pub async fn clear_sync_state(&self, provider: Provider) -> Result<(), MappingStoreError> {
        sqlx::query("DELETE FROM sync_state WHERE provider = ?1")
            .bind(provider.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stores `conflict` and returns its id. A conflict without an id
    /// replaces the pending conflict of the same task, if there is one.
    pub async fn save_conflict(&self, conflict: &SyncConflict) -> Result<i64, MappingStoreError> {
        let local = conflict.local.as_ref().map(serde_json::to_string).transpose()?;
        let remote = conflict
            .remote
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let remote_item = conflict
            .remote_item
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let baseline = conflict
            .baseline
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        let existing = match conflict.id {
            Some(id) => Some(id),
            None => sqlx::query(
                "SELECT id FROM sync_conflicts WHERE provider = ?1 AND local_id = ?2 AND resolved = 0",
            )
            .bind(conflict.provider.as_str())
            .bind(conflict.local_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get::<i64, _>("id"))
            .transpose()?,
        };

        let query = match existing {
            Some(_) => {
                "UPDATE sync_conflicts SET
                    provider = ?1, local_id = ?2, external_id = ?3, conflict_type = ?4,
                    local_snapshot = ?5, remote_snapshot = ?6, remote_item = ?7, baseline = ?8,
                    detected_at = ?9, resolved = ?10, strategy = ?11, resolved_at = ?12,
                    last_error = ?13
                 WHERE id = ?14
                 RETURNING id"
            }
            None => {
                "INSERT INTO sync_conflicts (
                    provider, local_id, external_id, conflict_type, local_snapshot,
                    remote_snapshot, remote_item, baseline, detected_at, resolved, strategy,
                    resolved_at, last_error
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 RETURNING id"
            }
        };
        let mut statement = sqlx::query(query)
            .bind(conflict.provider.as_str())
            .bind(conflict.local_id)
            .bind(&conflict.external_id)
            .bind(conflict.conflict_type.as_str())
            .bind(local)
            .bind(remote)
            .bind(remote_item)
            .bind(baseline)
            .bind(conflict.detected_at.unix_timestamp())
            .bind(conflict.resolved)
            .bind(conflict.strategy.map(|s| s.as_str()))
            .bind(conflict.resolved_at.map(OffsetDateTime::unix_timestamp))
            .bind(&conflict.last_error);
        if let Some(id) = existing {
            statement = statement.bind(id);
        }
        let id: i64 = statement.fetch_one(&mut *tx).await?.try_get("id")?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_conflict(&self, id: i64) -> Result<Option<SyncConflict>, MappingStoreError> {
        let row = sqlx::query(
            "SELECT id, provider, local_id, external_id, conflict_type, local_snapshot, remote_snapshot,
                    remote_item, baseline, detected_at, resolved, strategy, resolved_at, last_error
             FROM sync_conflicts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    /// Conflicts in detection order, for one provider or all of them.
    pub async fn list_conflicts(
        &self,
        provider: Option<Provider>,
        resolved: bool,
    ) -> Result<Vec<SyncConflict>, MappingStoreError> {
        let rows = sqlx::query(
            "SELECT id, provider, local_id, external_id, conflict_type, local_snapshot, remote_snapshot,
                    remote_item, baseline, detected_at, resolved, strategy, resolved_at, last_error
             FROM sync_conflicts
             WHERE (?1 IS NULL OR provider = ?1) AND resolved = ?2
             ORDER BY id ASC",
        )
        .bind(provider.map(|p| p.as_str()))
        .bind(resolved)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }

    /// Returns false when the conflict does not exist.
    pub async fn mark_conflict_resolved(
        &self,
        id: i64,
        strategy: ConflictStrategy,
        resolved_at: OffsetDateTime,
    ) -> Result<bool, MappingStoreError> {
        let result = sqlx::query(
            "UPDATE sync_conflicts
             SET resolved = 1, strategy = ?1, resolved_at = ?2, last_error = NULL
             WHERE id = ?3",
        )
        .bind(strategy.as_str())
        .bind(resolved_at.unix_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_conflict_error(
        &self,
        id: i64,
        message: &str,
    ) -> Result<(), MappingStoreError> {
        sqlx::query("UPDATE sync_conflicts SET last_error = ?1 WHERE id = ?2")
            .bind(message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes resolved conflicts settled before `older_than`. Pending
    /// conflicts are never removed.
    pub async fn delete_resolved_conflicts(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<u64, MappingStoreError> {
        let result =
            sqlx::query("DELETE FROM sync_conflicts WHERE resolved = 1 AND resolved_at < ?1")
                .bind(older_than.unix_timestamp())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<Vec<ProviderStats>, MappingStoreError> {
        let mut stats: BTreeMap<Provider, ProviderStats> = BTreeMap::new();

        let rows =
            sqlx::query("SELECT provider, COUNT(*) AS total FROM sync_mappings GROUP BY provider")
                .fetch_all(&self.pool)
                .await?;
        for row in rows {
            let provider = Provider::parse(row.try_get("provider")?)?;
            stats
                .entry(provider)
                .or_insert_with(|| ProviderStats::empty(provider))
                .mappings = row.try_get("total")?;
        }

        let rows = sqlx::query(
            "SELECT provider, resolved, COUNT(*) AS total FROM sync_conflicts GROUP BY provider, resolved",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let provider = Provider::parse(row.try_get("provider")?)?;
            let entry = stats
                .entry(provider)
                .or_insert_with(|| ProviderStats::empty(provider));
            let total: i64 = row.try_get("total")?;
            if row.try_get::<bool, _>("resolved")? {
                entry.resolved_conflicts = total;
            } else {
                entry.pending_conflicts = total;
            }
        }

        let rows = sqlx::query("SELECT provider, last_sync FROM sync_state")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let provider = Provider::parse(row.try_get("provider")?)?;
            stats
                .entry(provider)
                .or_insert_with(|| ProviderStats::empty(provider))
                .last_sync = Some(from_unix(row.try_get("last_sync")?)?);
        }

        Ok(stats.into_values().collect())
    }

    /// Appends a finished pass and drops the oldest entries beyond `keep`
    /// for that provider.
    pub async fn record_sync(
        &self,
        summary: &SyncSummary,
        keep: usize,
    ) -> Result<(), MappingStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO sync_history (
                provider, started_at, status, items_created, items_updated, items_deleted,
                conflicts, pending_conflicts, skipped, errors, duration_ms
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(summary.provider.as_str())
        .bind(summary.started_at.unix_timestamp())
        .bind(summary.status.as_str())
        .bind(summary.items_created as i64)
        .bind(summary.items_updated as i64)
        .bind(summary.items_deleted as i64)
        .bind(summary.conflicts as i64)
        .bind(summary.pending_conflicts as i64)
        .bind(summary.skipped as i64)
        .bind(summary.errors as i64)
        .bind(i64::try_from(summary.duration.as_millis()).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM sync_history
             WHERE provider = ?1 AND id NOT IN (
                SELECT id FROM sync_history WHERE provider = ?1 ORDER BY id DESC LIMIT ?2
             )",
        )
        .bind(summary.provider.as_str())
        .bind(keep as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Most recent passes first, for one provider or all of them.
    pub async fn sync_history(
        &self,
        provider: Option<Provider>,
        limit: usize,
    ) -> Result<Vec<SyncSummary>, MappingStoreError> {
        let rows = sqlx::query(
            "SELECT provider, started_at, status, items_created, items_updated, items_deleted,
                    conflicts, pending_conflicts, skipped, errors, duration_ms
             FROM sync_history
             WHERE (?1 IS NULL OR provider = ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )
        .bind(provider.map(|p| p.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(summary_from_row).collect()
    }
}

fn mapping_from_row(row: &SqliteRow) -> Result<SyncMapping, MappingStoreError> {
    let provider: String = row.try_get("provider")?;
    let snapshot: Option<String> = row.try_get("snapshot")?;
    Ok(SyncMapping {
        provider: Provider::parse(&provider)?,
        local_id: row.try_get("local_id")?,
        external_id: row.try_get("external_id")?,
        local_hash: row.try_get("local_hash")?,
        remote_hash: row.try_get("remote_hash")?,
        snapshot: snapshot.as_deref().map(serde_json::from_str).transpose()?,
        last_synced: from_unix(row.try_get("last_synced")?)?,
        created_at: from_unix(row.try_get("created_at")?)?,
        sync_count: row.try_get("sync_count")?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<SyncConflict, MappingStoreError> {
    let provider: String = row.try_get("provider")?;
    let conflict_type: String = row.try_get("conflict_type")?;
    let strategy: Option<String> = row.try_get("strategy")?;
    let local: Option<String> = row.try_get("local_snapshot")?;
    let remote: Option<String> = row.try_get("remote_snapshot")?;
    let remote_item: Option<String> = row.try_get("remote_item")?;
    let baseline: Option<String> = row.try_get("baseline")?;
    let resolved_at: Option<i64> = row.try_get("resolved_at")?;
    Ok(SyncConflict {
        id: Some(row.try_get("id")?),
        provider: Provider::parse(&provider)?,
        local_id: row.try_get("local_id")?,
        external_id: row.try_get("external_id")?,
        conflict_type: ConflictType::parse(&conflict_type)?,
        local: local.as_deref().map(serde_json::from_str).transpose()?,
        remote: remote.as_deref().map(serde_json::from_str).transpose()?,
        remote_item: remote_item.as_deref().map(serde_json::from_str).transpose()?,
        baseline: baseline.as_deref().map(serde_json::from_str).transpose()?,
        detected_at: from_unix(row.try_get("detected_at")?)?,
        resolved: row.try_get("resolved")?,
        strategy: strategy.as_deref().map(ConflictStrategy::parse).transpose()?,
        resolved_at: resolved_at.map(from_unix).transpose()?,
        last_error: row.try_get("last_error")?,
    })
}

fn summary_from_row(row: &SqliteRow) -> Result<SyncSummary, MappingStoreError> {
    let count = |column: &str| -> Result<usize, MappingStoreError> {
        let value: i64 = row.try_get(column)?;
        Ok(usize::try_from(value).unwrap_or_default())
    };
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(SyncSummary {
        provider: Provider::parse(row.try_get("provider")?)?,
        started_at: from_unix(row.try_get("started_at")?)?,
        status: SyncStatus::parse(row.try_get("status")?)?,
        items_created: count("items_created")?,
        items_updated: count("items_updated")?,
        items_deleted: count("items_deleted")?,
        conflicts: count("conflicts")?,
        pending_conflicts: count("pending_conflicts")?,
        skipped: count("skipped")?,
        errors: count("errors")?,
        duration: std::time::Duration::from_millis(u64::try_from(duration_ms).unwrap_or_default()),
    })
}

fn from_unix(seconds: i64) -> Result<OffsetDateTime, MappingStoreError> {
    Ok(OffsetDateTime::from_unix_timestamp(seconds)?)
}

fn default_db_path() -> Result<PathBuf, MappingStoreError> {
    let mut path = dirs::data_dir().ok_or(MappingStoreError::MissingDataDir)?;
    path.push("tasksync");
    path.push("sync.db");
    Ok(path)
}

#[cfg(test)]
#[path = "mapping_store_tests.rs"]
mod tests;
