use std::fmt;
use std::time::Duration;

use time::OffsetDateTime;

use super::conflict::SyncConflict;
use crate::model::{Provider, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    NoChanges,
    /// Finished, but at least one conflict is still pending.
    Conflict,
    /// Finished with per-item errors.
    Partial,
    /// Aborted before any change was applied.
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::NoChanges => "no_changes",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Partial => "partial",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownVariant> {
        match value {
            "success" => Ok(SyncStatus::Success),
            "no_changes" => Ok(SyncStatus::NoChanges),
            "conflict" => Ok(SyncStatus::Conflict),
            "partial" => Ok(SyncStatus::Partial),
            "error" => Ok(SyncStatus::Error),
            other => Err(UnknownVariant {
                kind: "sync status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one sync pass for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub provider: Provider,
    pub status: SyncStatus,
    pub local_created: usize,
    pub local_updated: usize,
    pub local_deleted: usize,
    pub remote_created: usize,
    pub remote_updated: usize,
    pub remote_deleted: usize,
    /// Conflicts detected in this pass, resolved or not, as last saved.
    pub conflicts: Vec<SyncConflict>,
    /// Conflicts left unresolved at the end of the pass.
    pub pending_conflicts: usize,
    /// Changes held back by `sync_direction` or a skipped conflict.
    pub skipped: usize,
    pub errors: Vec<String>,
    pub started_at: OffsetDateTime,
    pub duration: Duration,
}

impl SyncResult {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            status: SyncStatus::NoChanges,
            local_created: 0,
            local_updated: 0,
            local_deleted: 0,
            remote_created: 0,
            remote_updated: 0,
            remote_deleted: 0,
            conflicts: Vec::new(),
            pending_conflicts: 0,
            skipped: 0,
            errors: Vec::new(),
            started_at: OffsetDateTime::now_utc(),
            duration: Duration::ZERO,
        }
    }

    /// A pass that failed before reaching the application phase.
    pub fn failed(provider: Provider, error: impl fmt::Display) -> Self {
        let mut result = Self::new(provider);
        result.errors.push(error.to_string());
        result.status = SyncStatus::Error;
        result
    }

    pub fn items_created(&self) -> usize {
        self.local_created + self.remote_created
    }

    pub fn items_updated(&self) -> usize {
        self.local_updated + self.remote_updated
    }

    pub fn items_deleted(&self) -> usize {
        self.local_deleted + self.remote_deleted
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    pub fn has_changes(&self) -> bool {
        self.items_created() + self.items_updated() + self.items_deleted() > 0
    }

    /// Nothing was left for a later pass.
    pub fn is_clean(&self) -> bool {
        self.status != SyncStatus::Error
            && self.errors.is_empty()
            && self.pending_conflicts == 0
            && self.skipped == 0
    }

    pub fn record_error(&mut self, error: impl fmt::Display) {
        self.errors.push(error.to_string());
    }

    /// Stamps the duration and derives the status from the counters.
    pub fn finish(&mut self, started: std::time::Instant) {
        self.duration = started.elapsed();
        self.status = if self.status == SyncStatus::Error {
            SyncStatus::Error
        } else if !self.errors.is_empty() {
            SyncStatus::Partial
        } else if self.pending_conflicts > 0 {
            SyncStatus::Conflict
        } else if self.has_changes() || !self.conflicts.is_empty() {
            SyncStatus::Success
        } else {
            SyncStatus::NoChanges
        };
    }
}

/// Counters of a finished pass, as kept in the sync history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub provider: Provider,
    pub started_at: OffsetDateTime,
    pub status: SyncStatus,
    pub items_created: usize,
    pub items_updated: usize,
    pub items_deleted: usize,
    pub conflicts: usize,
    pub pending_conflicts: usize,
    pub skipped: usize,
    pub errors: usize,
    pub duration: Duration,
}

impl From<&SyncResult> for SyncSummary {
    fn from(result: &SyncResult) -> Self {
        Self {
            provider: result.provider,
            started_at: result.started_at,
            status: result.status,
            items_created: result.items_created(),
            items_updated: result.items_updated(),
            items_deleted: result.items_deleted(),
            conflicts: result.conflict_count(),
            pending_conflicts: result.pending_conflicts,
            skipped: result.skipped,
            errors: result.errors.len(),
            duration: result.duration,
        }
    }
}
