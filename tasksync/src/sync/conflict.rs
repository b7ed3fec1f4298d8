use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::SyncError;
use crate::model::{ExternalItem, Provider, SyncField, SyncFields, Task, TaskId, UnknownVariant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    #[default]
    NewestWins,
    Merge,
    Manual,
    Skip,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 6] = [
        ConflictStrategy::LocalWins,
        ConflictStrategy::RemoteWins,
        ConflictStrategy::NewestWins,
        ConflictStrategy::Merge,
        ConflictStrategy::Manual,
        ConflictStrategy::Skip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::RemoteWins => "remote_wins",
            ConflictStrategy::NewestWins => "newest_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
            ConflictStrategy::Skip => "skip",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownVariant> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == value)
            .ok_or_else(|| UnknownVariant {
                kind: "conflict strategy",
                value: value.to_string(),
            })
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictType {
    UpdateConflict,
    RemoteDeletedLocalModified,
    LocalDeletedRemoteModified,
    BothDeleted,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::UpdateConflict => "update_conflict",
            ConflictType::RemoteDeletedLocalModified => "remote_deleted_local_modified",
            ConflictType::LocalDeletedRemoteModified => "local_deleted_remote_modified",
            ConflictType::BothDeleted => "both_deleted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownVariant> {
        match value {
            "update_conflict" => Ok(ConflictType::UpdateConflict),
            "remote_deleted_local_modified" => Ok(ConflictType::RemoteDeletedLocalModified),
            "local_deleted_remote_modified" => Ok(ConflictType::LocalDeletedRemoteModified),
            "both_deleted" => Ok(ConflictType::BothDeleted),
            other => Err(UnknownVariant {
                kind: "conflict type",
                value: other.to_string(),
            }),
        }
    }

    /// One side deleted the task while the other changed it.
    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            ConflictType::RemoteDeletedLocalModified | ConflictType::LocalDeletedRemoteModified
        )
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both sides of one task changed incompatibly since their last sync.
///
/// `local` and `remote` are the two versions at detection time; a deleted
/// side is `None`. `remote_item` keeps the provider payload so a conflict
/// can be resolved later without refetching.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    pub id: Option<i64>,
    pub provider: Provider,
    pub local_id: TaskId,
    pub external_id: Option<String>,
    pub conflict_type: ConflictType,
    pub local: Option<Task>,
    pub remote: Option<Task>,
    pub remote_item: Option<ExternalItem>,
    pub baseline: Option<SyncFields>,
    pub detected_at: OffsetDateTime,
    pub resolved: bool,
    pub strategy: Option<ConflictStrategy>,
    pub resolved_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl SyncConflict {
    pub fn new(provider: Provider, local_id: TaskId, conflict_type: ConflictType) -> Self {
        Self {
            id: None,
            provider,
            local_id,
            external_id: None,
            conflict_type,
            local: None,
            remote: None,
            remote_item: None,
            baseline: None,
            detected_at: OffsetDateTime::now_utc(),
            resolved: false,
            strategy: None,
            resolved_at: None,
            last_error: None,
        }
    }

    pub fn title(&self) -> &str {
        self.local
            .as_ref()
            .or(self.remote.as_ref())
            .map_or("", |task| task.text.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    KeepLocal,
    KeepRemote,
    /// Fields to write to both sides.
    Merged(SyncFields),
    /// Left for the user.
    Pending,
    /// Marked resolved without touching either side.
    Skipped,
}

impl Outcome {
    pub fn describe(&self) -> &'static str {
        match self {
            Outcome::KeepLocal => "kept local version",
            Outcome::KeepRemote => "kept remote version",
            Outcome::Merged(_) => "merged both versions",
            Outcome::Pending => "pending manual resolution",
            Outcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub strategy: ConflictStrategy,
    pub outcome: Outcome,
}

impl Resolution {
    pub fn is_pending(&self) -> bool {
        self.outcome == Outcome::Pending
    }
}

/// Decides how `conflict` is settled under `strategy`. Pure: applying the
/// outcome is up to the caller.
pub fn resolve(
    conflict: &SyncConflict,
    strategy: ConflictStrategy,
) -> Result<Resolution, SyncError> {
    let outcome = match conflict.conflict_type {
        ConflictType::BothDeleted => Outcome::Skipped,
        kind if kind.is_deletion() => match strategy {
            ConflictStrategy::LocalWins => Outcome::KeepLocal,
            ConflictStrategy::RemoteWins => Outcome::KeepRemote,
            ConflictStrategy::Manual => Outcome::Pending,
            _ => {
                return Err(SyncError::ConflictStrategyMismatch {
                    strategy,
                    conflict_type: kind,
                });
            }
        },
        _ => match strategy {
            ConflictStrategy::LocalWins => Outcome::KeepLocal,
            ConflictStrategy::RemoteWins => Outcome::KeepRemote,
            ConflictStrategy::Manual => Outcome::Pending,
            ConflictStrategy::Skip => Outcome::Skipped,
            ConflictStrategy::NewestWins => {
                let (local, remote) = both_sides(conflict)?;
                newest(local, remote)
            }
            ConflictStrategy::Merge => {
                let (local, remote) = both_sides(conflict)?;
                match &conflict.baseline {
                    Some(baseline) => Outcome::Merged(merge(baseline, local, remote)),
                    None => newest(local, remote),
                }
            }
        },
    };
    Ok(Resolution { strategy, outcome })
}

fn both_sides(conflict: &SyncConflict) -> Result<(&Task, &Task), SyncError> {
    let local = conflict
        .local
        .as_ref()
        .ok_or(SyncError::IncompleteConflict("local"))?;
    let remote = conflict
        .remote
        .as_ref()
        .ok_or(SyncError::IncompleteConflict("remote"))?;
    Ok((local, remote))
}

/// Equal timestamps keep the local version.
fn newest(local: &Task, remote: &Task) -> Outcome {
    if remote.modified > local.modified {
        Outcome::KeepRemote
    } else {
        Outcome::KeepLocal
    }
}

fn merge(baseline: &SyncFields, local: &Task, remote: &Task) -> SyncFields {
    let remote_is_newer = remote.modified > local.modified;
    let theirs = remote.sync_fields();
    let mut merged = local.sync_fields();
    for field in SyncField::ALL {
        let local_changed = !merged.same_field(baseline, field);
        let remote_changed = !theirs.same_field(baseline, field);
        let take_remote = match (local_changed, remote_changed) {
            (false, true) => true,
            (true, true) => remote_is_newer && !merged.same_field(&theirs, field),
            _ => false,
        };
        if take_remote {
            merged.copy_field(&theirs, field);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use time::macros::datetime;

    fn task(text: &str, modified: OffsetDateTime) -> Task {
        let mut task = Task::new(1, text);
        task.modified = modified;
        task
    }

    fn update_conflict(local: Task, remote: Task, baseline: Option<SyncFields>) -> SyncConflict {
        SyncConflict {
            local: Some(local),
            remote: Some(remote),
            baseline,
            external_id: Some("r1".into()),
            ..SyncConflict::new(Provider::Todoist, 1, ConflictType::UpdateConflict)
        }
    }

    #[test]
    fn strategy_names_round_trip() {
        for strategy in ConflictStrategy::ALL {
            assert_eq!(ConflictStrategy::parse(strategy.as_str()), Ok(strategy));
        }
        assert!(ConflictStrategy::parse("coin_flip").is_err());
    }

    #[test]
    fn newest_wins_prefers_later_side_and_local_on_tie() {
        let early = datetime!(2024-05-01 08:00 UTC);
        let late = datetime!(2024-05-01 09:00 UTC);

        let remote_newer = update_conflict(task("a", early), task("b", late), None);
        let tie = update_conflict(task("a", early), task("b", early), None);

        assert_eq!(
            resolve(&remote_newer, ConflictStrategy::NewestWins)
                .unwrap()
                .outcome,
            Outcome::KeepRemote
        );
        assert_eq!(
            resolve(&tie, ConflictStrategy::NewestWins).unwrap().outcome,
            Outcome::KeepLocal
        );
    }

    #[test]
    fn merge_takes_each_side_for_the_field_it_changed() {
        let base = task("Buy milk", datetime!(2024-05-01 08:00 UTC));
        let mut local = base.clone();
        local.priority = Priority::High;
        local.modified = datetime!(2024-05-01 10:00 UTC);
        let mut remote = base.clone();
        remote.tags = vec!["errand".into()];
        remote.modified = datetime!(2024-05-01 09:00 UTC);

        let conflict = update_conflict(local, remote, Some(base.sync_fields()));
        let Outcome::Merged(fields) = resolve(&conflict, ConflictStrategy::Merge).unwrap().outcome
        else {
            panic!("expected a merge");
        };

        assert_eq!(fields.priority, Priority::High);
        assert!(fields.tags.contains("errand"));
        assert_eq!(fields.text, "Buy milk");
    }

    #[test]
    fn merge_uses_newest_side_for_a_field_both_changed() {
        let base = task("Buy milk", datetime!(2024-05-01 08:00 UTC));
        let mut local = base.clone();
        local.text = "Buy oat milk".into();
        local.completed = true;
        local.modified = datetime!(2024-05-01 09:00 UTC);
        let mut remote = base.clone();
        remote.text = "Buy soy milk".into();
        remote.modified = datetime!(2024-05-01 10:00 UTC);

        let conflict = update_conflict(local, remote, Some(base.sync_fields()));
        let Outcome::Merged(fields) = resolve(&conflict, ConflictStrategy::Merge).unwrap().outcome
        else {
            panic!("expected a merge");
        };

        assert_eq!(fields.text, "Buy soy milk");
        assert!(fields.completed);
    }

    #[test]
    fn merge_without_baseline_falls_back_to_newest() {
        let conflict = update_conflict(
            task("a", datetime!(2024-05-01 10:00 UTC)),
            task("b", datetime!(2024-05-01 09:00 UTC)),
            None,
        );
        assert_eq!(
            resolve(&conflict, ConflictStrategy::Merge).unwrap().outcome,
            Outcome::KeepLocal
        );
    }

    #[test]
    fn manual_stays_pending_and_skip_changes_nothing() {
        let now = datetime!(2024-05-01 08:00 UTC);
        let conflict = update_conflict(task("a", now), task("b", now), None);

        assert!(
            resolve(&conflict, ConflictStrategy::Manual)
                .unwrap()
                .is_pending()
        );
        assert_eq!(
            resolve(&conflict, ConflictStrategy::Skip).unwrap().outcome,
            Outcome::Skipped
        );
    }

    #[test]
    fn deletion_conflicts_reject_merge_and_newest() {
        let conflict = SyncConflict {
            local: Some(task("edited", datetime!(2024-05-01 08:00 UTC))),
            ..SyncConflict::new(
                Provider::Todoist,
                1,
                ConflictType::RemoteDeletedLocalModified,
            )
        };

        for strategy in [
            ConflictStrategy::Merge,
            ConflictStrategy::NewestWins,
            ConflictStrategy::Skip,
        ] {
            assert!(matches!(
                resolve(&conflict, strategy),
                Err(SyncError::ConflictStrategyMismatch { .. })
            ));
        }
        assert_eq!(
            resolve(&conflict, ConflictStrategy::LocalWins)
                .unwrap()
                .outcome,
            Outcome::KeepLocal
        );
        assert_eq!(
            resolve(&conflict, ConflictStrategy::RemoteWins)
                .unwrap()
                .outcome,
            Outcome::KeepRemote
        );
        assert!(
            resolve(&conflict, ConflictStrategy::Manual)
                .unwrap()
                .is_pending()
        );
    }

    #[test]
    fn newest_wins_needs_both_sides() {
        let conflict = SyncConflict {
            local: Some(task("a", datetime!(2024-05-01 08:00 UTC))),
            ..SyncConflict::new(Provider::Todoist, 1, ConflictType::UpdateConflict)
        };
        assert!(matches!(
            resolve(&conflict, ConflictStrategy::NewestWins),
            Err(SyncError::IncompleteConflict("remote"))
        ));
    }
}
