impl SyncEngine {
    async fn apply(
        &self,
        action: Action,
        strategy: ConflictStrategy,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let direction = self.settings.sync_direction;
        match action {
            Action::CreateRemote(task) => {
                if hold_back(direction.allows_push(), result) {
                    return Ok(());
                }
                let external_id = self
                    .call("create_item", || self.adapter.create_item(&task))
                    .await?;
                self.record_mapping(&task, &external_id, self.pushed_hash(&task), None)
                    .await?;
                result.remote_created += 1;
            }
            Action::CreateLocal(item) => {
                if hold_back(direction.allows_pull(), result) {
                    return Ok(());
                }
                let mut task = self.adapter.map_from_external(&item);
                task.id = self.allocate_local_id().await?;
                if let Some(taken) = self.mappings.get_mapping(self.provider, task.id).await?
                    && taken.external_id != item.external_id
                {
                    return Err(SyncError::LocalIdTaken {
                        provider: self.provider,
                        local_id: task.id,
                        external_id: taken.external_id,
                    });
                }
                task.modified = item.modified.unwrap_or_else(OffsetDateTime::now_utc);
                self.tasks.save_todo(&task)?;
                self.record_mapping(&task, &item.external_id, self.remote_hash(&item), None)
                    .await?;
                result.local_created += 1;
            }
            Action::PushUpdate { task, mapping } => {
                if hold_back(direction.allows_push(), result) {
                    return Ok(());
                }
                let updated = self
                    .call("update_item", || {
                        self.adapter.update_item(&mapping.external_id, &task)
                    })
                    .await?;
                if updated {
                    self.record_mapping(
                        &task,
                        &mapping.external_id,
                        self.pushed_hash(&task),
                        Some(&mapping),
                    )
                    .await?;
                    result.remote_updated += 1;
                } else {
                    // Deleted remotely after discovery.
                    let conflict = self.detect(
                        ConflictType::RemoteDeletedLocalModified,
                        &mapping,
                        Some(task),
                        None,
                    );
                    self.handle_conflict(conflict, &mapping, strategy, result)
                        .await?;
                }
            }
            Action::PullUpdate {
                task,
                item,
                mapping,
            } => {
                if hold_back(direction.allows_pull(), result) {
                    return Ok(());
                }
                self.pull_into(task, &item, &mapping).await?;
                result.local_updated += 1;
            }
            Action::DeleteLocal(mapping) => {
                if hold_back(direction.allows_pull(), result) {
                    return Ok(());
                }
                self.tasks.delete_todo(mapping.local_id)?;
                self.mappings
                    .delete_mapping(self.provider, mapping.local_id)
                    .await?;
                result.local_deleted += 1;
            }
            Action::DeleteRemote(mapping) => {
                if hold_back(direction.allows_push(), result) {
                    return Ok(());
                }
                self.call("delete_item", || {
                    self.adapter.delete_item(&mapping.external_id)
                })
                .await?;
                self.mappings
                    .delete_mapping(self.provider, mapping.local_id)
                    .await?;
                result.remote_deleted += 1;
            }
            Action::DropMapping(mapping) => {
                let conflict = self.detect(ConflictType::BothDeleted, &mapping, None, None);
                self.handle_conflict(conflict, &mapping, strategy, result)
                    .await?;
            }
            Action::Refresh {
                task,
                mapping,
                remote_hash,
            } => {
                self.record_mapping(&task, &mapping.external_id, remote_hash, Some(&mapping))
                    .await?;
            }
            Action::Conflict { conflict, mapping } => {
                self.handle_conflict(conflict, &mapping, strategy, result)
                    .await?;
            }
        }
        Ok(())
    }

    /// Copies the remote fields of `item` onto `task` and saves it.
    async fn pull_into(
        &self,
        mut task: Task,
        item: &ExternalItem,
        mapping: &SyncMapping,
    ) -> Result<(), SyncError> {
        let remote = self.adapter.map_from_external(item);
        task.apply_fields(&remote.sync_fields());
        task.modified = item.modified.unwrap_or_else(OffsetDateTime::now_utc);
        self.tasks.save_todo(&task)?;
        self.record_mapping(&task, &item.external_id, self.remote_hash(item), Some(mapping))
            .await
    }

    /// Pushes `task`, creating a fresh remote item if the mapped one is gone.
    async fn push_or_recreate(&self, task: &Task, mapping: &SyncMapping) -> Result<(), SyncError> {
        let updated = self
            .call("update_item", || {
                self.adapter.update_item(&mapping.external_id, task)
            })
            .await?;
        let external_id = if updated {
            mapping.external_id.clone()
        } else {
            self.call("create_item", || self.adapter.create_item(task))
                .await?
        };
        self.record_mapping(task, &external_id, self.pushed_hash(task), Some(mapping))
            .await
    }

    /// Resolves `conflict` under `strategy` and applies the outcome. The
    /// conflict is always persisted, resolved or pending.
    async fn handle_conflict(
        &self,
        conflict: SyncConflict,
        mapping: &SyncMapping,
        strategy: ConflictStrategy,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let resolution = match resolve(&conflict, strategy) {
            Ok(resolution) => resolution,
            Err(err) => {
                self.keep_pending(conflict, Some(err.to_string()), result)
                    .await?;
                return Err(err);
            }
        };
        if resolution.is_pending() {
            return self.keep_pending(conflict, None, result).await;
        }

        match self
            .apply_outcome(&conflict, mapping, strategy, &resolution.outcome, result)
            .await
        {
            Ok(true) => {
                tracing::info!(
                    provider = %self.provider,
                    task = conflict.local_id,
                    kind = %conflict.conflict_type,
                    strategy = %strategy,
                    outcome = resolution.outcome.describe(),
                    "conflict resolved"
                );
                let closed = SyncConflict {
                    resolved: true,
                    strategy: Some(strategy),
                    resolved_at: Some(OffsetDateTime::now_utc()),
                    last_error: None,
                    ..conflict
                };
                self.persist_conflict(closed, result).await?;
                Ok(())
            }
            Ok(false) => {
                result.skipped += 1;
                let note = SyncError::DirectionBlocked(self.settings.sync_direction.as_str());
                self.keep_pending(conflict, Some(note.to_string()), result)
                    .await
            }
            Err(err) => {
                self.keep_pending(conflict, Some(err.to_string()), result)
                    .await?;
                Err(err)
            }
        }
    }

    async fn keep_pending(
        &self,
        mut conflict: SyncConflict,
        note: Option<String>,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        result.pending_conflicts += 1;
        conflict.last_error = note;
        let (local_id, kind) = (conflict.local_id, conflict.conflict_type);
        let id = self.persist_conflict(conflict, result).await?;
        tracing::info!(
            provider = %self.provider,
            conflict = id,
            task = local_id,
            kind = %kind,
            "conflict left pending"
        );
        Ok(())
    }

    /// Saves `conflict` and lists it in `result`, with its id when the save
    /// went through.
    async fn persist_conflict(
        &self,
        mut conflict: SyncConflict,
        result: &mut SyncResult,
    ) -> Result<i64, SyncError> {
        let saved = self.mappings.save_conflict(&conflict).await;
        if let Ok(id) = saved {
            conflict.id = Some(id);
        }
        result.conflicts.push(conflict);
        Ok(saved?)
    }

    /// Writes the winning side. Returns false when `sync_direction` forbids
    /// the writes the outcome needs; nothing is changed in that case.
    async fn apply_outcome(
        &self,
        conflict: &SyncConflict,
        mapping: &SyncMapping,
        strategy: ConflictStrategy,
        outcome: &Outcome,
        result: &mut SyncResult,
    ) -> Result<bool, SyncError> {
        let direction = self.settings.sync_direction;
        let local = || {
            conflict
                .local
                .as_ref()
                .ok_or(SyncError::IncompleteConflict("local"))
        };
        let remote_item = || {
            conflict
                .remote_item
                .as_ref()
                .ok_or(SyncError::IncompleteConflict("remote item"))
        };

        match (conflict.conflict_type, outcome) {
            (ConflictType::BothDeleted, _) => {
                self.mappings
                    .delete_mapping(self.provider, mapping.local_id)
                    .await?;
            }
            // Both sides stay as they are and the next pass sees the
            // conflict again.
            (_, Outcome::Skipped) => result.skipped += 1,
            (ConflictType::UpdateConflict, Outcome::KeepLocal) => {
                if !direction.allows_push() {
                    return Ok(false);
                }
                self.push_or_recreate(local()?, mapping).await?;
                result.remote_updated += 1;
            }
            (ConflictType::UpdateConflict, Outcome::KeepRemote) => {
                if !direction.allows_pull() {
                    return Ok(false);
                }
                self.pull_into(local()?.clone(), remote_item()?, mapping)
                    .await?;
                result.local_updated += 1;
            }
            (ConflictType::UpdateConflict, Outcome::Merged(fields)) => {
                if !(direction.allows_push() && direction.allows_pull()) {
                    return Ok(false);
                }
                let mut task = local()?.clone();
                task.apply_fields(fields);
                task.modified = OffsetDateTime::now_utc();
                self.tasks.save_todo(&task)?;
                result.local_updated += 1;
                self.push_or_recreate(&task, mapping).await?;
                result.remote_updated += 1;
            }
            (ConflictType::RemoteDeletedLocalModified, Outcome::KeepLocal) => {
                if !direction.allows_push() {
                    return Ok(false);
                }
                let task = local()?;
                let external_id = self
                    .call("create_item", || self.adapter.create_item(task))
                    .await?;
                self.record_mapping(task, &external_id, self.pushed_hash(task), Some(mapping))
                    .await?;
                result.remote_created += 1;
            }
            (ConflictType::RemoteDeletedLocalModified, Outcome::KeepRemote) => {
                if !direction.allows_pull() {
                    return Ok(false);
                }
                self.tasks.delete_todo(conflict.local_id)?;
                self.mappings
                    .delete_mapping(self.provider, mapping.local_id)
                    .await?;
                result.local_deleted += 1;
            }
            (ConflictType::LocalDeletedRemoteModified, Outcome::KeepLocal) => {
                if !direction.allows_push() {
                    return Ok(false);
                }
                self.call("delete_item", || {
                    self.adapter.delete_item(&mapping.external_id)
                })
                .await?;
                self.mappings
                    .delete_mapping(self.provider, mapping.local_id)
                    .await?;
                result.remote_deleted += 1;
            }
            (ConflictType::LocalDeletedRemoteModified, Outcome::KeepRemote) => {
                if !direction.allows_pull() {
                    return Ok(false);
                }
                let item = remote_item()?;
                let mut task = self.adapter.map_from_external(item);
                task.id = conflict.local_id;
                task.modified = item.modified.unwrap_or_else(OffsetDateTime::now_utc);
                self.tasks.save_todo(&task)?;
                self.record_mapping(&task, &item.external_id, self.remote_hash(item), Some(mapping))
                    .await?;
                result.local_created += 1;
            }
            (conflict_type, _) => {
                return Err(SyncError::ConflictStrategyMismatch {
                    strategy,
                    conflict_type,
                });
            }
        }
        Ok(true)
    }
}

/// Counts a change `sync_direction` does not allow. Returns true when the
/// change must be skipped.
fn hold_back(allowed: bool, result: &mut SyncResult) -> bool {
    if !allowed {
        result.skipped += 1;
    }
    !allowed
}
