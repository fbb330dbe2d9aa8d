impl SyncEngine {
    /// Pulls the planner tasklist changed since the stored watermark.
    pub async fn pull_tasks(&self) -> Result<PullReport, EngineError> {
        self.remotes.credentials.ensure_valid().await?;
        let started = clock::now_utc();
        let mut report = PullReport::default();

        if let Some(meta) = &self.metadata
            && let Err(err) = meta.refresh().await
        {
            log::warn!("pull tasks: {err}");
            report.warnings.push(SyncWarning::MetadataUnavailable {
                error: err.to_string(),
            });
        }
        let tasklist_id = self.resolve_tasklist().await?;
        let watermark = self.cursors.get(Backend::Tasks).await?;
        report.full_resync = watermark.is_none();

        let mut page_token: Option<String> = None;
        loop {
            let query = TaskQuery {
                updated_min: watermark.clone(),
                page_token: page_token.clone(),
                show_completed: true,
                show_deleted: true,
                show_hidden: true,
                max_results: Some(TASKS_PAGE_SIZE),
            };
            let page = self.remotes.tasks.list_tasks(&tasklist_id, &query).await?;
            for item in &page.items {
                self.merge_remote_task(&tasklist_id, item, &mut report)
                    .await?;
            }
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        self.cursors
            .set(Backend::Tasks, &clock::format_rfc3339(started))
            .await?;
        self.cursors.mark_pull(Backend::Tasks, started).await?;
        self.flush_metadata(&mut report.warnings).await;
        if report.mutations() > 0
            && let Some(meta) = &self.metadata
        {
            let tasklist = tasklist_id.clone();
            if let Err(err) = meta
                .update_config(move |config| {
                    config.tasklist_id = Some(tasklist.clone());
                    config.last_full_sync = Some(started);
                })
                .await
            {
                log::warn!("pull tasks: {err}");
                report.warnings.push(SyncWarning::ConfigWriteFailed {
                    error: err.to_string(),
                });
            }
        }
        log::info!(
            "pull tasks: created={} updated={} unlinked={} deferred={} skipped={}",
            report.created,
            report.updated,
            report.unlinked,
            report.deferred,
            report.skipped
        );
        Ok(report)
    }

    /// Local task for a remote item: mapping table first, then the task id recorded in
    /// the metadata index or the legacy notes prefix, then the id stored on the row.
    async fn find_remote_task(
        &self,
        item: &RemoteTask,
        entry: Option<&MetadataEntry>,
        notes_meta: Option<&NotesMetadata>,
    ) -> Result<Option<Task>, EngineError> {
        if let Some(mapping) = self.index.get_mapping_by_remote(&item.id).await?
            && let Some(task) = self.index.get(mapping.task_id).await?
        {
            return Ok(Some(task));
        }
        let hinted = [
            entry
                .filter(|entry| self.is_own_device(Some(&entry.device_id)))
                .map(|entry| entry.task_id),
            notes_meta
                .filter(|meta| self.is_own_device(meta.device_id.as_deref()))
                .and_then(|meta| meta.task_id),
        ];
        for task_id in hinted.into_iter().flatten() {
            if let Some(task) = self.index.get(task_id).await?
                && task.gtasks_id.as_deref().is_none_or(|linked| linked == item.id)
            {
                return Ok(Some(task));
            }
        }
        Ok(self.index.find_by_gtasks_id(&item.id).await?)
    }

    /// Local task ids are only meaningful on the device that wrote them.
    fn is_own_device(&self, device_id: Option<&str>) -> bool {
        match device_id {
            None | Some("") => true,
            Some(device_id) => device_id == self.device_id,
        }
    }

    async fn merge_remote_task(
        &self,
        tasklist_id: &str,
        item: &RemoteTask,
        report: &mut PullReport,
    ) -> Result<(), EngineError> {
        if item.is_subtask() {
            report.skipped += 1;
            return Ok(());
        }
        let (notes_meta, body) = marker::split_notes(item.notes.as_deref());
        let entry = match &self.metadata {
            Some(meta) => meta.entry(&item.id).await,
            None => None,
        };
        let task = self
            .find_remote_task(item, entry.as_ref(), notes_meta.as_ref())
            .await?;

        if let Some(task) = &task
            && task.is_scheduled()
        {
            report.skipped += 1;
            return Ok(());
        }

        if item.is_deleted() {
            let unlinked = match &task {
                Some(task) => self.unlink_deleted_item(task, &item.id).await?,
                None => false,
            };
            if let Some(meta) = &self.metadata {
                meta.forget(&item.id).await;
            }
            if unlinked {
                report.unlinked += 1;
            } else {
                report.skipped += 1;
            }
            return Ok(());
        }

        let priority_hint = entry
            .as_ref()
            .map(|entry| entry.priority)
            .or(notes_meta.as_ref().and_then(|meta| meta.priority));
        let status_hint = entry
            .as_ref()
            .map(|entry| entry.status.clone())
            .or(notes_meta.as_ref().and_then(|meta| meta.status.clone()));
        let remote_updated = remote_time(item.updated.as_deref());

        let Some(task) = task else {
            let task = self
                .index
                .add(NewTask {
                    title: item.title.clone().unwrap_or_default(),
                    notes: non_empty(body),
                    priority: priority_hint.unwrap_or_default(),
                    status: status_from_remote(item, status_hint.as_deref(), None),
                    gtasks_id: Some(item.id.clone()),
                    gtasks_updated: remote_updated,
                    updated_at: remote_updated,
                    ..NewTask::default()
                })
                .await?;
            self.index
                .upsert_mapping(
                    task.id,
                    &item.id,
                    tasklist_id,
                    item.etag.as_deref(),
                    clock::now_utc(),
                )
                .await?;
            self.record_entry(&item.id, &task, true).await;
            log::info!("pull tasks: item {} -> new task {}", item.id, task.id);
            report.created += 1;
            return Ok(());
        };

        if self
            .index
            .get_mapping(task.id)
            .await?
            .is_some_and(|mapping| mapping.dirty)
        {
            log::debug!("pull tasks: task {} has unpushed changes", task.id);
            report.skipped += 1;
            return Ok(());
        }

        match decide_pull(remote_updated, task.gtasks_updated, task.updated_at) {
            PullDecision::Skip => report.skipped += 1,
            PullDecision::ApplyRemote => {
                self.apply_remote_task(&task, item, tasklist_id, entry.as_ref(), notes_meta.as_ref())
                    .await?;
                report.updated += 1;
            }
            PullDecision::KeepLocal => {
                self.index
                    .update(
                        task.id,
                        TaskPatch {
                            gtasks_id: Some(Some(item.id.clone())),
                            gtasks_updated: Some(remote_updated),
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                self.index
                    .upsert_mapping(
                        task.id,
                        &item.id,
                        tasklist_id,
                        item.etag.as_deref(),
                        clock::now_utc(),
                    )
                    .await?;
                self.index.mark_dirty(task.id).await?;
                self.index
                    .enqueue(
                        PendingOpKind::GtasksUpdate,
                        task.id,
                        &OpPayload::gtask(Some(&item.id), Some(tasklist_id)),
                    )
                    .await?;
                log::debug!(
                    "pull tasks: task {} is newer than item {}, push queued",
                    task.id,
                    item.id
                );
                report.deferred += 1;
            }
        }
        Ok(())
    }

    /// Overwrites local fields with the remote item and records the link.
    async fn apply_remote_task(
        &self,
        task: &Task,
        item: &RemoteTask,
        tasklist_id: &str,
        entry: Option<&MetadataEntry>,
        notes_meta: Option<&NotesMetadata>,
    ) -> Result<Task, EngineError> {
        let (_, body) = marker::split_notes(item.notes.as_deref());
        let priority = entry
            .map(|entry| entry.priority)
            .or(notes_meta.and_then(|meta| meta.priority));
        let status_hint = entry
            .map(|entry| entry.status.clone())
            .or(notes_meta.and_then(|meta| meta.status.clone()));
        let remote_updated = remote_time(item.updated.as_deref());
        let patch = TaskPatch {
            title: Some(
                item.title
                    .clone()
                    .and_then(non_empty)
                    .unwrap_or_else(|| task.title.clone()),
            ),
            notes: Some(non_empty(body)),
            priority,
            status: Some(status_from_remote(
                item,
                status_hint.as_deref(),
                Some(task.status),
            )),
            gtasks_id: Some(Some(item.id.clone())),
            gtasks_updated: Some(remote_updated),
            updated_at: remote_updated,
            ..TaskPatch::default()
        };
        let updated = self
            .index
            .update(task.id, patch)
            .await?
            .ok_or(IndexError::MissingTask(task.id))?;
        self.index
            .upsert_mapping(
                task.id,
                &item.id,
                tasklist_id,
                item.etag.as_deref(),
                clock::now_utc(),
            )
            .await?;
        self.detach_calendar_link(&updated).await?;
        self.record_entry(&item.id, &updated, true).await;
        Ok(updated)
    }

    /// The remote item is gone: drop the link, keep the task.
    async fn unlink_deleted_item(&self, task: &Task, gtask_id: &str) -> Result<bool, EngineError> {
        let mut changed = false;
        if self
            .index
            .get_mapping(task.id)
            .await?
            .is_some_and(|mapping| mapping.gtask_id.as_deref() == Some(gtask_id))
        {
            self.index.delete_mapping(task.id).await?;
            changed = true;
        }
        if task.gtasks_id.as_deref() == Some(gtask_id) {
            self.index
                .update(task.id, TaskPatch::clear_tasks_link())
                .await?;
            changed = true;
        }
        if changed {
            log::info!(
                "pull tasks: item {gtask_id} deleted remotely, task {} unlinked",
                task.id
            );
        }
        Ok(changed)
    }

    fn task_body(&self, task: &Task) -> TaskBody {
        let notes = if self.settings.notes_metadata {
            let meta = NotesMetadata {
                device_id: Some(self.device_id.clone()),
                priority: Some(task.priority),
                status: Some(task.status.as_str().to_string()),
                task_id: Some(task.id),
                updated_at: Some(clock::format_rfc3339(task.updated_at)),
            };
            Some(marker::compose_notes(
                &meta,
                task.notes.as_deref().unwrap_or_default(),
            ))
        } else {
            task.notes.clone()
        };
        let done = task.status == TaskStatus::Done;
        TaskBody {
            title: Some(task.title.clone()),
            notes: Some(notes),
            status: Some(if done { "completed" } else { "needsAction" }.to_string()),
            completed: Some(done.then(|| clock::format_rfc3339(task.updated_at))),
        }
    }
}

/// Completion comes from the remote status. Anything else keeps the planner-only
/// `doing` state that the tasks backend cannot express.
fn status_from_remote(
    item: &RemoteTask,
    hint: Option<&str>,
    current: Option<TaskStatus>,
) -> TaskStatus {
    if item.is_completed() {
        return TaskStatus::Done;
    }
    match hint.map(TaskStatus::normalize) {
        Some(status) if status != TaskStatus::Done => status,
        _ if current == Some(TaskStatus::Doing) => TaskStatus::Doing,
        _ => TaskStatus::Todo,
    }
}
