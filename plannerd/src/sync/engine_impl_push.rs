impl SyncEngine {
    /// Runs up to `limit` due operations. A credential failure stops the batch and leaves
    /// the queue as it was; remote failures are requeued with backoff.
    pub async fn push_queue_worker(&self, limit: u32) -> Result<PushReport, EngineError> {
        self.remotes.credentials.ensure_valid().await?;
        let mut report = PushReport::default();

        for op in self.index.due(limit).await? {
            report.processed += 1;
            let payload = match op.decode_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    log::error!("push: operation {} has a malformed payload: {err}", op.id);
                    self.fail_op(&op, &format!("invalid payload: {err}"), None, &mut report)
                        .await?;
                    continue;
                }
            };
            match self.execute(&op, &payload).await {
                Ok(outcome) => {
                    self.index.remove(op.id).await?;
                    match outcome {
                        OpOutcome::Applied => report.succeeded += 1,
                        OpOutcome::Superseded | OpOutcome::RemoteWon => report.dropped += 1,
                    }
                }
                Err(err) if err.is_credential_failure() => {
                    log::warn!("push: credentials rejected, pausing: {err}");
                    return Err(err);
                }
                Err(EngineError::Remote(err)) if err.is_retryable() => {
                    log::warn!("push: {} for task {} will be retried: {err}", op.kind, op.task_id);
                    self.fail_op(&op, &err.to_string(), err.retry_after_secs(), &mut report)
                        .await?;
                }
                Err(EngineError::Remote(err)) => {
                    log::error!("push: {} for task {} failed: {err}", op.kind, op.task_id);
                    self.fail_op(&op, &err.to_string(), err.retry_after_secs(), &mut report)
                        .await?;
                }
                Err(err) => return Err(err),
            }
        }

        if report.succeeded > 0 {
            self.cursors.mark_push(clock::now_utc()).await?;
        }
        self.flush_metadata(&mut report.warnings).await;
        if report.processed > 0 {
            log::info!(
                "push: processed={} succeeded={} requeued={} dead={} dropped={}",
                report.processed,
                report.succeeded,
                report.requeued,
                report.dead_lettered,
                report.dropped
            );
        }
        Ok(report)
    }

    async fn fail_op(
        &self,
        op: &PendingOp,
        error: &str,
        retry_after: Option<u64>,
        report: &mut PushReport,
    ) -> Result<(), EngineError> {
        let attempts = op.attempts.saturating_add(1);
        let max = self.settings.max_attempts;
        if max > 0 && attempts >= max {
            log::error!(
                "push: {} for task {} dead-lettered after {attempts} attempts: {error}",
                op.kind,
                op.task_id
            );
            self.index.mark_dead(op.id, error).await?;
            report.dead_lettered += 1;
            return Ok(());
        }
        let next = self
            .index
            .requeue_at(
                op.id,
                error,
                clock::now_utc(),
                retry_after.map(std::time::Duration::from_secs),
            )
            .await?;
        log::debug!("push: operation {} retries at {next}", op.id);
        report.requeued += 1;
        Ok(())
    }

    async fn execute(&self, op: &PendingOp, payload: &OpPayload) -> Result<OpOutcome, EngineError> {
        match op.kind {
            PendingOpKind::GcalCreate | PendingOpKind::GcalUpdate => self.push_event(op).await,
            PendingOpKind::GcalDelete => self.push_event_delete(op, payload).await,
            PendingOpKind::GtasksCreate | PendingOpKind::GtasksUpdate => {
                self.push_task(op, payload).await
            }
            PendingOpKind::GtasksDelete => self.push_task_delete(op, payload).await,
        }
    }

    /// Create and update share one path: the current link decides which call is made.
    async fn push_event(&self, op: &PendingOp) -> Result<OpOutcome, EngineError> {
        let Some(task) = self.index.get(op.task_id).await? else {
            return Ok(OpOutcome::Superseded);
        };
        let Some(body) = self.event_body(&task) else {
            return Ok(OpOutcome::Superseded);
        };
        let calendar_id = &self.settings.calendar_id;
        let Some(event_id) = task.gcal_event_id.clone() else {
            return self.insert_event(&task, &body).await;
        };

        match self
            .remotes
            .calendar
            .patch_event(calendar_id, &event_id, &body, task.gcal_etag.as_deref())
            .await
        {
            Ok(event) => {
                self.record_event_link(task.id, &event).await?;
                Ok(OpOutcome::Applied)
            }
            Err(err) if err.classification() == Some(ApiErrorClass::PreconditionFailed) => {
                let remote = self
                    .remotes
                    .calendar
                    .get_event(calendar_id, &event_id)
                    .await?;
                match resolve_conflict(
                    remote_time(remote.updated.as_deref()),
                    remote.etag.as_deref(),
                    task.updated_at,
                ) {
                    ConflictDecision::ApplyRemote => {
                        log::info!(
                            "push: event {event_id} changed remotely after task {}, keeping remote",
                            task.id
                        );
                        self.apply_event(&task, &remote).await?;
                        Ok(OpOutcome::RemoteWon)
                    }
                    ConflictDecision::OverwriteRemote { if_match } => {
                        let event = self
                            .remotes
                            .calendar
                            .patch_event(calendar_id, &event_id, &body, if_match.as_deref())
                            .await?;
                        self.record_event_link(task.id, &event).await?;
                        Ok(OpOutcome::Applied)
                    }
                }
            }
            Err(err) if err.is_not_found() => {
                log::warn!(
                    "push: event {event_id} of task {} is gone, creating a new one",
                    task.id
                );
                self.insert_event(&task, &body).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn insert_event(&self, task: &Task, body: &EventBody) -> Result<OpOutcome, EngineError> {
        let event = self
            .remotes
            .calendar
            .insert_event(&self.settings.calendar_id, body)
            .await?;
        log::info!("push: task {} -> event {}", task.id, event.id);
        self.record_event_link(task.id, &event).await?;
        Ok(OpOutcome::Applied)
    }

    async fn record_event_link(&self, task_id: i64, event: &CalendarEvent) -> Result<(), EngineError> {
        self.index
            .update(
                task_id,
                TaskPatch {
                    gcal_event_id: Some(Some(event.id.clone())),
                    gcal_etag: Some(event.etag.clone()),
                    gcal_updated: Some(remote_time(event.updated.as_deref())),
                    ..TaskPatch::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn push_event_delete(
        &self,
        op: &PendingOp,
        payload: &OpPayload,
    ) -> Result<OpOutcome, EngineError> {
        let task = self.index.get(op.task_id).await?;
        let event_id = payload
            .event_id
            .clone()
            .or_else(|| task.as_ref().and_then(|task| task.gcal_event_id.clone()));
        let Some(event_id) = event_id else {
            return Ok(OpOutcome::Superseded);
        };
        match self
            .remotes
            .calendar
            .delete_event(&self.settings.calendar_id, &event_id)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                log::debug!("push: event {event_id} was already deleted");
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(task) = task
            && task.gcal_event_id.as_deref() == Some(&event_id)
        {
            self.index
                .update(task.id, TaskPatch::clear_calendar_link())
                .await?;
        }
        Ok(OpOutcome::Applied)
    }

    async fn push_task(&self, op: &PendingOp, payload: &OpPayload) -> Result<OpOutcome, EngineError> {
        let Some(task) = self.index.get(op.task_id).await? else {
            return Ok(OpOutcome::Superseded);
        };
        if task.is_scheduled() {
            return Ok(OpOutcome::Superseded);
        }
        let tasklist_id = self.resolve_tasklist().await?;
        let mapping = self.index.get_mapping(task.id).await?;
        let remote_id = mapping
            .as_ref()
            .and_then(|mapping| mapping.gtask_id.clone())
            .or_else(|| task.gtasks_id.clone())
            .or_else(|| payload.gtask_id.clone());
        let body = self.task_body(&task);
        let Some(remote_id) = remote_id else {
            return self.insert_task(&task, &tasklist_id, &body).await;
        };
        let revision = mapping.and_then(|mapping| mapping.revision);

        match self
            .remotes
            .tasks
            .patch_task(&tasklist_id, &remote_id, &body, revision.as_deref())
            .await
        {
            Ok(remote) => {
                self.record_gtask_link(&task, &tasklist_id, &remote).await?;
                Ok(OpOutcome::Applied)
            }
            Err(err) if err.classification() == Some(ApiErrorClass::PreconditionFailed) => {
                let remote = self.remotes.tasks.get_task(&tasklist_id, &remote_id).await?;
                match resolve_conflict(
                    remote_time(remote.updated.as_deref()),
                    remote.etag.as_deref(),
                    task.updated_at,
                ) {
                    ConflictDecision::ApplyRemote => {
                        log::info!(
                            "push: item {remote_id} changed remotely after task {}, keeping remote",
                            task.id
                        );
                        let entry = match &self.metadata {
                            Some(meta) => meta.entry(&remote_id).await,
                            None => None,
                        };
                        let (notes_meta, _) = marker::split_notes(remote.notes.as_deref());
                        self.apply_remote_task(
                            &task,
                            &remote,
                            &tasklist_id,
                            entry.as_ref(),
                            notes_meta.as_ref(),
                        )
                        .await?;
                        Ok(OpOutcome::RemoteWon)
                    }
                    ConflictDecision::OverwriteRemote { if_match } => {
                        let remote = self
                            .remotes
                            .tasks
                            .patch_task(&tasklist_id, &remote_id, &body, if_match.as_deref())
                            .await?;
                        self.record_gtask_link(&task, &tasklist_id, &remote).await?;
                        Ok(OpOutcome::Applied)
                    }
                }
            }
            Err(err) if err.is_not_found() => {
                log::warn!(
                    "push: item {remote_id} of task {} is gone, creating a new one",
                    task.id
                );
                if let Some(meta) = &self.metadata {
                    meta.forget(&remote_id).await;
                }
                self.insert_task(&task, &tasklist_id, &body).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn insert_task(
        &self,
        task: &Task,
        tasklist_id: &str,
        body: &TaskBody,
    ) -> Result<OpOutcome, EngineError> {
        let remote = self.remotes.tasks.insert_task(tasklist_id, body).await?;
        log::info!("push: task {} -> item {}", task.id, remote.id);
        self.record_gtask_link(task, tasklist_id, &remote).await?;
        Ok(OpOutcome::Applied)
    }

    /// Stores the confirmed link. Clears the dirty flag whatever the remote changed.
    async fn record_gtask_link(
        &self,
        task: &Task,
        tasklist_id: &str,
        remote: &RemoteTask,
    ) -> Result<(), EngineError> {
        let updated = self
            .index
            .update(
                task.id,
                TaskPatch {
                    gtasks_id: Some(Some(remote.id.clone())),
                    gtasks_updated: Some(remote_time(remote.updated.as_deref())),
                    ..TaskPatch::default()
                },
            )
            .await?
            .ok_or(IndexError::MissingTask(task.id))?;
        self.index
            .upsert_mapping(
                task.id,
                &remote.id,
                tasklist_id,
                remote.etag.as_deref(),
                clock::now_utc(),
            )
            .await?;
        self.record_entry(&remote.id, &updated, false).await;
        Ok(())
    }

    async fn push_task_delete(
        &self,
        op: &PendingOp,
        payload: &OpPayload,
    ) -> Result<OpOutcome, EngineError> {
        let mapping = self.index.get_mapping(op.task_id).await?;
        let gtask_id = payload
            .gtask_id
            .clone()
            .or_else(|| mapping.as_ref().and_then(|mapping| mapping.gtask_id.clone()));
        let Some(gtask_id) = gtask_id else {
            return Ok(OpOutcome::Superseded);
        };
        let tasklist_id = match payload
            .tasklist_id
            .clone()
            .or_else(|| mapping.as_ref().and_then(|mapping| mapping.tasklist_id.clone()))
        {
            Some(tasklist_id) => tasklist_id,
            None => self.resolve_tasklist().await?,
        };
        match self.remotes.tasks.delete_task(&tasklist_id, &gtask_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                log::debug!("push: item {gtask_id} was already deleted");
            }
            Err(err) => return Err(err.into()),
        }
        if mapping.is_some_and(|mapping| mapping.gtask_id.as_deref() == Some(&gtask_id)) {
            self.index.delete_mapping(op.task_id).await?;
        }
        if let Some(task) = self.index.get(op.task_id).await?
            && task.gtasks_id.as_deref() == Some(&gtask_id)
        {
            self.index
                .update(task.id, TaskPatch::clear_tasks_link())
                .await?;
        }
        if let Some(meta) = &self.metadata {
            meta.forget(&gtask_id).await;
        }
        Ok(OpOutcome::Applied)
    }
}
