impl SyncEngine {
    /// Incremental calendar pull. An expired sync token triggers exactly one bounded
    /// full resync.
    pub async fn pull_calendar(&self) -> Result<PullReport, EngineError> {
        self.remotes.credentials.ensure_valid().await?;
        match self.pull_calendar_pass().await {
            Err(EngineError::CursorExpired) => {
                log::warn!(
                    "pull calendar: sync token expired, resyncing the last {} days",
                    self.settings.lookback_days
                );
                self.cursors.clear(Backend::Calendar).await?;
                match self.pull_calendar_pass().await {
                    Err(EngineError::CursorExpired) => Err(EngineError::CursorExpiredAfterResync),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn pull_calendar_pass(&self) -> Result<PullReport, EngineError> {
        let started = clock::now_utc();
        let token = self.cursors.get(Backend::Calendar).await?;
        let time_min = token.is_none().then(|| {
            let since = clock::days_before(started, self.settings.lookback_days)
                .or_else(|| clock::days_before(started, SyncSettings::default().lookback_days))
                .unwrap_or(started);
            clock::format_rfc3339(since)
        });
        let mut report = PullReport {
            full_resync: token.is_none(),
            ..PullReport::default()
        };

        let mut page_token: Option<String> = None;
        let mut next_sync_token: Option<String> = None;
        loop {
            let query = EventQuery {
                time_min: time_min.clone(),
                sync_token: token.clone(),
                page_token: page_token.clone(),
                show_deleted: true,
                max_results: Some(CALENDAR_PAGE_SIZE),
            };
            let page = match self
                .remotes
                .calendar
                .list_events(&self.settings.calendar_id, &query)
                .await
            {
                Ok(page) => page,
                Err(err) if err.classification() == Some(ApiErrorClass::Gone) => {
                    return Err(EngineError::CursorExpired);
                }
                Err(err) => return Err(err.into()),
            };
            for event in &page.items {
                self.merge_event(event, &mut report).await?;
            }
            if page.next_sync_token.is_some() {
                next_sync_token = page.next_sync_token;
            }
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        // Cursor moves only once every page has been merged.
        if let Some(next) = next_sync_token {
            self.cursors.set(Backend::Calendar, &next).await?;
        }
        self.cursors.mark_pull(Backend::Calendar, started).await?;
        log::info!(
            "pull calendar: created={} updated={} unlinked={} deferred={} skipped={}",
            report.created,
            report.updated,
            report.unlinked,
            report.deferred,
            report.skipped
        );
        Ok(report)
    }

    async fn find_event_task(&self, event: &CalendarEvent) -> Result<EventLookup, EngineError> {
        if let Some(task_id) = event.description.as_deref().and_then(marker::find_marker)
            && let Some(task) = self.index.get(task_id).await?
        {
            let owns_event = match task.gcal_event_id.as_deref() {
                Some(linked) => linked == event.id,
                // A push that crashed before recording its link.
                None => task.is_scheduled(),
            };
            if owns_event {
                return Ok(EventLookup::Found(task));
            }
            if self.index.find_by_event_id(&event.id).await?.is_none() {
                log::debug!(
                    "pull calendar: event {} carries the marker of task {} linked elsewhere",
                    event.id,
                    task.id
                );
                return Ok(EventLookup::Ignored);
            }
        }
        Ok(match self.index.find_by_event_id(&event.id).await? {
            Some(task) => EventLookup::Found(task),
            None => EventLookup::NotFound,
        })
    }

    async fn merge_event(
        &self,
        event: &CalendarEvent,
        report: &mut PullReport,
    ) -> Result<(), EngineError> {
        let lookup = self.find_event_task(event).await?;

        if event.is_cancelled() {
            match lookup {
                EventLookup::Found(task) if task.gcal_event_id.as_deref() == Some(&event.id) => {
                    self.unschedule_cancelled(&task, &event.id).await?;
                    report.unlinked += 1;
                }
                _ => report.skipped += 1,
            }
            return Ok(());
        }

        let Some((start, duration)) = self.event_schedule(event) else {
            log::debug!("pull calendar: event {} has no usable start", event.id);
            report.skipped += 1;
            return Ok(());
        };
        let remote_updated = remote_time(event.updated.as_deref());

        match lookup {
            EventLookup::Ignored => report.skipped += 1,
            EventLookup::NotFound => {
                let task = self
                    .index
                    .add(NewTask {
                        title: event
                            .summary
                            .clone()
                            .and_then(non_empty)
                            .unwrap_or_else(|| UNTITLED.to_string()),
                        notes: event_notes(event),
                        start: Some(start),
                        duration_minutes: Some(duration),
                        gcal_event_id: Some(event.id.clone()),
                        gcal_etag: event.etag.clone(),
                        gcal_updated: remote_updated,
                        updated_at: remote_updated,
                        ..NewTask::default()
                    })
                    .await?;
                log::info!("pull calendar: event {} -> new task {}", event.id, task.id);
                report.created += 1;
                self.write_back_marker(&task, event, &mut report.warnings)
                    .await?;
            }
            EventLookup::Found(task) => {
                match decide_pull(remote_updated, task.gcal_updated, task.updated_at) {
                    PullDecision::Skip => report.skipped += 1,
                    PullDecision::ApplyRemote => {
                        let task = self.apply_event(&task, event).await?;
                        report.updated += 1;
                        let marked = event
                            .description
                            .as_deref()
                            .and_then(marker::find_marker)
                            == Some(task.id);
                        if !marked {
                            self.write_back_marker(&task, event, &mut report.warnings)
                                .await?;
                        }
                    }
                    PullDecision::KeepLocal => {
                        self.index
                            .update(
                                task.id,
                                TaskPatch {
                                    gcal_event_id: Some(Some(event.id.clone())),
                                    gcal_etag: Some(event.etag.clone()),
                                    gcal_updated: Some(remote_updated),
                                    ..TaskPatch::default()
                                },
                            )
                            .await?;
                        self.index
                            .enqueue(
                                PendingOpKind::GcalUpdate,
                                task.id,
                                &OpPayload::event(Some(&event.id)),
                            )
                            .await?;
                        log::debug!(
                            "pull calendar: task {} is newer than event {}, push queued",
                            task.id,
                            event.id
                        );
                        report.deferred += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// A cancelled event never deletes local data: the task only loses its slot.
    async fn unschedule_cancelled(&self, task: &Task, event_id: &str) -> Result<(), EngineError> {
        let patch = TaskPatch {
            start: Some(None),
            duration_minutes: Some(None),
            ..TaskPatch::clear_calendar_link()
        };
        self.index.update(task.id, patch).await?;
        log::info!(
            "pull calendar: event {event_id} cancelled, task {} unscheduled",
            task.id
        );
        Ok(())
    }

    /// Overwrites local fields with the remote event and returns the stored task.
    async fn apply_event(&self, task: &Task, event: &CalendarEvent) -> Result<Task, EngineError> {
        if event.is_cancelled() {
            self.unschedule_cancelled(task, &event.id).await?;
            return Ok(self
                .index
                .get(task.id)
                .await?
                .ok_or(IndexError::MissingTask(task.id))?);
        }
        let remote_updated = remote_time(event.updated.as_deref());
        let mut patch = TaskPatch {
            title: Some(
                event
                    .summary
                    .clone()
                    .and_then(non_empty)
                    .unwrap_or_else(|| task.title.clone()),
            ),
            notes: Some(event_notes(event)),
            gcal_event_id: Some(Some(event.id.clone())),
            gcal_etag: Some(event.etag.clone()),
            gcal_updated: Some(remote_updated),
            updated_at: remote_updated,
            ..TaskPatch::default()
        };
        if let Some((start, duration)) = self.event_schedule(event) {
            patch.start = Some(Some(start));
            patch.duration_minutes = Some(Some(duration));
        }
        let updated = self
            .index
            .update(task.id, patch)
            .await?
            .ok_or(IndexError::MissingTask(task.id))?;
        self.detach_tasks_link(&updated).await?;
        Ok(updated)
    }

    /// Best effort: a failure is reported as a warning and the next pull retries.
    async fn write_back_marker(
        &self,
        task: &Task,
        event: &CalendarEvent,
        warnings: &mut Vec<SyncWarning>,
    ) -> Result<(), EngineError> {
        let body = EventBody {
            description: Some(marker::ensure_marker(event.description.as_deref(), task.id)),
            ..EventBody::default()
        };
        match self
            .remotes
            .calendar
            .patch_event(
                &self.settings.calendar_id,
                &event.id,
                &body,
                event.etag.as_deref(),
            )
            .await
        {
            Ok(patched) => {
                let updated = remote_time(patched.updated.as_deref()).or(task.gcal_updated);
                self.index
                    .update(
                        task.id,
                        TaskPatch {
                            gcal_etag: Some(patched.etag.or_else(|| task.gcal_etag.clone())),
                            gcal_updated: Some(updated),
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
            }
            Err(err) => {
                log::warn!(
                    "pull calendar: marker write-back for task {} failed: {err}",
                    task.id
                );
                warnings.push(SyncWarning::MarkerWriteFailed {
                    task_id: task.id,
                    event_id: event.id.clone(),
                    error: err.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Start and duration of an event. All-day events start at midnight UTC.
    fn event_schedule(&self, event: &CalendarEvent) -> Option<(OffsetDateTime, i64)> {
        let start_field = event.start.as_ref()?;
        let start = event_instant(start_field)?;
        let end = event.end.as_ref().and_then(event_instant);
        let minutes = match end {
            Some(end) if end > start => (end - start).whole_minutes(),
            _ if start_field.date_time.is_none() => WHOLE_DAY_MINUTES,
            _ => self.settings.default_duration_min,
        };
        Some((start, minutes))
    }

    fn event_body(&self, task: &Task) -> Option<EventBody> {
        let start = task.start?;
        let end = task.end(self.settings.default_duration_min)?;
        Some(EventBody {
            summary: Some(task.title.clone()),
            description: Some(marker::ensure_marker(task.notes.as_deref(), task.id)),
            start: Some(EventDateTime::at(clock::format_rfc3339(start))),
            end: Some(EventDateTime::at(clock::format_rfc3339(end))),
        })
    }
}

fn event_instant(value: &EventDateTime) -> Option<OffsetDateTime> {
    value
        .date_time
        .as_deref()
        .and_then(clock::parse_rfc3339)
        .or_else(|| value.date.as_deref().and_then(clock::parse_date))
}

fn event_notes(event: &CalendarEvent) -> Option<String> {
    event
        .description
        .as_deref()
        .map(marker::strip_marker)
        .and_then(non_empty)
}
