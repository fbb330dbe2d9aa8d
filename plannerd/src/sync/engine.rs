use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use planner_core::{
    ApiErrorClass, BlobStore, CalendarEvent, CalendarService, CredentialError,
    CredentialProvider, EventBody, EventDateTime, EventQuery, GoogleClient, GoogleError,
    RemoteTask, TaskBody, TaskQuery, TasksService,
};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::clock;
use super::conflict::{ConflictDecision, PullDecision, decide_pull, resolve_conflict};
use super::index::{IndexError, IndexStore};
use super::marker::{self, NotesMetadata};
use super::metadata::{MetadataEntry, MetadataError, MetadataStore};
use super::queue::{OpPayload, PendingOp, PendingOpKind};
use super::task_store::{NewTask, Task, TaskPatch, TaskStatus, TaskStore};
use crate::storage::{Backend, CursorError, CursorSnapshot, CursorStorage};

const WHOLE_DAY_MINUTES: i64 = 24 * 60;
const CALENDAR_PAGE_SIZE: u32 = 250;
const TASKS_PAGE_SIZE: u32 = 100;
const UNTITLED: &str = "Untitled";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("remote error: {0}")]
    Remote(#[from] GoogleError),
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] CredentialError),
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("calendar sync token expired")]
    CursorExpired,
    #[error("calendar sync token expired again during a full resync")]
    CursorExpiredAfterResync,
    #[error("a sync pass is already running")]
    Busy,
}

impl EngineError {
    /// The remote side cannot be used until the user grants access again.
    pub fn is_credential_failure(&self) -> bool {
        match self {
            EngineError::Credentials(_) => true,
            EngineError::Remote(err) => err.classification() == Some(ApiErrorClass::Auth),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub calendar_id: String,
    pub tasklist_title: String,
    pub lookback_days: i64,
    pub default_duration_min: i64,
    /// Zero keeps failing operations in the queue forever.
    pub max_attempts: u32,
    /// Also write the legacy JSON prefix into task notes.
    pub notes_metadata: bool,
    pub push_batch: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            calendar_id: "primary".to_string(),
            tasklist_title: "Planner Inbox".to_string(),
            lookback_days: 90,
            default_duration_min: 30,
            max_attempts: 0,
            notes_metadata: false,
            push_batch: 10,
        }
    }
}

/// Best-effort side effects that failed without failing the pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncWarning {
    #[error("could not write marker for task {task_id} into event {event_id}: {error}")]
    MarkerWriteFailed {
        task_id: i64,
        event_id: String,
        error: String,
    },
    #[error("metadata index unavailable: {error}")]
    MetadataUnavailable { error: String },
    #[error("metadata index write failed: {error}")]
    MetadataWriteFailed { error: String },
    #[error("shared config write failed: {error}")]
    ConfigWriteFailed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub created: usize,
    pub updated: usize,
    pub unlinked: usize,
    pub skipped: usize,
    /// Local side was newer; a push was queued instead of merging.
    pub deferred: usize,
    pub full_resync: bool,
    pub warnings: Vec<SyncWarning>,
}

impl PullReport {
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.unlinked + self.deferred
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub processed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Operations removed without a remote write: superseded or lost to a newer remote.
    pub dropped: usize,
    pub warnings: Vec<SyncWarning>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub calendar: PullReport,
    pub tasks: PullReport,
    pub push: PushReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub queued: usize,
    pub warnings: Vec<SyncWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub cursors: CursorSnapshot,
    pub pending: i64,
    pub dead: i64,
    pub running: bool,
}

/// Remote collaborators of the engine.
#[derive(Clone)]
pub struct Remotes {
    pub calendar: Arc<dyn CalendarService>,
    pub tasks: Arc<dyn TasksService>,
    pub blob: Option<Arc<dyn BlobStore>>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Remotes {
    pub fn from_client(
        client: GoogleClient,
        credentials: Arc<dyn CredentialProvider>,
        with_blob: bool,
    ) -> Self {
        let client = Arc::new(client);
        Self {
            calendar: client.clone(),
            tasks: client.clone(),
            blob: with_blob.then(|| client.clone() as Arc<dyn BlobStore>),
            credentials,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpOutcome {
    Applied,
    /// The task is gone or moved to the other backend.
    Superseded,
    /// A conflicting remote revision was newer and has been merged locally.
    RemoteWon,
}

enum EventLookup {
    Found(Task),
    NotFound,
    /// Marker points at a task that belongs elsewhere.
    Ignored,
}

/// Single-flight token; dropping it lets the next pass start.
pub struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    index: IndexStore,
    remotes: Remotes,
    cursors: CursorStorage,
    metadata: Option<MetadataStore>,
    device_id: String,
    settings: SyncSettings,
    tasklist: Mutex<Option<String>>,
    running: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        index: IndexStore,
        remotes: Remotes,
        cursors: CursorStorage,
        device_id: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        let device_id = device_id.into();
        let metadata = remotes.blob.clone().map(MetadataStore::new);
        Self {
            index,
            remotes,
            cursors,
            metadata,
            device_id,
            settings,
            tasklist: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Claims the single-flight flag, or `None` when another pass is in flight.
    pub fn try_begin(&self) -> Option<SyncGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                flag: &self.running,
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Pull from both backends, then push one batch.
    pub async fn sync_once(&self) -> Result<SyncReport, EngineError> {
        let _guard = self.try_begin().ok_or(EngineError::Busy)?;
        let calendar = self.pull_calendar().await?;
        let tasks = self.pull_tasks().await?;
        let push = self.push_queue_worker(self.settings.push_batch).await?;
        Ok(SyncReport {
            calendar,
            tasks,
            push,
        })
    }

    /// One push batch under the single-flight flag.
    pub async fn push_pending(&self) -> Result<PushReport, EngineError> {
        let _guard = self.try_begin().ok_or(EngineError::Busy)?;
        self.push_queue_worker(self.settings.push_batch).await
    }

    pub async fn status(&self) -> Result<SyncStatus, EngineError> {
        Ok(SyncStatus {
            cursors: self.cursors.snapshot().await?,
            pending: self.index.count_pending().await?,
            dead: self.index.count_dead().await?,
            running: self.is_running(),
        })
    }

    pub async fn on_task_created(&self, task_id: i64) -> Result<(), EngineError> {
        let Some(task) = self.index.get(task_id).await? else {
            return Ok(());
        };
        if task.is_scheduled() {
            self.index
                .enqueue(PendingOpKind::GcalCreate, task.id, &OpPayload::default())
                .await?;
        } else {
            self.index.mark_dirty(task.id).await?;
            self.index
                .enqueue(PendingOpKind::GtasksCreate, task.id, &OpPayload::default())
                .await?;
        }
        Ok(())
    }

    /// Queues the push for an edited task and moves it between backends when its
    /// schedule changed.
    pub async fn on_task_updated(&self, task_id: i64) -> Result<(), EngineError> {
        let Some(task) = self.index.get(task_id).await? else {
            return Ok(());
        };
        if task.is_scheduled() {
            self.detach_tasks_link(&task).await?;
            let kind = if task.gcal_event_id.is_some() {
                PendingOpKind::GcalUpdate
            } else {
                PendingOpKind::GcalCreate
            };
            self.index
                .enqueue(kind, task.id, &OpPayload::event(task.gcal_event_id.as_deref()))
                .await?;
        } else {
            self.detach_calendar_link(&task).await?;
            self.index.mark_dirty(task.id).await?;
            let kind = if task.gtasks_id.is_some() {
                PendingOpKind::GtasksUpdate
            } else {
                PendingOpKind::GtasksCreate
            };
            self.index
                .enqueue(kind, task.id, &OpPayload::gtask(task.gtasks_id.as_deref(), None))
                .await?;
        }
        Ok(())
    }

    /// Called with the row as it was before deletion. Remote ids travel in the payload.
    pub async fn on_task_deleted(&self, task: &Task) -> Result<(), EngineError> {
        if let Some(event_id) = task.gcal_event_id.as_deref() {
            self.index
                .enqueue(PendingOpKind::GcalDelete, task.id, &OpPayload::event(Some(event_id)))
                .await?;
        }
        let mapping = self.index.get_mapping(task.id).await?;
        let gtask_id = mapping
            .as_ref()
            .and_then(|m| m.gtask_id.clone())
            .or_else(|| task.gtasks_id.clone());
        if let Some(gtask_id) = gtask_id.as_deref() {
            let tasklist_id = mapping.as_ref().and_then(|m| m.tasklist_id.as_deref());
            self.index
                .enqueue(
                    PendingOpKind::GtasksDelete,
                    task.id,
                    &OpPayload::gtask(Some(gtask_id), tasklist_id),
                )
                .await?;
        }
        if mapping.is_some() {
            self.index.delete_mapping(task.id).await?;
        }
        Ok(())
    }

    /// Drops every cursor and queues a push for every task.
    pub async fn force_full_resync(&self) -> Result<ResyncReport, EngineError> {
        self.cursors.clear_all().await?;
        let mut report = ResyncReport::default();
        for task in self.index.list_scheduled().await? {
            let kind = if task.gcal_event_id.is_some() {
                PendingOpKind::GcalUpdate
            } else {
                PendingOpKind::GcalCreate
            };
            self.index
                .enqueue(kind, task.id, &OpPayload::event(task.gcal_event_id.as_deref()))
                .await?;
            report.queued += 1;
        }
        for task in self.index.list_unscheduled().await? {
            self.queue_tasks_push(&task).await?;
            report.queued += 1;
        }
        log::info!("resync: cursors cleared, {} pushes queued", report.queued);
        if let Some(meta) = &self.metadata {
            let now = clock::now_utc();
            if let Err(err) = meta
                .update_config(move |config| config.last_full_sync = Some(now))
                .await
            {
                log::warn!("resync: {err}");
                report.warnings.push(SyncWarning::ConfigWriteFailed {
                    error: err.to_string(),
                });
            }
        }
        Ok(report)
    }

    /// Queues unscheduled tasks edited since the last successful push. Tasks that
    /// already have a live operation are left alone.
    pub async fn enqueue_changes_since_last_push(&self) -> Result<usize, EngineError> {
        let tasks = match self.cursors.last_push_at().await? {
            Some(since) => self.index.list_unscheduled_updated_since(since).await?,
            None => self.index.list_unscheduled().await?,
        };
        let mut queued = 0;
        for task in tasks {
            let live = self
                .index
                .ops_for_task(task.id)
                .await?
                .iter()
                .any(|op| !op.dead);
            if live {
                continue;
            }
            self.queue_tasks_push(&task).await?;
            queued += 1;
        }
        if queued > 0 {
            log::info!("push: queued {queued} tasks changed while offline");
        }
        Ok(queued)
    }

    async fn queue_tasks_push(&self, task: &Task) -> Result<(), EngineError> {
        self.index.mark_dirty(task.id).await?;
        let kind = if task.gtasks_id.is_some() {
            PendingOpKind::GtasksUpdate
        } else {
            PendingOpKind::GtasksCreate
        };
        self.index
            .enqueue(kind, task.id, &OpPayload::gtask(task.gtasks_id.as_deref(), None))
            .await?;
        Ok(())
    }

    /// Removes the tasks-backend link of a task that is now scheduled and queues the
    /// remote removal.
    async fn detach_tasks_link(&self, task: &Task) -> Result<bool, EngineError> {
        let mapping = self.index.get_mapping(task.id).await?;
        let gtask_id = mapping
            .as_ref()
            .and_then(|m| m.gtask_id.clone())
            .or_else(|| task.gtasks_id.clone());
        if let Some(gtask_id) = gtask_id.as_deref() {
            let tasklist_id = mapping.as_ref().and_then(|m| m.tasklist_id.as_deref());
            self.index
                .enqueue(
                    PendingOpKind::GtasksDelete,
                    task.id,
                    &OpPayload::gtask(Some(gtask_id), tasklist_id),
                )
                .await?;
        }
        if mapping.is_some() {
            self.index.delete_mapping(task.id).await?;
        }
        if task.gtasks_id.is_some() {
            self.index
                .update(task.id, TaskPatch::clear_tasks_link())
                .await?;
        }
        Ok(gtask_id.is_some() || mapping.is_some())
    }

    /// Counterpart of [`Self::detach_tasks_link`] for a task that lost its schedule.
    async fn detach_calendar_link(&self, task: &Task) -> Result<bool, EngineError> {
        let Some(event_id) = task.gcal_event_id.as_deref() else {
            return Ok(false);
        };
        self.index
            .enqueue(PendingOpKind::GcalDelete, task.id, &OpPayload::event(Some(event_id)))
            .await?;
        self.index
            .update(task.id, TaskPatch::clear_calendar_link())
            .await?;
        Ok(true)
    }

    async fn flush_metadata(&self, warnings: &mut Vec<SyncWarning>) {
        let Some(meta) = &self.metadata else {
            return;
        };
        match meta.flush().await {
            Ok(true) => log::debug!("metadata: index published"),
            Ok(false) => {}
            Err(err) => {
                log::warn!("metadata: {err}");
                warnings.push(SyncWarning::MetadataWriteFailed {
                    error: err.to_string(),
                });
            }
        }
    }

    /// Publishes planner-only fields of a linked task. With `only_if_changed` an entry
    /// that already carries the same values is left as is.
    async fn record_entry(&self, gtask_id: &str, task: &Task, only_if_changed: bool) {
        let Some(meta) = &self.metadata else {
            return;
        };
        if only_if_changed
            && let Some(existing) = meta.entry(gtask_id).await
            && existing.task_id == task.id
            && existing.priority == task.priority
            && TaskStatus::normalize(&existing.status) == task.status
        {
            return;
        }
        meta.record(
            gtask_id,
            MetadataEntry {
                task_id: task.id,
                priority: task.priority,
                status: task.status.as_str().to_string(),
                updated_at: Some(task.updated_at),
                device_id: self.device_id.clone(),
            },
        )
        .await;
    }

    async fn resolve_tasklist(&self) -> Result<String, EngineError> {
        let mut cached = self.tasklist.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let list = self
            .remotes
            .tasks
            .find_or_create_tasklist(&self.settings.tasklist_title)
            .await?;
        log::info!(
            "pull tasks: using tasklist {} ({})",
            list.id,
            self.settings.tasklist_title
        );
        if let Some(meta) = &self.metadata {
            meta.set_tasklist_id(&list.id).await;
        }
        *cached = Some(list.id.clone());
        Ok(list.id)
    }
}

fn remote_time(value: Option<&str>) -> Option<OffsetDateTime> {
    value.and_then(clock::parse_rfc3339)
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

include!("engine_impl_calendar.rs");
include!("engine_impl_tasks.rs");
include!("engine_impl_push.rs");

#[cfg(test)]
#[path = "engine_tests/mod.rs"]
mod tests;
