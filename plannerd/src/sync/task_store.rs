use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use time::{Date, Duration, OffsetDateTime, Time};

use super::clock;
use super::index::{IndexError, IndexStore, decode_opt_time, decode_time, encode_time};

pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 3;

pub fn clamp_priority(value: i64) -> i64 {
    value.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Todo,
    Doing,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
        }
    }

    /// Lenient parse used for remote metadata: unknown values fall back to `Todo`.
    pub fn normalize(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl FromStr for TaskStatus {
    type Err = IndexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "todo" | "needsaction" => Ok(TaskStatus::Todo),
            "doing" | "in_progress" => Ok(TaskStatus::Doing),
            "done" | "completed" | "complete" | "finished" => Ok(TaskStatus::Done),
            _ => Err(IndexError::InvalidStatus(value.to_string())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub notes: Option<String>,
    pub start: Option<OffsetDateTime>,
    pub duration_minutes: Option<i64>,
    pub priority: i64,
    pub status: TaskStatus,
    pub gcal_event_id: Option<String>,
    pub gcal_etag: Option<String>,
    pub gcal_updated: Option<OffsetDateTime>,
    pub gtasks_id: Option<String>,
    pub gtasks_updated: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Task {
    pub fn is_scheduled(&self) -> bool {
        self.start.is_some()
    }

    /// End of the scheduled slot, falling back to `default_minutes` when no positive
    /// duration is stored.
    pub fn end(&self, default_minutes: i64) -> Option<OffsetDateTime> {
        let minutes = self
            .duration_minutes
            .filter(|value| *value > 0)
            .unwrap_or(default_minutes);
        let start = self.start?;
        clock::minutes_after(start, minutes)
            .or_else(|| clock::minutes_after(start, default_minutes))
    }

    fn apply(&mut self, patch: TaskPatch) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(notes) = patch.notes {
            self.notes = notes;
        }
        if let Some(start) = patch.start {
            self.start = start;
        }
        if let Some(duration) = patch.duration_minutes {
            self.duration_minutes = duration;
        }
        if let Some(priority) = patch.priority {
            self.priority = clamp_priority(priority);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(event_id) = patch.gcal_event_id {
            self.gcal_event_id = event_id;
        }
        if let Some(etag) = patch.gcal_etag {
            self.gcal_etag = etag;
        }
        if let Some(updated) = patch.gcal_updated {
            self.gcal_updated = updated;
        }
        if let Some(gtasks_id) = patch.gtasks_id {
            self.gtasks_id = gtasks_id;
        }
        if let Some(updated) = patch.gtasks_updated {
            self.gtasks_updated = updated;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub notes: Option<String>,
    pub start: Option<OffsetDateTime>,
    pub duration_minutes: Option<i64>,
    pub priority: i64,
    pub status: TaskStatus,
    pub gcal_event_id: Option<String>,
    pub gcal_etag: Option<String>,
    pub gcal_updated: Option<OffsetDateTime>,
    pub gtasks_id: Option<String>,
    pub gtasks_updated: Option<OffsetDateTime>,
    /// Defaults to the insertion time.
    pub updated_at: Option<OffsetDateTime>,
}

/// Partial update. Outer `None` leaves a field untouched; `Some(None)` clears a nullable one.
///
/// `updated_at` is never bumped implicitly: user edits go through [`TaskPatch::edited`],
/// sync merges copy the remote revision so that a repeated pull is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub notes: Option<Option<String>>,
    pub start: Option<Option<OffsetDateTime>>,
    pub duration_minutes: Option<Option<i64>>,
    pub priority: Option<i64>,
    pub status: Option<TaskStatus>,
    pub gcal_event_id: Option<Option<String>>,
    pub gcal_etag: Option<Option<String>>,
    pub gcal_updated: Option<Option<OffsetDateTime>>,
    pub gtasks_id: Option<Option<String>>,
    pub gtasks_updated: Option<Option<OffsetDateTime>>,
    pub updated_at: Option<OffsetDateTime>,
}

impl TaskPatch {
    pub fn edited() -> Self {
        Self {
            updated_at: Some(clock::now_utc()),
            ..Self::default()
        }
    }

    pub fn clear_calendar_link() -> Self {
        Self {
            gcal_event_id: Some(None),
            gcal_etag: Some(None),
            gcal_updated: Some(None),
            ..Self::default()
        }
    }

    pub fn clear_tasks_link() -> Self {
        Self {
            gtasks_id: Some(None),
            gtasks_updated: Some(None),
            ..Self::default()
        }
    }
}

/// CRUD and query access to local tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Task>, IndexError>;

    async fn add(&self, task: NewTask) -> Result<Task, IndexError>;

    async fn update(&self, id: i64, patch: TaskPatch) -> Result<Option<Task>, IndexError>;

    async fn delete(&self, id: i64) -> Result<(), IndexError>;

    async fn list_scheduled_for_day(&self, day: Date) -> Result<Vec<Task>, IndexError>;

    async fn list_scheduled(&self) -> Result<Vec<Task>, IndexError>;

    async fn list_unscheduled(&self) -> Result<Vec<Task>, IndexError>;

    async fn list_unscheduled_updated_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<Task>, IndexError>;

    async fn find_by_event_id(&self, event_id: &str) -> Result<Option<Task>, IndexError>;

    async fn find_by_gtasks_id(&self, gtasks_id: &str) -> Result<Option<Task>, IndexError>;
}

const TASK_COLUMNS: &str = "id, title, notes, start_at, duration_minutes, priority, status, gcal_event_id, gcal_etag, gcal_updated, gtasks_id, gtasks_updated, created_at, updated_at";

fn task_from_row(row: &SqliteRow) -> Result<Task, IndexError> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        notes: row.try_get("notes")?,
        start: decode_opt_time(row.try_get("start_at")?)?,
        duration_minutes: row.try_get("duration_minutes")?,
        priority: row.try_get("priority")?,
        status: status.parse()?,
        gcal_event_id: row.try_get("gcal_event_id")?,
        gcal_etag: row.try_get("gcal_etag")?,
        gcal_updated: decode_opt_time(row.try_get("gcal_updated")?)?,
        gtasks_id: row.try_get("gtasks_id")?,
        gtasks_updated: decode_opt_time(row.try_get("gtasks_updated")?)?,
        created_at: decode_time(row.try_get("created_at")?)?,
        updated_at: decode_time(row.try_get("updated_at")?)?,
    })
}

impl IndexStore {
    async fn fetch_tasks(
        &self,
        where_clause: &str,
        binds: &[i64],
    ) -> Result<Vec<Task>, IndexError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {where_clause} ORDER BY id ASC");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn fetch_task_by_text(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<Task>, IndexError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {column} = ?1 ORDER BY id ASC LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }
}

#[async_trait]
impl TaskStore for IndexStore {
    async fn get(&self, id: i64) -> Result<Option<Task>, IndexError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn add(&self, task: NewTask) -> Result<Task, IndexError> {
        let now = clock::now_utc();
        let result = sqlx::query(
            "INSERT INTO tasks (title, notes, start_at, duration_minutes, priority, status, gcal_event_id, gcal_etag, gcal_updated, gtasks_id, gtasks_updated, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&task.title)
        .bind(&task.notes)
        .bind(task.start.map(encode_time))
        .bind(task.duration_minutes)
        .bind(clamp_priority(task.priority))
        .bind(task.status.as_str())
        .bind(&task.gcal_event_id)
        .bind(&task.gcal_etag)
        .bind(task.gcal_updated.map(encode_time))
        .bind(&task.gtasks_id)
        .bind(task.gtasks_updated.map(encode_time))
        .bind(encode_time(now))
        .bind(encode_time(task.updated_at.unwrap_or(now)))
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        self.get(id).await?.ok_or(IndexError::MissingTask(id))
    }

    async fn update(&self, id: i64, patch: TaskPatch) -> Result<Option<Task>, IndexError> {
        let Some(mut task) = self.get(id).await? else {
            return Ok(None);
        };
        task.apply(patch);
        sqlx::query(
            "UPDATE tasks SET
                title = ?2,
                notes = ?3,
                start_at = ?4,
                duration_minutes = ?5,
                priority = ?6,
                status = ?7,
                gcal_event_id = ?8,
                gcal_etag = ?9,
                gcal_updated = ?10,
                gtasks_id = ?11,
                gtasks_updated = ?12,
                updated_at = ?13
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&task.title)
        .bind(&task.notes)
        .bind(task.start.map(encode_time))
        .bind(task.duration_minutes)
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(&task.gcal_event_id)
        .bind(&task.gcal_etag)
        .bind(task.gcal_updated.map(encode_time))
        .bind(&task.gtasks_id)
        .bind(task.gtasks_updated.map(encode_time))
        .bind(encode_time(task.updated_at))
        .execute(self.pool())
        .await?;
        Ok(Some(task))
    }

    async fn delete(&self, id: i64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn list_scheduled_for_day(&self, day: Date) -> Result<Vec<Task>, IndexError> {
        let from = day.with_time(Time::MIDNIGHT).assume_utc();
        let to = from + Duration::days(1);
        self.fetch_tasks(
            "start_at IS NOT NULL AND start_at >= ?1 AND start_at < ?2",
            &[encode_time(from), encode_time(to)],
        )
        .await
    }

    async fn list_scheduled(&self) -> Result<Vec<Task>, IndexError> {
        self.fetch_tasks("start_at IS NOT NULL", &[]).await
    }

    async fn list_unscheduled(&self) -> Result<Vec<Task>, IndexError> {
        self.fetch_tasks("start_at IS NULL", &[]).await
    }

    async fn list_unscheduled_updated_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<Task>, IndexError> {
        self.fetch_tasks(
            "start_at IS NULL AND updated_at > ?1",
            &[encode_time(since)],
        )
        .await
    }

    async fn find_by_event_id(&self, event_id: &str) -> Result<Option<Task>, IndexError> {
        self.fetch_task_by_text("gcal_event_id", event_id).await
    }

    async fn find_by_gtasks_id(&self, gtasks_id: &str) -> Result<Option<Task>, IndexError> {
        self.fetch_task_by_text("gtasks_id", gtasks_id).await
    }
}
