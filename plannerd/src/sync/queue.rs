use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use time::OffsetDateTime;

use super::backoff::Backoff;
use super::clock;
use super::index::{IndexError, IndexStore, decode_time, encode_time};

const MAX_ERROR_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingOpKind {
    GcalCreate,
    GcalUpdate,
    GcalDelete,
    GtasksCreate,
    GtasksUpdate,
    GtasksDelete,
}

impl PendingOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOpKind::GcalCreate => "gcal_create",
            PendingOpKind::GcalUpdate => "gcal_update",
            PendingOpKind::GcalDelete => "gcal_delete",
            PendingOpKind::GtasksCreate => "gtasks_create",
            PendingOpKind::GtasksUpdate => "gtasks_update",
            PendingOpKind::GtasksDelete => "gtasks_delete",
        }
    }
}

impl FromStr for PendingOpKind {
    type Err = IndexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "gcal_create" => Ok(PendingOpKind::GcalCreate),
            "gcal_update" => Ok(PendingOpKind::GcalUpdate),
            "gcal_delete" => Ok(PendingOpKind::GcalDelete),
            "gtasks_create" => Ok(PendingOpKind::GtasksCreate),
            "gtasks_update" => Ok(PendingOpKind::GtasksUpdate),
            "gtasks_delete" => Ok(PendingOpKind::GtasksDelete),
            other => Err(IndexError::InvalidOperationKind(other.to_string())),
        }
    }
}

impl fmt::Display for PendingOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote identifiers captured at enqueue time. Request bodies are rebuilt from the
/// current task when the operation runs, so only the link needs to survive a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtask_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasklist_id: Option<String>,
}

impl OpPayload {
    pub fn event(event_id: Option<&str>) -> Self {
        Self {
            event_id: event_id.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn gtask(gtask_id: Option<&str>, tasklist_id: Option<&str>) -> Self {
        Self {
            gtask_id: gtask_id.map(str::to_string),
            tasklist_id: tasklist_id.map(str::to_string),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub id: i64,
    pub kind: PendingOpKind,
    pub task_id: i64,
    /// Raw JSON; decoded by the worker so a malformed row stays inspectable.
    pub payload: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub next_try_at: OffsetDateTime,
    pub dead: bool,
}

impl PendingOp {
    pub fn decode_payload(&self) -> Result<OpPayload, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

const OP_COLUMNS: &str =
    "id, op, task_id, payload, attempts, last_error, created_at, next_try_at, dead";

fn op_from_row(row: &SqliteRow) -> Result<PendingOp, IndexError> {
    let kind: String = row.try_get("op")?;
    let attempts: i64 = row.try_get("attempts")?;
    let dead: i64 = row.try_get("dead")?;
    Ok(PendingOp {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        task_id: row.try_get("task_id")?,
        payload: row.try_get("payload")?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        created_at: decode_time(row.try_get("created_at")?)?,
        next_try_at: decode_time(row.try_get("next_try_at")?)?,
        dead: dead != 0,
    })
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}

impl IndexStore {
    /// Appends an operation that is due immediately. Operations are never merged.
    pub async fn enqueue(
        &self,
        kind: PendingOpKind,
        task_id: i64,
        payload: &OpPayload,
    ) -> Result<i64, IndexError> {
        let body = serde_json::to_string(payload)?;
        self.enqueue_raw(kind.as_str(), task_id, &body).await
    }

    /// Enqueue from an untyped operation name, rejecting names outside the known set.
    pub async fn enqueue_raw(
        &self,
        op: &str,
        task_id: i64,
        payload: &str,
    ) -> Result<i64, IndexError> {
        let kind: PendingOpKind = op.parse()?;
        let now = encode_time(clock::now_utc());
        let result = sqlx::query(
            "INSERT INTO pending_ops (op, task_id, payload, attempts, created_at, next_try_at, dead)
             VALUES (?1, ?2, ?3, 0, ?4, ?4, 0)",
        )
        .bind(kind.as_str())
        .bind(task_id)
        .bind(payload)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn due(&self, limit: u32) -> Result<Vec<PendingOp>, IndexError> {
        self.due_at(limit, clock::now_utc()).await
    }

    /// Live operations with `next_try_at <= now`, oldest due first.
    pub async fn due_at(
        &self,
        limit: u32,
        now: OffsetDateTime,
    ) -> Result<Vec<PendingOp>, IndexError> {
        let sql = format!(
            "SELECT {OP_COLUMNS} FROM pending_ops
             WHERE dead = 0 AND next_try_at <= ?1
             ORDER BY next_try_at ASC, id ASC
             LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(encode_time(now))
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(op_from_row).collect()
    }

    pub async fn get_op(&self, op_id: i64) -> Result<Option<PendingOp>, IndexError> {
        let sql = format!("SELECT {OP_COLUMNS} FROM pending_ops WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(op_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(op_from_row).transpose()
    }

    pub async fn ops_for_task(&self, task_id: i64) -> Result<Vec<PendingOp>, IndexError> {
        let sql = format!("SELECT {OP_COLUMNS} FROM pending_ops WHERE task_id = ?1 ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(task_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(op_from_row).collect()
    }

    /// Records a failed attempt and schedules the next one `min(30, 2^attempts)` seconds
    /// after `now`, or later when the remote asked for a longer pause.
    pub async fn requeue_at(
        &self,
        op_id: i64,
        error: &str,
        now: OffsetDateTime,
        not_before: Option<Duration>,
    ) -> Result<OffsetDateTime, IndexError> {
        let op = self
            .get_op(op_id)
            .await?
            .ok_or(IndexError::MissingOperation(op_id))?;
        let attempts = op.attempts.saturating_add(1);
        let mut delay = Backoff::queue_retry().delay(attempts);
        if let Some(floor) = not_before {
            delay = delay.max(floor);
        }
        let next_try_at = now + delay;
        sqlx::query(
            "UPDATE pending_ops SET attempts = ?2, last_error = ?3, next_try_at = ?4 WHERE id = ?1",
        )
        .bind(op_id)
        .bind(i64::from(attempts))
        .bind(truncate_error(error))
        .bind(encode_time(next_try_at))
        .execute(self.pool())
        .await?;
        Ok(next_try_at)
    }

    /// Parks an operation outside of `due` while keeping it for inspection.
    pub async fn mark_dead(&self, op_id: i64, error: &str) -> Result<(), IndexError> {
        sqlx::query("UPDATE pending_ops SET dead = 1, last_error = ?2 WHERE id = ?1")
            .bind(op_id)
            .bind(truncate_error(error))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<PendingOp>, IndexError> {
        let sql = format!("SELECT {OP_COLUMNS} FROM pending_ops WHERE dead = 1 ORDER BY id ASC");
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter().map(op_from_row).collect()
    }

    pub async fn remove(&self, op_id: i64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM pending_ops WHERE id = ?1")
            .bind(op_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn count_pending(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_ops WHERE dead = 0")
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_dead(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_ops WHERE dead = 1")
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("n")?)
    }
}
