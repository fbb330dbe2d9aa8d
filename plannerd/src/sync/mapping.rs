use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use time::OffsetDateTime;

use super::clock;
use super::index::{IndexError, IndexStore, decode_time, encode_time};

/// Link between a local unscheduled task and its tasks-backend item.
///
/// A row may exist without `gtask_id`: marking a never-pushed task dirty creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtaskMapping {
    pub task_id: i64,
    pub gtask_id: Option<String>,
    pub tasklist_id: Option<String>,
    pub revision: Option<String>,
    pub updated_at: OffsetDateTime,
    pub dirty: bool,
}

const MAPPING_COLUMNS: &str = "task_id, gtask_id, tasklist_id, revision, updated_at, dirty";

fn mapping_from_row(row: &SqliteRow) -> Result<GtaskMapping, IndexError> {
    let dirty: i64 = row.try_get("dirty")?;
    Ok(GtaskMapping {
        task_id: row.try_get("task_id")?,
        gtask_id: row.try_get("gtask_id")?,
        tasklist_id: row.try_get("tasklist_id")?,
        revision: row.try_get("revision")?,
        updated_at: decode_time(row.try_get("updated_at")?)?,
        dirty: dirty != 0,
    })
}

impl IndexStore {
    /// Records a confirmed link. The row is clean afterwards.
    pub async fn upsert_mapping(
        &self,
        task_id: i64,
        remote_id: &str,
        tasklist_id: &str,
        revision: Option<&str>,
        updated_at: OffsetDateTime,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO gtask_mappings (task_id, gtask_id, tasklist_id, revision, updated_at, dirty)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(task_id) DO UPDATE SET
                gtask_id = excluded.gtask_id,
                tasklist_id = excluded.tasklist_id,
                revision = excluded.revision,
                updated_at = excluded.updated_at,
                dirty = 0",
        )
        .bind(task_id)
        .bind(remote_id)
        .bind(tasklist_id)
        .bind(revision)
        .bind(encode_time(updated_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_mapping(&self, task_id: i64) -> Result<Option<GtaskMapping>, IndexError> {
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM gtask_mappings WHERE task_id = ?1");
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    pub async fn get_mapping_by_remote(
        &self,
        remote_id: &str,
    ) -> Result<Option<GtaskMapping>, IndexError> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM gtask_mappings WHERE gtask_id = ?1 ORDER BY task_id ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(remote_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    pub async fn delete_mapping(&self, task_id: i64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM gtask_mappings WHERE task_id = ?1")
            .bind(task_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Flags unpushed local changes so that pulls leave the task alone.
    pub async fn mark_dirty(&self, task_id: i64) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO gtask_mappings (task_id, updated_at, dirty) VALUES (?1, ?2, 1)
             ON CONFLICT(task_id) DO UPDATE SET dirty = 1, updated_at = excluded.updated_at",
        )
        .bind(task_id)
        .bind(encode_time(clock::now_utc()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
