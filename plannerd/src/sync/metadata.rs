use std::collections::BTreeMap;
use std::sync::Arc;

use planner_core::{ApiErrorClass, BlobStore, GoogleError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::clock;
use super::conflict::{MergeSide, resolve_metadata};

pub const INDEX_BLOB: &str = "gtasks_index.json";
pub const CONFIG_BLOB: &str = "planner_config.json";

const MAX_WRITE_ATTEMPTS: usize = 5;
const TOMBSTONE_TTL_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata blob request failed: {0}")]
    Remote(#[from] GoogleError),
    #[error("metadata blob encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("metadata blob {0} kept changing after {MAX_WRITE_ATTEMPTS} attempts")]
    ConflictRetriesExhausted(&'static str),
}

/// Planner fields the tasks backend cannot store, keyed by remote task id in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub task_id: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataIndex {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub tasklist_id: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, MetadataEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deleted: BTreeMap<String, Tombstone>,
}

/// Marks a forgotten entry so merges with older copies do not bring it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    #[serde(with = "time::serde::rfc3339")]
    pub deleted_at: OffsetDateTime,
}

impl Tombstone {
    /// Entries stamped after the deletion survive it; unstamped ones never do.
    fn buries(&self, entry: &MetadataEntry) -> bool {
        entry
            .updated_at
            .is_none_or(|updated_at| updated_at <= self.deleted_at)
    }
}

impl MetadataIndex {
    /// Unreadable documents decode as an empty index.
    pub fn from_value(value: Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value).unwrap_or_else(|err| {
            log::warn!("metadata: ignoring unreadable {INDEX_BLOB}: {err}");
            Self::default()
        })
    }

    /// Folds `remote` into `self`, entry by entry. `self` plays the local side.
    pub fn merge_from(&mut self, remote: &MetadataIndex) {
        for (gtask_id, tombstone) in &remote.deleted {
            let newer = self
                .deleted
                .get(gtask_id)
                .is_none_or(|local| local.deleted_at < tombstone.deleted_at);
            if newer {
                self.deleted.insert(gtask_id.clone(), *tombstone);
            }
        }
        for (gtask_id, remote_entry) in &remote.tasks {
            match self.tasks.get(gtask_id) {
                Some(local) if resolve_metadata(local, remote_entry) == MergeSide::Local => {}
                _ => {
                    self.tasks.insert(gtask_id.clone(), remote_entry.clone());
                }
            }
        }
        let deleted = &self.deleted;
        self.tasks.retain(|gtask_id, entry| {
            deleted
                .get(gtask_id)
                .is_none_or(|tombstone| !tombstone.buries(entry))
        });
        let tasks = &self.tasks;
        self.deleted.retain(|gtask_id, _| !tasks.contains_key(gtask_id));
        self.version = self.version.max(remote.version);
        if self.tasklist_id.is_none() {
            self.tasklist_id = remote.tasklist_id.clone();
        }
    }

    fn prune_tombstones(&mut self, now: OffsetDateTime) {
        let Some(cutoff) = clock::days_before(now, TOMBSTONE_TTL_DAYS) else {
            return;
        };
        self.deleted.retain(|_, tombstone| tombstone.deleted_at >= cutoff);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub tasklist_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_full_sync: Option<OffsetDateTime>,
}

#[derive(Default)]
struct CachedIndex {
    index: MetadataIndex,
    revision: Option<String>,
    dirty: bool,
}

/// Locally cached copy of the shared metadata index with optimistic-concurrency writes.
pub struct MetadataStore {
    blob: Arc<dyn BlobStore>,
    state: Mutex<CachedIndex>,
}

fn is_precondition_failed(err: &GoogleError) -> bool {
    err.classification() == Some(ApiErrorClass::PreconditionFailed)
}

impl MetadataStore {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self {
            blob,
            state: Mutex::new(CachedIndex::default()),
        }
    }

    async fn read_index(&self) -> Result<(MetadataIndex, Option<String>), MetadataError> {
        Ok(match self.blob.read(INDEX_BLOB).await? {
            Some(blob) => (MetadataIndex::from_value(blob.value), blob.revision),
            None => (MetadataIndex::default(), None),
        })
    }

    /// Pulls the shared index and merges it into the cache. Local entries that win the
    /// merge leave the cache dirty so the next flush publishes them.
    pub async fn refresh(&self) -> Result<(), MetadataError> {
        let (remote, revision) = self.read_index().await?;
        let mut state = self.state.lock().await;
        state.index.merge_from(&remote);
        state.revision = revision;
        if state.index.tasks != remote.tasks
            || state.index.deleted != remote.deleted
            || state.index.tasklist_id != remote.tasklist_id
        {
            state.dirty = true;
        }
        Ok(())
    }

    pub async fn entry(&self, gtask_id: &str) -> Option<MetadataEntry> {
        self.state.lock().await.index.tasks.get(gtask_id).cloned()
    }

    pub async fn record(&self, gtask_id: &str, entry: MetadataEntry) {
        let mut state = self.state.lock().await;
        if state.index.tasks.get(gtask_id) != Some(&entry) {
            state.index.deleted.remove(gtask_id);
            state.index.tasks.insert(gtask_id.to_string(), entry);
            state.dirty = true;
        }
    }

    pub async fn forget(&self, gtask_id: &str) {
        let mut state = self.state.lock().await;
        if state.index.tasks.remove(gtask_id).is_some() {
            let tombstone = Tombstone {
                deleted_at: clock::now_utc(),
            };
            state.index.deleted.insert(gtask_id.to_string(), tombstone);
            state.dirty = true;
        }
    }

    pub async fn set_tasklist_id(&self, tasklist_id: &str) {
        let mut state = self.state.lock().await;
        if state.index.tasklist_id.as_deref() != Some(tasklist_id) {
            state.index.tasklist_id = Some(tasklist_id.to_string());
            state.dirty = true;
        }
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Writes the cached index if it changed. On a revision conflict the remote copy is
    /// re-read, merged and the write retried, up to five attempts in total.
    pub async fn flush(&self) -> Result<bool, MetadataError> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(false);
        }
        state.index.prune_tombstones(clock::now_utc());
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut payload = state.index.clone();
            payload.version = payload.version.saturating_add(1);
            let value = serde_json::to_value(&payload)?;
            match self
                .blob
                .write(INDEX_BLOB, &value, state.revision.as_deref())
                .await
            {
                Ok(revision) => {
                    state.index = payload;
                    state.revision = Some(revision);
                    state.dirty = false;
                    return Ok(true);
                }
                Err(err) if is_precondition_failed(&err) => {
                    log::debug!("metadata: {INDEX_BLOB} changed remotely, merging");
                    let (remote, revision) = self.read_index().await?;
                    state.index.merge_from(&remote);
                    state.revision = revision;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(MetadataError::ConflictRetriesExhausted(INDEX_BLOB))
    }

    pub async fn read_config(&self) -> Result<(PlannerConfig, Option<String>), MetadataError> {
        Ok(match self.blob.read(CONFIG_BLOB).await? {
            Some(blob) if !blob.value.is_null() => (
                serde_json::from_value(blob.value).unwrap_or_default(),
                blob.revision,
            ),
            Some(blob) => (PlannerConfig::default(), blob.revision),
            None => (PlannerConfig::default(), None),
        })
    }

    /// Applies `mutate` to the shared config, re-applying it on top of a fresh copy when
    /// another device wrote in between.
    pub async fn update_config<F>(&self, mutate: F) -> Result<PlannerConfig, MetadataError>
    where
        F: Fn(&mut PlannerConfig) + Send + Sync,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let (mut config, revision) = self.read_config().await?;
            mutate(&mut config);
            config.version = config.version.saturating_add(1);
            let value = serde_json::to_value(&config)?;
            match self
                .blob
                .write(CONFIG_BLOB, &value, revision.as_deref())
                .await
            {
                Ok(_) => return Ok(config),
                Err(err) if is_precondition_failed(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(MetadataError::ConflictRetriesExhausted(CONFIG_BLOB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use planner_core::{Blob, StatusCode};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use time::macros::datetime;

    /// In-memory blob store that can simulate another device writing first.
    #[derive(Default)]
    struct MemoryBlobs {
        files: StdMutex<HashMap<String, (Value, u64)>>,
        interleave: StdMutex<Vec<Value>>,
    }

    impl MemoryBlobs {
        fn put(&self, name: &str, value: Value) {
            let mut files = self.files.lock().unwrap();
            let rev = files.get(name).map(|(_, rev)| rev + 1).unwrap_or(1);
            files.insert(name.to_string(), (value, rev));
        }

        fn get(&self, name: &str) -> Option<Value> {
            self.files.lock().unwrap().get(name).map(|(v, _)| v.clone())
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobs {
        async fn read(&self, name: &str) -> Result<Option<Blob>, GoogleError> {
            Ok(self.files.lock().unwrap().get(name).map(|(value, rev)| Blob {
                value: value.clone(),
                revision: Some(rev.to_string()),
            }))
        }

        async fn write(
            &self,
            name: &str,
            value: &Value,
            if_match: Option<&str>,
        ) -> Result<String, GoogleError> {
            if let Some(other) = self.interleave.lock().unwrap().pop() {
                self.put(name, other);
            }
            let mut files = self.files.lock().unwrap();
            let current = files.get(name).map(|(_, rev)| *rev);
            if let (Some(current), Some(expected)) = (current, if_match)
                && current.to_string() != expected
            {
                return Err(GoogleError::api(StatusCode::PRECONDITION_FAILED, ""));
            }
            let rev = current.map(|rev| rev + 1).unwrap_or(1);
            files.insert(name.to_string(), (value.clone(), rev));
            Ok(rev.to_string())
        }
    }

    fn entry(task_id: i64, updated_at: OffsetDateTime, device: &str) -> MetadataEntry {
        MetadataEntry {
            task_id,
            priority: 2,
            status: "doing".into(),
            updated_at: Some(updated_at),
            device_id: device.into(),
        }
    }

    #[test]
    fn corrupt_index_decodes_empty() {
        assert_eq!(
            MetadataIndex::from_value(json!("garbage")),
            MetadataIndex::default()
        );
    }

    #[tokio::test]
    async fn flush_writes_only_when_dirty() {
        let blobs = Arc::new(MemoryBlobs::default());
        let store = MetadataStore::new(blobs.clone());
        assert!(!store.flush().await.unwrap());

        store
            .record("g1", entry(1, datetime!(2025-03-01 10:00 UTC), "DEV-A"))
            .await;
        assert!(store.flush().await.unwrap());
        let written = blobs.get(INDEX_BLOB).unwrap();
        assert_eq!(written["tasks"]["g1"]["task_id"], 1);
        assert_eq!(written["version"], 1);
        assert!(!store.is_dirty().await);
    }

    #[tokio::test]
    async fn conflicting_write_merges_other_device_entries() {
        let blobs = Arc::new(MemoryBlobs::default());
        blobs.put(INDEX_BLOB, json!({ "version": 3, "tasks": {} }));
        let store = MetadataStore::new(blobs.clone());
        store.refresh().await.unwrap();
        store
            .record("g1", entry(1, datetime!(2025-03-01 10:00 UTC), "DEV-A"))
            .await;
        store
            .record("g2", entry(2, datetime!(2025-03-01 09:00 UTC), "DEV-A"))
            .await;

        // Another device publishes first: a newer g2 and an unrelated g3.
        let other = json!({
            "version": 4,
            "tasks": {
                "g2": { "task_id": 2, "priority": 0, "status": "done",
                        "updated_at": "2025-03-01T11:00:00Z", "device_id": "DEV-B" },
                "g3": { "task_id": 3, "priority": 1, "status": "todo",
                        "updated_at": "2025-03-01T08:00:00Z", "device_id": "DEV-B" }
            }
        });
        blobs.interleave.lock().unwrap().push(other);

        assert!(store.flush().await.unwrap());
        let written = blobs.get(INDEX_BLOB).unwrap();
        assert_eq!(written["tasks"]["g1"]["device_id"], "DEV-A");
        assert_eq!(written["tasks"]["g2"]["status"], "done");
        assert_eq!(written["tasks"]["g3"]["task_id"], 3);
        assert_eq!(written["version"], 5);
    }

    #[tokio::test]
    async fn refresh_keeps_newer_local_entries_dirty() {
        let blobs = Arc::new(MemoryBlobs::default());
        blobs.put(
            INDEX_BLOB,
            json!({ "version": 1, "tasklist_id": "inbox", "tasks": {
                "g1": { "task_id": 1, "status": "todo",
                        "updated_at": "2025-03-01T08:00:00Z", "device_id": "DEV-B" }
            }}),
        );
        let store = MetadataStore::new(blobs.clone());
        store
            .record("g1", entry(1, datetime!(2025-03-01 10:00 UTC), "DEV-A"))
            .await;

        store.refresh().await.unwrap();

        assert_eq!(store.entry("g1").await.unwrap().device_id, "DEV-A");
        assert!(store.is_dirty().await);
        assert!(store.flush().await.unwrap());
        let written = blobs.get(INDEX_BLOB).unwrap();
        assert_eq!(written["tasklist_id"], "inbox");
        assert_eq!(written["tasks"]["g1"]["device_id"], "DEV-A");
    }

    #[tokio::test]
    async fn forgotten_entry_stays_gone_after_conflicting_write() {
        let blobs = Arc::new(MemoryBlobs::default());
        let stale = json!({ "version": 1, "tasks": {
            "g1": { "task_id": 1, "status": "todo",
                    "updated_at": "2025-03-01T08:00:00Z", "device_id": "DEV-B" }
        }});
        blobs.put(INDEX_BLOB, stale.clone());
        let store = MetadataStore::new(blobs.clone());
        store.refresh().await.unwrap();
        store.forget("g1").await;
        blobs.interleave.lock().unwrap().push(stale);

        assert!(store.flush().await.unwrap());
        let written = blobs.get(INDEX_BLOB).unwrap();
        assert!(written["tasks"].get("g1").is_none());
        assert!(written["deleted"]["g1"]["deleted_at"].is_string());

        store.refresh().await.unwrap();
        assert!(store.entry("g1").await.is_none());
    }

    #[test]
    fn entry_written_after_deletion_survives_merge() {
        let deleted_at = datetime!(2025-03-01 09:00 UTC);
        let mut local = MetadataIndex::default();
        local.deleted.insert("g1".into(), Tombstone { deleted_at });
        let mut remote = MetadataIndex::default();
        remote
            .tasks
            .insert("g1".into(), entry(1, datetime!(2025-03-01 10:00 UTC), "DEV-B"));

        local.merge_from(&remote);

        assert_eq!(local.tasks["g1"].device_id, "DEV-B");
        assert!(local.deleted.is_empty());
    }

    #[test]
    fn expired_tombstones_are_pruned() {
        let mut index = MetadataIndex::default();
        index.deleted.insert(
            "old".into(),
            Tombstone {
                deleted_at: datetime!(2025-01-01 00:00 UTC),
            },
        );
        index.deleted.insert(
            "recent".into(),
            Tombstone {
                deleted_at: datetime!(2025-03-20 00:00 UTC),
            },
        );

        index.prune_tombstones(datetime!(2025-04-01 00:00 UTC));

        assert!(!index.deleted.contains_key("old"));
        assert!(index.deleted.contains_key("recent"));
    }

    #[tokio::test]
    async fn update_config_records_full_sync() {
        let blobs = Arc::new(MemoryBlobs::default());
        let store = MetadataStore::new(blobs.clone());
        let at = datetime!(2025-03-01 12:00 UTC);

        let config = store
            .update_config(|config| config.last_full_sync = Some(at))
            .await
            .unwrap();

        assert_eq!(config.last_full_sync, Some(at));
        let (stored, _) = store.read_config().await.unwrap();
        assert_eq!(stored, config);
    }
}
