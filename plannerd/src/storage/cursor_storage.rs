use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::sync::clock;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cursor encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Calendar,
    Tasks,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Calendar => "calendar",
            Backend::Tasks => "tasks",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_pull_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_pull_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorFile {
    #[serde(default)]
    calendar: CalendarSection,
    #[serde(default)]
    tasks: TasksSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_push_at: Option<String>,
}

impl CursorFile {
    /// A bare string is a calendar token written by older versions. Anything else that
    /// does not parse is treated as no cursor at all, which forces a full resync.
    fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::default();
        }
        if text.starts_with('{') {
            return serde_json::from_str(text).unwrap_or_else(|err| {
                log::warn!("cursor: ignoring unreadable cursor file: {err}");
                Self::default()
            });
        }
        let token = if text.starts_with('"') {
            serde_json::from_str::<String>(text).ok()
        } else {
            Some(text.to_string())
        };
        Self {
            calendar: CalendarSection {
                sync_token: token.filter(|token| !token.is_empty()),
                last_pull_at: None,
            },
            ..Self::default()
        }
    }

    fn token(&self, backend: Backend) -> Option<&String> {
        match backend {
            Backend::Calendar => self.calendar.sync_token.as_ref(),
            Backend::Tasks => self.tasks.updated_min.as_ref(),
        }
    }

    fn token_mut(&mut self, backend: Backend) -> &mut Option<String> {
        match backend {
            Backend::Calendar => &mut self.calendar.sync_token,
            Backend::Tasks => &mut self.tasks.updated_min,
        }
    }

    fn last_pull_mut(&mut self, backend: Backend) -> &mut Option<String> {
        match backend {
            Backend::Calendar => &mut self.calendar.last_pull_at,
            Backend::Tasks => &mut self.tasks.last_pull_at,
        }
    }

    fn last_pull(&self, backend: Backend) -> Option<&String> {
        match backend {
            Backend::Calendar => self.calendar.last_pull_at.as_ref(),
            Backend::Tasks => self.tasks.last_pull_at.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub calendar_token: Option<String>,
    pub tasks_updated_min: Option<String>,
    pub calendar_last_pull_at: Option<OffsetDateTime>,
    pub tasks_last_pull_at: Option<OffsetDateTime>,
    pub last_push_at: Option<OffsetDateTime>,
}

/// Per-backend sync cursors in a small JSON file, replaced atomically on every change.
pub struct CursorStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CursorStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<CursorFile, CursorError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(CursorFile::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CursorFile::default()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                log::warn!("cursor: {} is not UTF-8, starting over", self.path.display());
                Ok(CursorFile::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, file: &CursorFile) -> Result<(), CursorError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let body = serde_json::to_vec_pretty(file)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn modify<F>(&self, change: F) -> Result<(), CursorError>
    where
        F: FnOnce(&mut CursorFile),
    {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        change(&mut file);
        self.store(&file).await
    }

    pub async fn get(&self, backend: Backend) -> Result<Option<String>, CursorError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.token(backend).cloned())
    }

    pub async fn set(&self, backend: Backend, token: &str) -> Result<(), CursorError> {
        let token = token.to_string();
        self.modify(move |file| *file.token_mut(backend) = Some(token))
            .await
    }

    pub async fn clear(&self, backend: Backend) -> Result<(), CursorError> {
        self.modify(|file| *file.token_mut(backend) = None).await
    }

    pub async fn clear_all(&self) -> Result<(), CursorError> {
        self.modify(|file| {
            file.calendar.sync_token = None;
            file.tasks.updated_min = None;
        })
        .await
    }

    pub async fn mark_pull(&self, backend: Backend, at: OffsetDateTime) -> Result<(), CursorError> {
        let stamp = clock::format_rfc3339(at);
        self.modify(move |file| *file.last_pull_mut(backend) = Some(stamp))
            .await
    }

    pub async fn mark_push(&self, at: OffsetDateTime) -> Result<(), CursorError> {
        let stamp = clock::format_rfc3339(at);
        self.modify(move |file| file.last_push_at = Some(stamp)).await
    }

    pub async fn last_pull_at(
        &self,
        backend: Backend,
    ) -> Result<Option<OffsetDateTime>, CursorError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .last_pull(backend)
            .and_then(|value| clock::parse_rfc3339(value)))
    }

    pub async fn last_push_at(&self) -> Result<Option<OffsetDateTime>, CursorError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .last_push_at
            .as_deref()
            .and_then(clock::parse_rfc3339))
    }

    pub async fn snapshot(&self) -> Result<CursorSnapshot, CursorError> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(CursorSnapshot {
            calendar_token: file.calendar.sync_token.clone(),
            tasks_updated_min: file.tasks.updated_min.clone(),
            calendar_last_pull_at: file
                .calendar
                .last_pull_at
                .as_deref()
                .and_then(clock::parse_rfc3339),
            tasks_last_pull_at: file
                .tasks
                .last_pull_at
                .as_deref()
                .and_then(clock::parse_rfc3339),
            last_push_at: file.last_push_at.as_deref().and_then(clock::parse_rfc3339),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use time::macros::datetime;

    #[tokio::test]
    async fn missing_file_has_no_cursors() {
        let dir = tempdir().unwrap();
        let storage = CursorStorage::new(dir.path().join("cursor.json"));
        assert_eq!(storage.get(Backend::Calendar).await.unwrap(), None);
        assert_eq!(storage.last_push_at().await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_get_clear_per_backend() {
        let dir = tempdir().unwrap();
        let storage = CursorStorage::new(dir.path().join("nested").join("cursor.json"));
        storage.set(Backend::Calendar, "tok-1").await.unwrap();
        storage
            .set(Backend::Tasks, "2025-03-01T00:00:00Z")
            .await
            .unwrap();

        assert_eq!(
            storage.get(Backend::Calendar).await.unwrap().as_deref(),
            Some("tok-1")
        );
        storage.clear(Backend::Calendar).await.unwrap();
        assert_eq!(storage.get(Backend::Calendar).await.unwrap(), None);
        assert_eq!(
            storage.get(Backend::Tasks).await.unwrap().as_deref(),
            Some("2025-03-01T00:00:00Z")
        );

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(storage.path()).unwrap()).unwrap();
        assert_eq!(raw["tasks"]["updatedMin"], "2025-03-01T00:00:00Z");
    }

    #[tokio::test]
    async fn tracks_pull_and_push_timestamps() {
        let dir = tempdir().unwrap();
        let storage = CursorStorage::new(dir.path().join("cursor.json"));
        let at = datetime!(2025-03-01 09:00 UTC);
        storage.mark_pull(Backend::Tasks, at).await.unwrap();
        storage.mark_push(at).await.unwrap();

        let snapshot = storage.snapshot().await.unwrap();
        assert_eq!(snapshot.tasks_last_pull_at, Some(at));
        assert_eq!(snapshot.calendar_last_pull_at, None);
        assert_eq!(storage.last_push_at().await.unwrap(), Some(at));
        assert_eq!(storage.last_pull_at(Backend::Tasks).await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_empty_and_is_repaired_on_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, "{\"calendar\": {\"syncToken\": ").unwrap();
        let storage = CursorStorage::new(&path);

        assert_eq!(storage.get(Backend::Calendar).await.unwrap(), None);
        storage.set(Backend::Calendar, "fresh").await.unwrap();
        assert_eq!(
            storage.get(Backend::Calendar).await.unwrap().as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test]
    async fn plain_string_file_is_a_calendar_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, "legacy-token\n").unwrap();
        let storage = CursorStorage::new(&path);
        assert_eq!(
            storage.get(Backend::Calendar).await.unwrap().as_deref(),
            Some("legacy-token")
        );
        assert_eq!(storage.get(Backend::Tasks).await.unwrap(), None);
    }
}
