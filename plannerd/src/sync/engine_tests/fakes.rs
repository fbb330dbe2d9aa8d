use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use planner_core::{
    Blob, BlobStore, CalendarEvent, CalendarService, EventBody, EventDateTime, EventPage,
    EventQuery, GoogleError, RemoteTask, RemoteTaskPage, StaticCredentials, StatusCode,
    TaskBody, TaskList, TaskListPage, TaskQuery, TasksService,
};
use serde_json::Value;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::storage::CursorStorage;
use crate::sync::clock;
use crate::sync::engine::{Remotes, SyncEngine, SyncSettings};
use crate::sync::index::IndexStore;

pub fn api_error(status: StatusCode) -> GoogleError {
    GoogleError::api(status, "simulated")
}

fn stamp() -> String {
    clock::format_rfc3339(clock::now_utc())
}

#[derive(Default)]
pub struct FakeCalendar {
    pub events: Mutex<BTreeMap<String, CalendarEvent>>,
    pub queries: Mutex<Vec<EventQuery>>,
    pub patches: Mutex<Vec<(String, EventBody, Option<String>)>>,
    pub inserts: Mutex<Vec<EventBody>>,
    pub deletes: Mutex<Vec<String>>,
    /// Number of token-based list calls answered with 410.
    pub expire_tokens: Mutex<usize>,
    pub expire_always: Mutex<bool>,
    /// Zero returns everything in one page.
    pub page_size: Mutex<usize>,
    pub fail_page: Mutex<Option<usize>>,
    pub fail_patch: Mutex<Option<GoogleError>>,
    pub fail_insert: Mutex<Option<GoogleError>>,
    pub fail_delete: Mutex<Option<GoogleError>>,
    counter: Mutex<u64>,
}

impl FakeCalendar {
    pub fn put(&self, event: CalendarEvent) {
        self.events.lock().unwrap().insert(event.id.clone(), event);
    }

    pub fn event(&self, id: &str) -> Option<CalendarEvent> {
        self.events.lock().unwrap().get(id).cloned()
    }

    fn next(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        *counter
    }
}

#[async_trait]
impl CalendarService for FakeCalendar {
    async fn list_events(
        &self,
        _calendar_id: &str,
        query: &EventQuery,
    ) -> Result<EventPage, GoogleError> {
        self.queries.lock().unwrap().push(query.clone());
        if *self.expire_always.lock().unwrap() {
            return Err(api_error(StatusCode::GONE));
        }
        if query.sync_token.is_some() {
            let mut expire = self.expire_tokens.lock().unwrap();
            if *expire > 0 {
                *expire -= 1;
                return Err(api_error(StatusCode::GONE));
            }
        }
        let page: usize = query
            .page_token
            .as_deref()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);
        if *self.fail_page.lock().unwrap() == Some(page) {
            return Err(api_error(StatusCode::SERVICE_UNAVAILABLE));
        }
        let all: Vec<CalendarEvent> = self.events.lock().unwrap().values().cloned().collect();
        let size = *self.page_size.lock().unwrap();
        if size == 0 {
            return Ok(EventPage {
                items: all,
                next_page_token: None,
                next_sync_token: Some(format!("tok-{}", self.next())),
            });
        }
        let items: Vec<CalendarEvent> = all.iter().skip(page * size).take(size).cloned().collect();
        let more = all.len() > (page + 1) * size;
        Ok(EventPage {
            items,
            next_page_token: more.then(|| (page + 1).to_string()),
            next_sync_token: (!more).then(|| format!("tok-{}", self.next())),
        })
    }

    async fn get_event(
        &self,
        _calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, GoogleError> {
        self.event(event_id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND))
    }

    async fn insert_event(
        &self,
        _calendar_id: &str,
        body: &EventBody,
    ) -> Result<CalendarEvent, GoogleError> {
        self.inserts.lock().unwrap().push(body.clone());
        if let Some(err) = self.fail_insert.lock().unwrap().take() {
            return Err(err);
        }
        let n = self.next();
        let event = CalendarEvent {
            id: format!("ev{n}"),
            status: Some("confirmed".into()),
            summary: body.summary.clone(),
            description: body.description.clone(),
            start: body.start.clone(),
            end: body.end.clone(),
            updated: Some(stamp()),
            etag: Some(format!("etag-{n}")),
        };
        self.put(event.clone());
        Ok(event)
    }

    async fn patch_event(
        &self,
        _calendar_id: &str,
        event_id: &str,
        body: &EventBody,
        if_match: Option<&str>,
    ) -> Result<CalendarEvent, GoogleError> {
        self.patches.lock().unwrap().push((
            event_id.to_string(),
            body.clone(),
            if_match.map(str::to_string),
        ));
        if let Some(err) = self.fail_patch.lock().unwrap().take() {
            return Err(err);
        }
        let n = self.next();
        let mut events = self.events.lock().unwrap();
        let event = events
            .get_mut(event_id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND))?;
        if let Some(summary) = &body.summary {
            event.summary = Some(summary.clone());
        }
        if let Some(description) = &body.description {
            event.description = Some(description.clone());
        }
        if let Some(start) = &body.start {
            event.start = Some(start.clone());
        }
        if let Some(end) = &body.end {
            event.end = Some(end.clone());
        }
        event.updated = Some(stamp());
        event.etag = Some(format!("etag-{n}"));
        Ok(event.clone())
    }

    async fn delete_event(&self, _calendar_id: &str, event_id: &str) -> Result<(), GoogleError> {
        self.deletes.lock().unwrap().push(event_id.to_string());
        if let Some(err) = self.fail_delete.lock().unwrap().take() {
            return Err(err);
        }
        self.events.lock().unwrap().remove(event_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTasks {
    pub lists: Mutex<Vec<TaskList>>,
    pub items: Mutex<BTreeMap<String, RemoteTask>>,
    pub queries: Mutex<Vec<TaskQuery>>,
    pub inserts: Mutex<Vec<TaskBody>>,
    pub patches: Mutex<Vec<(String, TaskBody, Option<String>)>>,
    pub deletes: Mutex<Vec<String>>,
    pub fail_patch: Mutex<Option<GoogleError>>,
    pub fail_delete: Mutex<Option<GoogleError>>,
    counter: Mutex<u64>,
}

impl FakeTasks {
    pub fn put(&self, item: RemoteTask) {
        self.items.lock().unwrap().insert(item.id.clone(), item);
    }

    pub fn item(&self, id: &str) -> Option<RemoteTask> {
        self.items.lock().unwrap().get(id).cloned()
    }

    fn next(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        *counter
    }

    fn apply(item: &mut RemoteTask, body: &TaskBody) {
        if let Some(title) = &body.title {
            item.title = Some(title.clone());
        }
        if let Some(notes) = &body.notes {
            item.notes = notes.clone();
        }
        if let Some(status) = &body.status {
            item.status = Some(status.clone());
        }
        if let Some(completed) = &body.completed {
            item.completed = completed.clone();
        }
    }
}

#[async_trait]
impl TasksService for FakeTasks {
    async fn list_tasklists(&self, _page_token: Option<&str>) -> Result<TaskListPage, GoogleError> {
        Ok(TaskListPage {
            items: self.lists.lock().unwrap().clone(),
            next_page_token: None,
        })
    }

    async fn insert_tasklist(&self, title: &str) -> Result<TaskList, GoogleError> {
        let list = TaskList {
            id: format!("list-{}", self.next()),
            title: title.to_string(),
            updated: Some(stamp()),
        };
        self.lists.lock().unwrap().push(list.clone());
        Ok(list)
    }

    async fn list_tasks(
        &self,
        _tasklist_id: &str,
        query: &TaskQuery,
    ) -> Result<RemoteTaskPage, GoogleError> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(RemoteTaskPage {
            items: self.items.lock().unwrap().values().cloned().collect(),
            next_page_token: None,
        })
    }

    async fn get_task(&self, _tasklist_id: &str, task_id: &str) -> Result<RemoteTask, GoogleError> {
        self.item(task_id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND))
    }

    async fn insert_task(
        &self,
        _tasklist_id: &str,
        body: &TaskBody,
    ) -> Result<RemoteTask, GoogleError> {
        self.inserts.lock().unwrap().push(body.clone());
        let n = self.next();
        let mut item = RemoteTask {
            id: format!("gt{n}"),
            updated: Some(stamp()),
            etag: Some(format!("etag-{n}")),
            ..RemoteTask::default()
        };
        Self::apply(&mut item, body);
        self.put(item.clone());
        Ok(item)
    }

    async fn patch_task(
        &self,
        _tasklist_id: &str,
        task_id: &str,
        body: &TaskBody,
        if_match: Option<&str>,
    ) -> Result<RemoteTask, GoogleError> {
        self.patches.lock().unwrap().push((
            task_id.to_string(),
            body.clone(),
            if_match.map(str::to_string),
        ));
        if let Some(err) = self.fail_patch.lock().unwrap().take() {
            return Err(err);
        }
        let n = self.next();
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(task_id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND))?;
        Self::apply(item, body);
        item.updated = Some(stamp());
        item.etag = Some(format!("etag-{n}"));
        Ok(item.clone())
    }

    async fn delete_task(&self, _tasklist_id: &str, task_id: &str) -> Result<(), GoogleError> {
        self.deletes.lock().unwrap().push(task_id.to_string());
        if let Some(err) = self.fail_delete.lock().unwrap().take() {
            return Err(err);
        }
        self.items.lock().unwrap().remove(task_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBlobs {
    files: Mutex<HashMap<String, (Value, u64)>>,
}

impl FakeBlobs {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.files.lock().unwrap().get(name).map(|(value, _)| value.clone())
    }

    pub fn put(&self, name: &str, value: Value) {
        let mut files = self.files.lock().unwrap();
        let rev = files.get(name).map(|(_, rev)| rev + 1).unwrap_or(1);
        files.insert(name.to_string(), (value, rev));
    }
}

#[async_trait]
impl BlobStore for FakeBlobs {
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
        let mut files = self.files.lock().unwrap();
        let current = files.get(name).map(|(_, rev)| *rev);
        if let (Some(current), Some(expected)) = (current, if_match)
            && current.to_string() != expected
        {
            return Err(api_error(StatusCode::PRECONDITION_FAILED));
        }
        let rev = current.map(|rev| rev + 1).unwrap_or(1);
        files.insert(name.to_string(), (value.clone(), rev));
        Ok(rev.to_string())
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub store: IndexStore,
    pub calendar: Arc<FakeCalendar>,
    pub tasks: Arc<FakeTasks>,
    pub blobs: Arc<FakeBlobs>,
    _dir: TempDir,
}

pub const DEVICE: &str = "DEVICEA";

pub async fn harness() -> Harness {
    harness_with(SyncSettings::default(), "test-token").await
}

pub async fn harness_with(settings: SyncSettings, token: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();

    let calendar = Arc::new(FakeCalendar::default());
    let tasks = Arc::new(FakeTasks::default());
    let blobs = Arc::new(FakeBlobs::default());
    let remotes = Remotes {
        calendar: calendar.clone(),
        tasks: tasks.clone(),
        blob: Some(blobs.clone() as Arc<dyn BlobStore>),
        credentials: Arc::new(StaticCredentials::new(token)),
    };
    let engine = SyncEngine::new(
        store.clone(),
        remotes,
        CursorStorage::new(dir.path().join("cursor.json")),
        DEVICE,
        settings,
    );
    Harness {
        engine,
        store,
        calendar,
        tasks,
        blobs,
        _dir: dir,
    }
}

pub fn timed_event(id: &str, summary: &str, start: &str, end: &str, updated: &str) -> CalendarEvent {
    CalendarEvent {
        id: id.into(),
        status: Some("confirmed".into()),
        summary: Some(summary.into()),
        description: None,
        start: Some(EventDateTime::at(start)),
        end: Some(EventDateTime::at(end)),
        updated: Some(updated.into()),
        etag: Some(format!("etag-{id}")),
    }
}

pub fn remote_task(id: &str, title: &str, updated: &str) -> RemoteTask {
    RemoteTask {
        id: id.into(),
        title: Some(title.into()),
        status: Some("needsAction".into()),
        updated: Some(updated.into()),
        etag: Some(format!("etag-{id}")),
        ..RemoteTask::default()
    }
}
