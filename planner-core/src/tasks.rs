use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::client::{GoogleClient, GoogleError};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListPage {
    #[serde(default)]
    pub items: Vec<TaskList>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub due: Option<String>,
    #[serde(default)]
    pub completed: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub deleted: Option<bool>,
    #[serde(default)]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl RemoteTask {
    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }

    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed")
    }

    pub fn is_subtask(&self) -> bool {
        self.parent.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTaskPage {
    #[serde(default)]
    pub items: Vec<RemoteTask>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskQuery {
    pub updated_min: Option<String>,
    pub page_token: Option<String>,
    pub show_completed: bool,
    pub show_deleted: bool,
    pub show_hidden: bool,
    pub max_results: Option<u32>,
}

/// Body of insert and patch calls.
///
/// `notes` and `completed` are double options so that `Some(None)` sends an explicit
/// `null`, which is how a completion timestamp is cleared remotely.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<Option<String>>,
}

#[async_trait]
pub trait TasksService: Send + Sync {
    async fn list_tasklists(&self, page_token: Option<&str>) -> Result<TaskListPage, GoogleError>;

    async fn insert_tasklist(&self, title: &str) -> Result<TaskList, GoogleError>;

    /// Finds a tasklist whose title matches case-insensitively, creating it when absent.
    async fn find_or_create_tasklist(&self, title: &str) -> Result<TaskList, GoogleError> {
        let wanted = title.trim().to_lowercase();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_tasklists(page_token.as_deref()).await?;
            if let Some(found) = page
                .items
                .into_iter()
                .find(|list| list.title.trim().to_lowercase() == wanted)
            {
                return Ok(found);
            }
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        self.insert_tasklist(title).await
    }

    async fn list_tasks(
        &self,
        tasklist_id: &str,
        query: &TaskQuery,
    ) -> Result<RemoteTaskPage, GoogleError>;

    async fn get_task(&self, tasklist_id: &str, task_id: &str) -> Result<RemoteTask, GoogleError>;

    async fn insert_task(
        &self,
        tasklist_id: &str,
        body: &TaskBody,
    ) -> Result<RemoteTask, GoogleError>;

    async fn patch_task(
        &self,
        tasklist_id: &str,
        task_id: &str,
        body: &TaskBody,
        if_match: Option<&str>,
    ) -> Result<RemoteTask, GoogleError>;

    /// Deleting a task that is already gone succeeds.
    async fn delete_task(&self, tasklist_id: &str, task_id: &str) -> Result<(), GoogleError>;
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[async_trait]
impl TasksService for GoogleClient {
    async fn list_tasklists(&self, page_token: Option<&str>) -> Result<TaskListPage, GoogleError> {
        let mut url = self.endpoint(&["tasks", "v1", "users", "@me", "lists"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("maxResults", "100");
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self.authorized(self.http().get(url))?.send().await?;
        Self::handle_response(response).await
    }

    async fn insert_tasklist(&self, title: &str) -> Result<TaskList, GoogleError> {
        let url = self.endpoint(&["tasks", "v1", "users", "@me", "lists"])?;
        let body = serde_json::json!({ "title": title });
        let response = self
            .authorized(self.http().post(url).json(&body))?
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn list_tasks(
        &self,
        tasklist_id: &str,
        query: &TaskQuery,
    ) -> Result<RemoteTaskPage, GoogleError> {
        let mut url = self.endpoint(&["tasks", "v1", "lists", tasklist_id, "tasks"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("showCompleted", flag(query.show_completed));
            pairs.append_pair("showDeleted", flag(query.show_deleted));
            pairs.append_pair("showHidden", flag(query.show_hidden));
            if let Some(max_results) = query.max_results {
                pairs.append_pair("maxResults", &max_results.to_string());
            }
            if let Some(updated_min) = &query.updated_min {
                pairs.append_pair("updatedMin", updated_min);
            }
            if let Some(page_token) = &query.page_token {
                pairs.append_pair("pageToken", page_token);
            }
        }
        let response = self.authorized(self.http().get(url))?.send().await?;
        Self::handle_response(response).await
    }

    async fn get_task(&self, tasklist_id: &str, task_id: &str) -> Result<RemoteTask, GoogleError> {
        let url = self.endpoint(&["tasks", "v1", "lists", tasklist_id, "tasks", task_id])?;
        let response = self.authorized(self.http().get(url))?.send().await?;
        Self::handle_response(response).await
    }

    async fn insert_task(
        &self,
        tasklist_id: &str,
        body: &TaskBody,
    ) -> Result<RemoteTask, GoogleError> {
        let url = self.endpoint(&["tasks", "v1", "lists", tasklist_id, "tasks"])?;
        let response = self
            .authorized(self.http().post(url).json(body))?
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn patch_task(
        &self,
        tasklist_id: &str,
        task_id: &str,
        body: &TaskBody,
        if_match: Option<&str>,
    ) -> Result<RemoteTask, GoogleError> {
        let url = self.endpoint(&["tasks", "v1", "lists", tasklist_id, "tasks", task_id])?;
        let mut request = self.http().patch(url).json(body);
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        let response = self.authorized(request)?.send().await?;
        Self::handle_response(response).await
    }

    async fn delete_task(&self, tasklist_id: &str, task_id: &str) -> Result<(), GoogleError> {
        let url = self.endpoint(&["tasks", "v1", "lists", tasklist_id, "tasks", task_id])?;
        let response = self.authorized(self.http().delete(url))?.send().await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Ok(());
        }
        Self::handle_empty(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_null_clears_completed() {
        let body = TaskBody {
            status: Some("needsAction".into()),
            completed: Some(None),
            ..TaskBody::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "needsAction", "completed": null })
        );
    }

    #[test]
    fn subtasks_are_detected_by_parent() {
        let task = RemoteTask {
            id: "t".into(),
            parent: Some("p".into()),
            ..RemoteTask::default()
        };
        assert!(task.is_subtask());
        assert!(!RemoteTask::default().is_subtask());
    }
}
