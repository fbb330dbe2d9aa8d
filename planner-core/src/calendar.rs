use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::client::{GoogleClient, GoogleError};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventDateTime {
    pub fn at(date_time: impl Into<String>) -> Self {
        Self {
            date_time: Some(date_time.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<EventDateTime>,
    #[serde(default)]
    pub end: Option<EventDateTime>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl CalendarEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    #[serde(default)]
    pub items: Vec<CalendarEvent>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub next_sync_token: Option<String>,
}

/// Parameters of `events.list`. `sync_token` and `time_min` are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub time_min: Option<String>,
    pub sync_token: Option<String>,
    pub page_token: Option<String>,
    pub show_deleted: bool,
    pub max_results: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<EventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<EventDateTime>,
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn list_events(
        &self,
        calendar_id: &str,
        query: &EventQuery,
    ) -> Result<EventPage, GoogleError>;

    async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, GoogleError>;

    async fn insert_event(
        &self,
        calendar_id: &str,
        body: &EventBody,
    ) -> Result<CalendarEvent, GoogleError>;

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        body: &EventBody,
        if_match: Option<&str>,
    ) -> Result<CalendarEvent, GoogleError>;

    /// Deleting an event that is already gone succeeds.
    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), GoogleError>;
}

#[async_trait]
impl CalendarService for GoogleClient {
    async fn list_events(
        &self,
        calendar_id: &str,
        query: &EventQuery,
    ) -> Result<EventPage, GoogleError> {
        let mut url = self.endpoint(&["calendar", "v3", "calendars", calendar_id, "events"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("singleEvents", "true");
            pairs.append_pair(
                "showDeleted",
                if query.show_deleted { "true" } else { "false" },
            );
            if let Some(max_results) = query.max_results {
                pairs.append_pair("maxResults", &max_results.to_string());
            }
            if let Some(sync_token) = &query.sync_token {
                pairs.append_pair("syncToken", sync_token);
            } else if let Some(time_min) = &query.time_min {
                pairs.append_pair("timeMin", time_min);
            }
            if let Some(page_token) = &query.page_token {
                pairs.append_pair("pageToken", page_token);
            }
        }
        let response = self.authorized(self.http().get(url))?.send().await?;
        Self::handle_response(response).await
    }

    async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, GoogleError> {
        let url = self.endpoint(&[
            "calendar",
            "v3",
            "calendars",
            calendar_id,
            "events",
            event_id,
        ])?;
        let response = self.authorized(self.http().get(url))?.send().await?;
        Self::handle_response(response).await
    }

    async fn insert_event(
        &self,
        calendar_id: &str,
        body: &EventBody,
    ) -> Result<CalendarEvent, GoogleError> {
        let url = self.endpoint(&["calendar", "v3", "calendars", calendar_id, "events"])?;
        let response = self
            .authorized(self.http().post(url).json(body))?
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        body: &EventBody,
        if_match: Option<&str>,
    ) -> Result<CalendarEvent, GoogleError> {
        let url = self.endpoint(&[
            "calendar",
            "v3",
            "calendars",
            calendar_id,
            "events",
            event_id,
        ])?;
        let mut request = self.http().patch(url).json(body);
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        let response = self.authorized(request)?.send().await?;
        Self::handle_response(response).await
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), GoogleError> {
        let url = self.endpoint(&[
            "calendar",
            "v3",
            "calendars",
            calendar_id,
            "events",
            event_id,
        ])?;
        let response = self.authorized(self.http().delete(url))?.send().await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Ok(());
        }
        Self::handle_empty(response).await
    }
}
