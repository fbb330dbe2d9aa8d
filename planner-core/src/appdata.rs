use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::client::{GoogleClient, GoogleError};

/// A JSON document read from the application data folder, with the revision to pass
/// back as `If-Match` on the next write.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub value: Value,
    pub revision: Option<String>,
}

/// Small per-user JSON documents shared by every device of the account.
///
/// A write with `if_match` fails with a 412 `GoogleError::Api` when another device wrote
/// in between; callers re-read, merge and retry.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<Option<Blob>, GoogleError>;

    async fn write(
        &self,
        name: &str,
        value: &Value,
        if_match: Option<&str>,
    ) -> Result<String, GoogleError>;
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

impl GoogleClient {
    async fn find_appdata_file(&self, name: &str) -> Result<Option<DriveFile>, GoogleError> {
        let mut url = self.endpoint(&["drive", "v3", "files"])?;
        url.query_pairs_mut()
            .append_pair("spaces", "appDataFolder")
            .append_pair("q", &format!("name = '{}'", name.replace('\'', "\\'")))
            .append_pair("fields", "files(id,name,version)")
            .append_pair("pageSize", "10");
        let response = self.authorized(self.http().get(url))?.send().await?;
        let list: DriveFileList = Self::handle_response(response).await?;
        Ok(list.files.into_iter().next())
    }

    async fn create_appdata_file(&self, name: &str) -> Result<DriveFile, GoogleError> {
        let mut url = self.endpoint(&["drive", "v3", "files"])?;
        url.query_pairs_mut().append_pair("fields", "id,version");
        let body = serde_json::json!({ "name": name, "parents": ["appDataFolder"] });
        let response = self
            .authorized(self.http().post(url).json(&body))?
            .send()
            .await?;
        Self::handle_response(response).await
    }
}

fn etag_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("ETag")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl BlobStore for GoogleClient {
    async fn read(&self, name: &str) -> Result<Option<Blob>, GoogleError> {
        let Some(file) = self.find_appdata_file(name).await? else {
            return Ok(None);
        };
        let mut url = self.endpoint(&["drive", "v3", "files", &file.id])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self.authorized(self.http().get(url))?.send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let revision = etag_of(&response).or(file.version);
        let text = response.text().await?;
        // An empty or unreadable document is treated as a fresh one.
        let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
        Ok(Some(Blob { value, revision }))
    }

    async fn write(
        &self,
        name: &str,
        value: &Value,
        if_match: Option<&str>,
    ) -> Result<String, GoogleError> {
        let file = match self.find_appdata_file(name).await? {
            Some(file) => file,
            None => self.create_appdata_file(name).await?,
        };
        let mut url = self.endpoint(&["upload", "drive", "v3", "files", &file.id])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("fields", "id,version");
        let mut request = self
            .http()
            .patch(url)
            .header("Content-Type", "application/json")
            .body(value.to_string());
        if let Some(etag) = if_match {
            request = request.header("If-Match", etag);
        }
        let response = self.authorized(request)?.send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let header = etag_of(&response);
        let updated: DriveFile = response.json().await?;
        header
            .or(updated.version)
            .ok_or(GoogleError::MissingField("version"))
    }
}
