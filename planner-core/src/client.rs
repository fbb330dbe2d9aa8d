use std::sync::Arc;
use std::time::SystemTime;

use reqwest::{Client, RequestBuilder, StatusCode};
use thiserror::Error;
use url::Url;

use crate::credentials::{CredentialError, CredentialProvider};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";

#[derive(Debug, Error)]
pub enum GoogleError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] CredentialError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("api response is missing field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    /// 410: an expired sync token on list calls, an already-deleted entity elsewhere.
    Gone,
    /// 412: the `If-Match` revision no longer matches the remote entity.
    PreconditionFailed,
    Permanent,
}

#[derive(Clone)]
pub struct GoogleClient {
    http: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl GoogleClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self, GoogleError> {
        Self::with_base_url(DEFAULT_BASE_URL, credentials)
    }

    pub fn with_base_url(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, GoogleError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            credentials,
        })
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Builds `{base}/{segments...}` with every segment percent-encoded.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, GoogleError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    pub(crate) fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, GoogleError> {
        let token = self.credentials.current()?;
        Ok(request.header("Authorization", format!("Bearer {token}")))
    }

    pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GoogleError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub(crate) async fn handle_empty(response: reqwest::Response) -> Result<(), GoogleError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub(crate) async fn api_error(response: reqwest::Response) -> GoogleError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        GoogleError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl GoogleError {
    pub fn api(status: StatusCode, body: impl Into<String>) -> Self {
        GoogleError::Api {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            GoogleError::Api { status, .. } => Some(classify_api_status(*status)),
            GoogleError::Credentials(_) => Some(ApiErrorClass::Auth),
            GoogleError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::NotFound | ApiErrorClass::Gone)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GoogleError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::GONE {
        ApiErrorClass::Gone
    } else if status == StatusCode::PRECONDITION_FAILED {
        ApiErrorClass::PreconditionFailed
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sync_relevant_statuses() {
        assert_eq!(
            GoogleError::api(StatusCode::GONE, "").classification(),
            Some(ApiErrorClass::Gone)
        );
        assert_eq!(
            GoogleError::api(StatusCode::PRECONDITION_FAILED, "").classification(),
            Some(ApiErrorClass::PreconditionFailed)
        );
        assert!(GoogleError::api(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(GoogleError::api(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!GoogleError::api(StatusCode::BAD_REQUEST, "").is_retryable());
        assert!(GoogleError::api(StatusCode::NOT_FOUND, "").is_not_found());
    }

    #[test]
    fn retry_after_accepts_seconds_and_past_dates() {
        assert_eq!(parse_retry_after("7"), Some(7));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(0));
        assert_eq!(parse_retry_after("soon"), None);
    }
}
