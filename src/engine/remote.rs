// src/engine/remote.rs

//! Client side of the server contracts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::models::session::{
    ExamContent, ProgressRequest, ProgressResponse, ViolationAck, ViolationReport,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The server could not be reached or the request timed out.
    #[error("network error: {0}")]
    Network(String),

    /// The bearer identity is no longer accepted.
    #[error("identity rejected by server")]
    Unauthorized,

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Worth retrying later without changing the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Unauthorized | Self::Decode(_) => false,
        }
    }

    /// The session refuses writes; on a live attempt this means it is locked.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Rejected { status: 403, .. })
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

/// The server operations a live attempt depends on.
#[async_trait]
pub trait ExamRemote: Send + Sync + 'static {
    /// Exam content fetch. Also serves as the unlock check.
    async fn fetch_content(
        &self,
        exam_id: i64,
        access_token: Option<&str>,
    ) -> Result<ExamContent, RemoteError>;

    /// Progress persist; `finished = true` is the submission.
    async fn persist_progress(
        &self,
        session_id: i64,
        request: &ProgressRequest,
    ) -> Result<ProgressResponse, RemoteError>;

    async fn report_violation(
        &self,
        session_id: i64,
        report: &ViolationReport,
    ) -> Result<ViolationAck, RemoteError>;
}

/// [`ExamRemote`] over the JSON HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base: Url,
    bearer: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, bearer: impl Into<String>) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url).map_err(|e| RemoteError::Decode(e.to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base,
            bearer: bearer.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthorized);
        }

        // Error bodies look like {"error": "..."}
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body["error"].as_str().map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ExamRemote for HttpRemote {
    async fn fetch_content(
        &self,
        exam_id: i64,
        access_token: Option<&str>,
    ) -> Result<ExamContent, RemoteError> {
        let mut url = self.endpoint(&format!("/api/exams/{exam_id}/session"))?;
        if let Some(token) = access_token {
            url.query_pairs_mut().append_pair("token", token);
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.bearer)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn persist_progress(
        &self,
        session_id: i64,
        request: &ProgressRequest,
    ) -> Result<ProgressResponse, RemoteError> {
        let url = self.endpoint(&format!("/api/sessions/{session_id}/progress"))?;
        let response = self
            .client
            .put(url)
            .bearer_auth(&self.bearer)
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn report_violation(
        &self,
        session_id: i64,
        report: &ViolationReport,
    ) -> Result<ViolationAck, RemoteError> {
        let url = self.endpoint(&format!("/api/sessions/{session_id}/violations"))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.bearer)
            .json(report)
            .send()
            .await?;
        Self::decode(response).await
    }
}
