//! Task backend: where tasks come from and where failure reports go.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;

use crate::brain::AiConfig;
use crate::error::TransportError;
use crate::types::{FailureReport, Task};

const NEXT_TASK_PATH: &str = "auth/agent/tasks/next";
const AI_CONFIG_PATH: &str = "auth/agent/ai-config";
const FAILURE_REPORT_PATH: &str = "auth/agent/failure-reports";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait Backend: Send + Sync {
    /// The next queued task, or `None` when the queue is empty.
    async fn next_task(&self) -> Result<Option<Task>, TransportError>;

    /// Which completion provider tasks should run with.
    async fn ai_config(&self) -> Result<AiConfig, TransportError>;

    /// Single fire-and-forget write; callers do not retry.
    async fn submit_failure_report(&self, report: &FailureReport) -> Result<(), TransportError>;
}

/// reqwest client for the agent API, authenticated with a bearer token.
pub struct HttpBackend {
    client: Client,
    base: Url,
    token: Option<String>,
    ai_override: Option<AiConfig>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, TransportError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            token,
            ai_override: None,
        })
    }

    /// Serve this AI configuration locally instead of asking the backend.
    pub fn with_ai_override(mut self, config: Option<AiConfig>) -> Self {
        self.ai_override = config;
        self
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        Ok(self.base.join(path)?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = self.authorize(request).send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TransportError::Unauthorized {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Decode a body that may legitimately be empty or `null`.
fn decode_optional<T: DeserializeOwned>(body: &str) -> Result<Option<T>, TransportError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| TransportError::Decode(e.to_string()))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn next_task(&self) -> Result<Option<Task>, TransportError> {
        let response = self.send(self.client.get(self.url(NEXT_TASK_PATH)?)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            debug!("task queue empty");
            return Ok(None);
        }
        let body = response.text().await?;
        decode_optional(&body)
    }

    async fn ai_config(&self) -> Result<AiConfig, TransportError> {
        if let Some(config) = &self.ai_override {
            return Ok(config.clone());
        }
        let response = self.send(self.client.get(self.url(AI_CONFIG_PATH)?)).await?;
        let body = response.text().await?;
        decode_optional(&body)?
            .ok_or_else(|| TransportError::Decode("empty AI configuration".to_string()))
    }

    async fn submit_failure_report(&self, report: &FailureReport) -> Result<(), TransportError> {
        let request = self
            .client
            .post(self.url(FAILURE_REPORT_PATH)?)
            .json(report);
        self.send(request).await?;
        info!(failed_action = %report.failed_action, "failure report accepted");
        Ok(())
    }
}
