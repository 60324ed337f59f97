//! HTTP implementation of `WorkflowTransport` on top of a blocking `ureq` agent.
//!
//! Each call runs on tokio's blocking pool so the poll loop never blocks a
//! runtime worker.

use super::WorkflowTransport;
use crate::config::ClientConfig;
use crate::errors::TransportError;
use crate::model::{AgentStatusBatch, EmailDetails, Workflow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Talks to the workflow service REST API under `{api_url}/api/`.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: Url,
    token: Option<String>,
}

impl HttpTransport {
    /// Creates a transport from client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `api_url` is not an absolute http(s) URL.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_base_url(
            &config.api_url,
            config.api_token.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    /// Creates a transport for an explicit base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` cannot be parsed or cannot carry a path.
    pub fn with_base_url(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid API URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("API URL cannot carry a path: {}", base_url);
        }

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Ok(Self {
            agent,
            base_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Builds `{base}/api/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Network {
                message: format!("API URL cannot carry a path: {}", self.base_url),
            })?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    async fn get<T>(&self, url: Url) -> Result<T, TransportError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let body = self.execute(url, Method::Get).await?;
        decode(&body)
    }

    async fn post(&self, url: Url, body: Option<serde_json::Value>) -> Result<(), TransportError> {
        self.execute(url, Method::Post(body)).await.map(|_| ())
    }

    async fn execute(&self, url: Url, method: Method) -> Result<String, TransportError> {
        let agent = self.agent.clone();
        let token = self.token.clone();
        tracing::debug!(url = %url, method = method.name(), "workflow service request");

        tokio::task::spawn_blocking(move || send_blocking(&agent, &url, token.as_deref(), method))
            .await
            .map_err(|e| TransportError::Network {
                message: format!("transport task failed: {}", e),
            })?
    }
}

enum Method {
    Get,
    Post(Option<serde_json::Value>),
}

impl Method {
    fn name(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post(_) => "POST",
        }
    }
}

fn send_blocking(
    agent: &ureq::Agent,
    url: &Url,
    token: Option<&str>,
    method: Method,
) -> Result<String, TransportError> {
    let bearer = token.map(|t| format!("Bearer {}", t));

    let result = match method {
        Method::Get => {
            let mut request = agent.get(url.as_str()).header("Accept", "application/json");
            if let Some(bearer) = &bearer {
                request = request.header("Authorization", bearer);
            }
            request.call()
        }
        Method::Post(body) => {
            let mut request = agent.post(url.as_str()).header("Accept", "application/json");
            if let Some(bearer) = &bearer {
                request = request.header("Authorization", bearer);
            }
            match body {
                Some(body) => {
                    let json = serde_json::to_string(&body).map_err(|e| TransportError::Decode {
                        message: format!("failed to encode request: {}", e),
                    })?;
                    request
                        .header("Content-Type", "application/json")
                        .send(json.as_str())
                }
                None => request.send_empty(),
            }
        }
    };

    let mut response = result.map_err(|e| TransportError::Network {
        message: e.to_string(),
    })?;
    let status = response.status().as_u16();
    let text = response
        .body_mut()
        .read_to_string()
        .map_err(|e| TransportError::Network {
            message: format!("failed to read response: {}", e),
        })?;

    match status {
        200..=299 => Ok(text),
        401 => Err(TransportError::Unauthorized),
        _ => Err(TransportError::Http {
            status,
            message: error_message(&text),
        }),
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, TransportError> {
    serde_json::from_str(body).map_err(|e| TransportError::Decode {
        message: e.to_string(),
    })
}

/// Pulls a human-readable message out of an error body.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "message", "detail"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl WorkflowTransport for HttpTransport {
    async fn fetch_workflow_status(&self, workflow_id: &str) -> Result<Workflow, TransportError> {
        let url = self.endpoint(&["workflows", workflow_id])?;
        self.get(url).await
    }

    async fn fetch_agent_status(
        &self,
        session_id: &str,
        since: Option<&str>,
    ) -> Result<AgentStatusBatch, TransportError> {
        let mut url = self.endpoint(&["agents", session_id, "status"])?;
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", since);
        }
        self.get(url).await
    }

    async fn confirm_step(&self, workflow_id: &str, confirmed: bool) -> Result<(), TransportError> {
        let url = self.endpoint(&["workflows", workflow_id, "confirm"])?;
        self.post(url, Some(serde_json::json!({ "confirmed": confirmed })))
            .await
    }

    async fn send_email(&self, step_id: &str) -> Result<(), TransportError> {
        let url = self.endpoint(&["steps", step_id, "email", "send"])?;
        self.post(url, None).await
    }

    async fn reject_email(&self, step_id: &str) -> Result<(), TransportError> {
        let url = self.endpoint(&["steps", step_id, "email", "reject"])?;
        self.post(url, None).await
    }

    async fn select_job(&self, workflow_id: &str, selected_key: &str) -> Result<(), TransportError> {
        let url = self.endpoint(&["workflows", workflow_id, "select-job"])?;
        self.post(url, Some(serde_json::json!({ "selectedKey": selected_key })))
            .await
    }

    async fn inject_user_context(&self, workflow_id: &str) -> Result<(), TransportError> {
        let url = self.endpoint(&["workflows", workflow_id, "inject-context"])?;
        self.post(url, None).await
    }

    async fn get_step_email(&self, step_id: &str) -> Result<EmailDetails, TransportError> {
        let url = self.endpoint(&["steps", step_id, "email"])?;
        self.get(url).await
    }

    async fn get_step_email_body(&self, step_id: &str) -> Result<String, TransportError> {
        let url = self.endpoint(&["steps", step_id, "email", "body"])?;
        let text = self.execute(url, Method::Get).await?;
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => match value.get("body").and_then(|b| b.as_str()) {
                Some(body) => Ok(body.to_string()),
                None => Err(TransportError::Decode {
                    message: "email body response has no 'body' field".to_string(),
                }),
            },
            // Plain-text bodies are accepted as-is.
            Err(_) => Ok(text),
        }
    }
}

#[cfg(test)]
#[path = "../tests/http_transport_tests.rs"]
mod tests;
