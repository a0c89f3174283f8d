use std::fmt;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ConsoleConfig;
use crate::model::{ApiResponse, ForwardReference, HealthStateMap, Namespace, ServiceTargetState};
use crate::sse::EventStreamClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    Transport(String),
    Status { status: u16, body: String },
    Decode(String),
    Envelope(String),
    MissingData,
    MissingField(&'static str),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "router request failed: {msg}"),
            Self::Status { status, body } if body.is_empty() => {
                write!(f, "unexpected response status: {status}")
            }
            Self::Status { status, body } => {
                write!(f, "unexpected response status: {status}: {body}")
            }
            Self::Decode(msg) => write!(f, "malformed router response: {msg}"),
            Self::Envelope(msg) => write!(f, "router reported an error: {msg}"),
            Self::MissingData => write!(f, "router response carried no data"),
            Self::MissingField(field) => write!(f, "response missing {field} field"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Accepted code-execution task, as returned by the submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTicket {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub stream_url: Option<String>,
}

/// REST boundary to the router's management API.
#[derive(Debug, Clone)]
pub struct RouterClient {
    http: reqwest::Client,
    streams: EventStreamClient,
    config: ConsoleConfig,
}

impl RouterClient {
    pub fn new(config: ConsoleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to construct reqwest client for router api")?;
        // Streams stay open indefinitely, so no whole-request timeout here.
        let stream_http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to construct reqwest client for event streams")?;

        Ok(Self {
            http,
            streams: EventStreamClient::new(stream_http, config.connect_timeout),
            config,
        })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn streams(&self) -> &EventStreamClient {
        &self.streams
    }

    pub async fn list_capabilities(&self) -> Result<Vec<ServiceTargetState>, ApiError> {
        self.get_enveloped(&self.config.capabilities_url()).await
    }

    pub async fn tools_state(&self) -> Result<HealthStateMap, ApiError> {
        self.get_enveloped(&self.config.tools_state_url()).await
    }

    pub async fn resources_state(&self) -> Result<HealthStateMap, ApiError> {
        self.get_enveloped(&self.config.resources_state_url()).await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>, ApiError> {
        self.get_enveloped(&self.config.namespaces_url()).await
    }

    pub async fn list_forwards(&self) -> Result<Vec<ForwardReference>, ApiError> {
        self.get_enveloped(&self.config.forwards_url()).await
    }

    /// Posts a code-execution request. Only `201 Created` with a non-empty
    /// `streamUrl` counts as accepted.
    pub async fn submit_code(
        &self,
        engine_type: &str,
        language: &str,
        payload: &Value,
    ) -> Result<ExecutionTicket, ApiError> {
        let url = self.config.code_execution_url(engine_type, language);
        debug!(url = %url, "submitting code execution request");

        let response = self.http.post(&url).json(payload).send().await?;
        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), "code execution submission rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let body = response.bytes().await?;
        let ticket: ExecutionTicket =
            serde_json::from_slice(&body).map_err(|err| ApiError::Decode(err.to_string()))?;
        if ticket
            .stream_url
            .as_deref()
            .is_none_or(|url| url.trim().is_empty())
        {
            return Err(ApiError::MissingField("streamUrl"));
        }
        Ok(ticket)
    }

    async fn get_enveloped<T>(&self, url: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let body = response.bytes().await?;
        let envelope: ApiResponse<T> =
            serde_json::from_slice(&body).map_err(|err| ApiError::Decode(err.to_string()))?;
        unwrap_envelope(envelope)
    }
}

fn unwrap_envelope<T>(envelope: ApiResponse<T>) -> Result<T, ApiError> {
    if let Some(error) = envelope.error.filter(|error| !error.is_null()) {
        let message = match &error {
            Value::String(message) => message.clone(),
            Value::Object(fields) => fields
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        return Err(ApiError::Envelope(message));
    }
    envelope.data.ok_or(ApiError::MissingData)
}
