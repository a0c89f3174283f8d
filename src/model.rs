use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Json(String),
    MissingField(&'static str),
    UnknownEventType(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "malformed event payload: {msg}"),
            Self::MissingField(field) => write!(f, "event payload missing '{field}'"),
            Self::UnknownEventType(kind) => write!(f, "unknown event type '{kind}'"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Pending,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceTargetState {
    pub id: String,
    #[serde(alias = "service", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_sub_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ServiceTargetState {
    pub fn new(id: &str, service_name: &str) -> Self {
        Self {
            id: id.to_string(),
            service_name: Some(service_name.to_string()),
            ..Self::default()
        }
    }

    pub fn health(&self) -> HealthStatus {
        match self.active {
            None => HealthStatus::Pending,
            Some(true) => HealthStatus::Healthy,
            Some(false) => HealthStatus::Unhealthy,
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub type HealthStateMap = BTreeMap<String, Vec<ServiceState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityEventKind {
    Update,
    Ping,
    Register,
    Deregister,
}

impl CapabilityEventKind {
    pub fn from_frame_name(name: &str) -> Option<Self> {
        match name {
            "UPDATE" => Some(Self::Update),
            "PING" => Some(Self::Ping),
            "REGISTER" => Some(Self::Register),
            "DEREGISTER" => Some(Self::Deregister),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "UPDATE",
            Self::Ping => "PING",
            Self::Register => "REGISTER",
            Self::Deregister => "DEREGISTER",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceTargetEventBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    service_target: Option<ServiceTargetState>,
    #[serde(default)]
    service_state: Option<ServiceState>,
}

/// A capability-state delta, validated at the parse boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    Update {
        id: String,
        state: Option<ServiceState>,
    },
    Ping {
        id: String,
    },
    Register {
        id: String,
        target: ServiceTargetState,
    },
    Deregister {
        id: String,
    },
}

impl CapabilityEvent {
    pub fn parse(kind: CapabilityEventKind, data: &str) -> Result<Self, FrameError> {
        let body: ServiceTargetEventBody = serde_json::from_str(data)?;
        let id = body
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        match kind {
            CapabilityEventKind::Update => Ok(Self::Update {
                id: id.ok_or(FrameError::MissingField("id"))?,
                state: body.service_state,
            }),
            CapabilityEventKind::Ping => Ok(Self::Ping {
                id: id.ok_or(FrameError::MissingField("id"))?,
            }),
            CapabilityEventKind::Deregister => Ok(Self::Deregister {
                id: id.ok_or(FrameError::MissingField("id"))?,
            }),
            CapabilityEventKind::Register => {
                let mut target = body
                    .service_target
                    .ok_or(FrameError::MissingField("serviceTarget"))?;
                if target.id.trim().is_empty() {
                    target.id = id.clone().ok_or(FrameError::MissingField("id"))?;
                }
                Ok(Self::Register {
                    id: id.unwrap_or_else(|| target.id.clone()),
                    target,
                })
            }
        }
    }

    pub fn kind(&self) -> CapabilityEventKind {
        match self {
            Self::Update { .. } => CapabilityEventKind::Update,
            Self::Ping { .. } => CapabilityEventKind::Ping,
            Self::Register { .. } => CapabilityEventKind::Register,
            Self::Deregister { .. } => CapabilityEventKind::Deregister,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Update { id, .. }
            | Self::Ping { id }
            | Self::Register { id, .. }
            | Self::Deregister { id } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionEventType {
    Started,
    Output,
    Completed,
    Failed,
    Error,
}

impl ExecutionEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Output => "OUTPUT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }
}

impl FromStr for ExecutionEventType {
    type Err = FrameError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "started" => Ok(Self::Started),
            "output" => Ok(Self::Output),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            _ => Err(FrameError::UnknownEventType(raw.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionEventBody {
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub event_type: ExecutionEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ExecutionEvent {
    /// Parses a frame body. `fallback` is the type implied by a named frame and
    /// is used only when the body carries no `eventType`.
    pub fn parse(data: &str, fallback: Option<ExecutionEventType>) -> Result<Self, FrameError> {
        let body: ExecutionEventBody = serde_json::from_str(data)?;
        let event_type = match body
            .event_type
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
        {
            Some(kind) => kind.parse()?,
            None => fallback.ok_or(FrameError::MissingField("eventType"))?,
        };

        Ok(Self {
            event_type,
            task_id: body.task_id,
            output: body.output,
            error: body.error,
            message: body.message,
            exit_code: body.exit_code,
            status: body.status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallEventType {
    Started,
    Completed,
    Failed,
}

impl ToolCallEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ToolCallEventType {
    type Err = FrameError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(FrameError::UnknownEventType(raw.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for ToolCallEventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Failure class of a tool call. The router sends the upper-case constant
/// name; any casing is accepted and unrecognized names become `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    None,
    ServiceUnavailable,
    ToolDefinitionError,
    InvalidArguments,
    ExecutionError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ToolDefinitionError => "TOOL_DEFINITION_ERROR",
            Self::InvalidArguments => "INVALID_ARGUMENTS",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NONE" => Self::None,
            "SERVICE_UNAVAILABLE" => Self::ServiceUnavailable,
            "TOOL_DEFINITION_ERROR" => Self::ToolDefinitionError,
            "INVALID_ARGUMENTS" => Self::InvalidArguments,
            "EXECUTION_ERROR" => Self::ExecutionError,
            _ => Self::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for ErrorCategory {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub event_id: String,
    pub event_type: ToolCallEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(
        rename = "configurationURI",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub configuration_uri: Option<String>,
    #[serde(rename = "secretsURI", default, skip_serializing_if = "Option::is_none")]
    pub secrets_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl ToolCallEvent {
    pub fn parse(data: &str) -> Result<Self, FrameError> {
        let event: Self = serde_json::from_str(data)?;
        if event.event_id.trim().is_empty() {
            return Err(FrameError::MissingField("eventId"));
        }
        Ok(event)
    }

    pub fn started(event_id: &str, tool_name: &str, connection_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            event_type: ToolCallEventType::Started,
            timestamp: None,
            tool_name: Some(tool_name.to_string()),
            tool_type: None,
            connection_id: Some(connection_id.to_string()),
            service_id: None,
            service_address: None,
            arguments: None,
            headers: None,
            body: None,
            configuration_uri: None,
            secrets_uri: None,
            is_error: None,
            content: None,
            duration: None,
            error_category: None,
            error_message: None,
            error_details: None,
        }
    }

    /// Overlays every field present in `update`. The event id never changes.
    pub fn merge_from(&mut self, update: &ToolCallEvent) {
        fn overlay<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        self.event_type = update.event_type;
        overlay(&mut self.timestamp, &update.timestamp);
        overlay(&mut self.tool_name, &update.tool_name);
        overlay(&mut self.tool_type, &update.tool_type);
        overlay(&mut self.connection_id, &update.connection_id);
        overlay(&mut self.service_id, &update.service_id);
        overlay(&mut self.service_address, &update.service_address);
        overlay(&mut self.arguments, &update.arguments);
        overlay(&mut self.headers, &update.headers);
        overlay(&mut self.body, &update.body);
        overlay(&mut self.configuration_uri, &update.configuration_uri);
        overlay(&mut self.secrets_uri, &update.secrets_uri);
        overlay(&mut self.is_error, &update.is_error);
        overlay(&mut self.content, &update.content);
        overlay(&mut self.duration, &update.duration);
        overlay(&mut self.error_category, &update.error_category);
        overlay(&mut self.error_message, &update.error_message);
        overlay(&mut self.error_details, &update.error_details);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardReference {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub error: Option<Value>,
}
