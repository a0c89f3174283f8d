use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Local};
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{ApiError, RouterClient};
use crate::model::{ExecutionEvent, ExecutionEventType, FrameError, ServiceTargetState};
use crate::notices::NoticeBoard;
use crate::sse::{EventStream, StreamEvent, StreamFrame};

pub const MIN_TIMEOUT_SECS: u32 = 1;
pub const MAX_TIMEOUT_SECS: u32 = 300;
pub const DEFAULT_TIMEOUT_SECS: u32 = 30;

const CODE_EXECUTION_SERVICE_TYPE: &str = "code-execution-engine";
const UNKNOWN_ENGINE_TYPE: &str = "unknown";
const DEFAULT_ENGINE_TYPE: &str = "interpreted";
const DEFAULT_LANGUAGE: &str = "python";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    Invalid(String),
    Busy,
    Rejected { status: u16 },
    MissingStreamUrl,
    InvalidStreamUrl(String),
    Transport(String),
}

impl fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "{msg}"),
            Self::Busy => write!(f, "an execution is already in progress"),
            Self::Rejected { status } => write!(f, "Unexpected response status: {status}"),
            Self::MissingStreamUrl => write!(f, "Response missing streamUrl field"),
            Self::InvalidStreamUrl(msg) => write!(f, "invalid stream url: {msg}"),
            Self::Transport(msg) => write!(f, "Failed to execute code: {msg}"),
        }
    }
}

impl std::error::Error for SubmissionError {}

impl From<ApiError> for SubmissionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Status { status, .. } => Self::Rejected { status },
            ApiError::MissingField(_) => Self::MissingStreamUrl,
            other => Self::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub engine_type: String,
    pub language: String,
    pub code: String,
    pub timeout_secs: u32,
}

impl ExecutionRequest {
    pub fn new(engine_type: &str, language: &str, code: &str) -> Self {
        Self {
            engine_type: engine_type.to_string(),
            language: language.to_string(),
            code: code.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.engine_type.trim().is_empty() {
            return Err(SubmissionError::Invalid(
                "engine type is required".to_string(),
            ));
        }
        if self.language.trim().is_empty() {
            return Err(SubmissionError::Invalid("language is required".to_string()));
        }
        if self.code.trim().is_empty() {
            return Err(SubmissionError::Invalid("code is required".to_string()));
        }
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(SubmissionError::Invalid(format!(
                "timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds"
            )));
        }
        Ok(())
    }

    pub fn payload(&self) -> Value {
        json!({
            "code": STANDARD.encode(self.code.as_bytes()),
            "timeout": self.timeout_secs,
            "arguments": [],
            "environment": Map::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Submitting,
    Streaming,
    Completed,
    Failed,
    Stopped,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitting | Self::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedExecutionEvent {
    pub event: ExecutionEvent,
    pub received_at: DateTime<Local>,
}

impl LoggedExecutionEvent {
    pub fn render(&self) -> String {
        let event = &self.event;
        let exit_code = || {
            event
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "N/A".to_string())
        };
        match event.event_type {
            ExecutionEventType::Started => format!(
                "[STARTED] {} (Task: {})",
                non_empty(&event.message).unwrap_or("Execution started"),
                event.task_id.as_deref().unwrap_or_default()
            ),
            ExecutionEventType::Completed => format!(
                "[COMPLETED] {} (Exit code: {})",
                non_empty(&event.message).unwrap_or("Execution finished"),
                exit_code()
            ),
            ExecutionEventType::Failed => format!(
                "[FAILED] {} (Exit code: {})",
                non_empty(&event.message).unwrap_or("Execution failed"),
                exit_code()
            ),
            ExecutionEventType::Error => format!(
                "[ERROR] {}",
                non_empty(&event.error)
                    .or_else(|| non_empty(&event.message))
                    .unwrap_or("Unknown error")
            ),
            ExecutionEventType::Output => event.output.clone().unwrap_or_default(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Appended,
    Terminal(ExecutionEventType),
    Dropped(FrameError),
    Unhandled,
}

/// Append-only, receipt-ordered execution log. Never deduplicates and never
/// reorders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionLog {
    entries: Vec<LoggedExecutionEvent>,
}

impl ExecutionLog {
    pub fn entries(&self) -> &[LoggedExecutionEvent] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn rendered(&self) -> Vec<String> {
        self.entries.iter().map(LoggedExecutionEvent::render).collect()
    }

    pub fn ingest(&mut self, frame: &StreamFrame, received_at: DateTime<Local>) -> FrameOutcome {
        let named = match frame.event_name() {
            Some(name) => match name.parse::<ExecutionEventType>() {
                Ok(kind) if name == kind.as_str() => Some(kind),
                _ => {
                    debug!(event = name, "ignoring frame without an execution handler");
                    return FrameOutcome::Unhandled;
                }
            },
            None => None,
        };

        let event = match ExecutionEvent::parse(&frame.data, named) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = ?frame.event, error = %err, "dropping malformed execution frame");
                return FrameOutcome::Dropped(err);
            }
        };

        let classified = named.unwrap_or(event.event_type);
        self.entries.push(LoggedExecutionEvent { event, received_at });

        if classified.is_terminal() {
            FrameOutcome::Terminal(classified)
        } else {
            FrameOutcome::Appended
        }
    }
}

/// Cloneable stop trigger for whichever run is in flight when it fires.
#[derive(Debug, Clone)]
pub struct SessionStopper {
    requests: Arc<watch::Sender<u64>>,
}

impl SessionStopper {
    pub fn stop(&self) {
        self.requests.send_modify(|count| *count = count.wrapping_add(1));
    }
}

/// Drives one remote execution at a time:
/// `Idle -> Submitting -> Streaming -> {Completed | Failed | Stopped}`.
#[derive(Debug)]
pub struct ExecutionSession {
    client: RouterClient,
    notices: NoticeBoard,
    state: SessionState,
    task_id: Option<String>,
    log: ExecutionLog,
    stream: Option<EventStream>,
    stop_requests: Arc<watch::Sender<u64>>,
    stop_rx: watch::Receiver<u64>,
}

impl ExecutionSession {
    pub fn new(client: RouterClient, notices: NoticeBoard) -> Self {
        let (stop_requests, stop_rx) = watch::channel(0);
        Self {
            client,
            notices,
            state: SessionState::Idle,
            task_id: None,
            log: ExecutionLog::default(),
            stream: None,
            stop_requests: Arc::new(stop_requests),
            stop_rx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream.as_ref().is_some_and(|stream| !stream.is_closed())
    }

    pub fn stopper(&self) -> SessionStopper {
        SessionStopper {
            requests: Arc::clone(&self.stop_requests),
        }
    }

    pub async fn execute(&mut self, request: &ExecutionRequest) -> Result<(), SubmissionError> {
        if self.state.is_active() {
            return Err(SubmissionError::Busy);
        }
        if let Err(err) = request.validate() {
            self.notices.error("Error", err.to_string());
            return Err(err);
        }

        self.close_stream();
        self.log.clear();
        self.task_id = None;
        // Stop requests fired before this run do not carry over.
        self.stop_rx = self.stop_requests.subscribe();
        self.state = SessionState::Submitting;

        match self.submit(request).await {
            Ok((task_id, stream_url)) => {
                info!(task_id = ?task_id, url = %stream_url, "execution accepted, opening stream");
                self.task_id = task_id;
                self.stream = Some(self.client.streams().open(&stream_url));
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "code execution submission failed");
                self.state = SessionState::Idle;
                self.notices.error("Error", err.to_string());
                Err(err)
            }
        }
    }

    async fn submit(
        &self,
        request: &ExecutionRequest,
    ) -> Result<(Option<String>, String), SubmissionError> {
        let ticket = self
            .client
            .submit_code(&request.engine_type, &request.language, &request.payload())
            .await?;
        let stream_url = ticket
            .stream_url
            .as_deref()
            .ok_or(SubmissionError::MissingStreamUrl)?;
        let resolved = self
            .client
            .config()
            .resolve_stream_url(stream_url)
            .map_err(|err| SubmissionError::InvalidStreamUrl(format!("{err:#}")))?;
        Ok((ticket.task_id, resolved))
    }

    pub async fn run_to_end(&mut self) -> SessionState {
        while self.state == SessionState::Streaming {
            self.step().await;
        }
        self.state
    }

    pub async fn step(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            if self.state == SessionState::Streaming {
                self.finish(SessionState::Stopped);
            }
            return;
        };

        let next = tokio::select! {
            biased;

            _ = self.stop_rx.changed() => None,
            next = stream.next() => Some(next),
        };
        let Some(next) = next else {
            self.stop();
            return;
        };

        match next {
            Some(StreamEvent::Opened) => debug!("execution stream opened"),
            Some(StreamEvent::Frame(frame)) => {
                self.handle_frame(&frame);
            }
            Some(StreamEvent::TransportError(err)) => {
                self.notices
                    .error("Error", format!("Execution stream error: {err}"));
                self.finish(SessionState::Stopped);
            }
            Some(StreamEvent::Ended) | None => {
                self.notices.warning(
                    "Warning",
                    "Execution stream closed before a terminal event",
                );
                self.finish(SessionState::Stopped);
            }
        }
    }

    pub fn handle_frame(&mut self, frame: &StreamFrame) -> FrameOutcome {
        if self.state != SessionState::Streaming {
            return FrameOutcome::Unhandled;
        }

        let outcome = self.log.ingest(frame, Local::now());
        if let FrameOutcome::Terminal(kind) = &outcome {
            let next = match kind {
                ExecutionEventType::Completed => SessionState::Completed,
                _ => SessionState::Failed,
            };
            self.finish(next);
        }
        outcome
    }

    pub fn stop(&mut self) {
        if self.state.is_active() {
            info!(task_id = ?self.task_id, "execution stopped");
            self.finish(SessionState::Stopped);
        } else {
            self.close_stream();
        }
    }

    fn finish(&mut self, state: SessionState) {
        self.close_stream();
        self.state = state;
        debug!(task_id = ?self.task_id, state = ?state, "execution session ended");
    }

    fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        self.close_stream();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCatalog {
    engines: Vec<(String, Vec<String>)>,
}

impl EngineCatalog {
    pub fn builtin() -> Self {
        let group = |engine: &str, languages: &[&str]| {
            (
                engine.to_string(),
                languages.iter().map(|lang| lang.to_string()).collect(),
            )
        };
        Self {
            engines: vec![
                group("jvm", &["java", "kotlin", "scala"]),
                group("interpreted", &["python", "javascript", "ruby"]),
                group("native", &["go", "rust"]),
            ],
        }
    }

    pub fn from_capabilities(services: &[ServiceTargetState]) -> Option<Self> {
        let mut engines: Vec<(String, Vec<String>)> = Vec::new();

        for service in services {
            if service.service_type.as_deref() != Some(CODE_EXECUTION_SERVICE_TYPE) {
                continue;
            }
            let Some(language) = service
                .language_name
                .as_deref()
                .map(str::trim)
                .filter(|lang| !lang.is_empty())
            else {
                continue;
            };

            let engine = service
                .service_sub_type
                .as_deref()
                .filter(|sub_type| !sub_type.is_empty())
                .unwrap_or(UNKNOWN_ENGINE_TYPE);
            let language = language.to_lowercase();

            let index = match engines.iter().position(|(name, _)| name == engine) {
                Some(index) => index,
                None => {
                    engines.push((engine.to_string(), Vec::new()));
                    engines.len() - 1
                }
            };
            let languages = &mut engines[index].1;
            if !languages.contains(&language) {
                languages.push(language);
            }
        }

        (!engines.is_empty()).then_some(Self { engines })
    }

    pub async fn discover(client: &RouterClient, notices: &NoticeBoard) -> Self {
        match client.list_capabilities().await {
            Ok(services) => Self::from_capabilities(&services).unwrap_or_else(|| {
                warn!("no code execution engines registered, using built-in catalog");
                Self::builtin()
            }),
            Err(err) => {
                warn!(error = %err, "failed to load code execution engines");
                notices.error(
                    "Error",
                    "Failed to load available engines. Using default configuration.",
                );
                Self::builtin()
            }
        }
    }

    pub fn engine_types(&self) -> Vec<&str> {
        self.engines.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn languages(&self, engine_type: &str) -> &[String] {
        self.engines
            .iter()
            .find(|(name, _)| name == engine_type)
            .map(|(_, languages)| languages.as_slice())
            .unwrap_or_default()
    }

    pub fn default_selection(&self) -> Option<(&str, &str)> {
        if *self == Self::builtin() {
            return Some((DEFAULT_ENGINE_TYPE, DEFAULT_LANGUAGE));
        }
        self.engines.iter().find_map(|(engine, languages)| {
            languages
                .first()
                .map(|language| (engine.as_str(), language.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use chrono::Local;

    use super::{
        EngineCatalog, ExecutionLog, ExecutionRequest, FrameOutcome, LoggedExecutionEvent,
        SubmissionError,
    };
    use crate::model::{ExecutionEvent, ExecutionEventType, ServiceTargetState};
    use crate::sse::StreamFrame;

    fn engine(sub_type: Option<&str>, language: Option<&str>) -> ServiceTargetState {
        ServiceTargetState {
            service_type: Some("code-execution-engine".to_string()),
            service_sub_type: sub_type.map(str::to_string),
            language_name: language.map(str::to_string),
            ..ServiceTargetState::new("id", "engine")
        }
    }

    #[test]
    fn payload_base64_encodes_source() {
        let request = ExecutionRequest::new("interpreted", "python", "print('hé')").with_timeout(45);
        let payload = request.payload();

        let decoded = STANDARD
            .decode(payload["code"].as_str().expect("code is a string"))
            .expect("valid base64");
        assert_eq!(String::from_utf8(decoded).expect("utf8"), "print('hé')");
        assert_eq!(payload["timeout"], 45);
        assert_eq!(payload["arguments"], serde_json::json!([]));
        assert_eq!(payload["environment"], serde_json::json!({}));
    }

    #[test]
    fn validation_guards_required_fields_and_timeout() {
        let ok = ExecutionRequest::new("interpreted", "python", "print(1)");
        assert_eq!(ok.validate(), Ok(()));

        for bad in [
            ExecutionRequest::new("", "python", "print(1)"),
            ExecutionRequest::new("interpreted", " ", "print(1)"),
            ExecutionRequest::new("interpreted", "python", ""),
            ok.clone().with_timeout(0),
            ok.clone().with_timeout(301),
        ] {
            assert!(matches!(bad.validate(), Err(SubmissionError::Invalid(_))));
        }
        assert_eq!(ok.with_timeout(300).validate(), Ok(()));
    }

    #[test]
    fn log_keeps_every_parsable_frame_in_order() {
        let mut log = ExecutionLog::default();
        let frames = [
            StreamFrame::named("STARTED", r#"{"taskId":"t1"}"#),
            StreamFrame::named("OUTPUT", r#"{"output":"a"}"#),
            StreamFrame::named("OUTPUT", "{not json"),
            StreamFrame::unnamed(r#"{"eventType":"output","output":"b"}"#),
            StreamFrame::unnamed(r#"{"output":"no type"}"#),
            StreamFrame::named("OUTPUT", r#"{"output":"a"}"#),
        ];

        let dropped = frames
            .iter()
            .map(|frame| log.ingest(frame, Local::now()))
            .filter(|outcome| matches!(outcome, FrameOutcome::Dropped(_)))
            .count();

        assert_eq!(dropped, 2);
        assert_eq!(log.len(), frames.len() - dropped);
        assert_eq!(log.rendered(), vec!["[STARTED] Execution started (Task: t1)", "a", "b", "a"]);
    }

    #[test]
    fn terminal_detection_matches_across_delivery_paths() {
        for raw in ["completed", "COMPLETED", "Completed"] {
            let mut log = ExecutionLog::default();
            let generic = StreamFrame::unnamed(format!(r#"{{"eventType":"{raw}","exitCode":0}}"#));
            assert_eq!(
                log.ingest(&generic, Local::now()),
                FrameOutcome::Terminal(ExecutionEventType::Completed)
            );
        }

        let mut log = ExecutionLog::default();
        let named = StreamFrame::named("COMPLETED", r#"{"exitCode":0}"#);
        assert_eq!(
            log.ingest(&named, Local::now()),
            FrameOutcome::Terminal(ExecutionEventType::Completed)
        );
    }

    #[test]
    fn error_and_failed_frames_are_terminal() {
        let mut log = ExecutionLog::default();
        assert_eq!(
            log.ingest(
                &StreamFrame::named("ERROR", r#"{"error":"boom"}"#),
                Local::now()
            ),
            FrameOutcome::Terminal(ExecutionEventType::Error)
        );
        assert_eq!(
            log.ingest(
                &StreamFrame::unnamed(r#"{"eventType":"failed","exitCode":1}"#),
                Local::now()
            ),
            FrameOutcome::Terminal(ExecutionEventType::Failed)
        );
        assert_eq!(
            log.rendered(),
            vec!["[ERROR] boom", "[FAILED] Execution failed (Exit code: 1)"]
        );
    }

    #[test]
    fn lowercase_named_frames_have_no_handler() {
        let mut log = ExecutionLog::default();
        assert_eq!(
            log.ingest(&StreamFrame::named("completed", "{}"), Local::now()),
            FrameOutcome::Unhandled
        );
        assert!(log.is_empty());
    }

    #[test]
    fn render_falls_back_to_placeholders() {
        let logged = |event_type, exit_code| LoggedExecutionEvent {
            event: ExecutionEvent {
                event_type,
                task_id: None,
                output: None,
                error: None,
                message: None,
                exit_code,
                status: None,
            },
            received_at: Local::now(),
        };

        assert_eq!(
            logged(ExecutionEventType::Completed, None).render(),
            "[COMPLETED] Execution finished (Exit code: N/A)"
        );
        assert_eq!(
            logged(ExecutionEventType::Completed, Some(0)).render(),
            "[COMPLETED] Execution finished (Exit code: 0)"
        );
        assert_eq!(
            logged(ExecutionEventType::Error, None).render(),
            "[ERROR] Unknown error"
        );
        assert_eq!(logged(ExecutionEventType::Output, None).render(), "");
    }

    #[test]
    fn catalog_groups_engines_by_sub_type() {
        let services = vec![
            engine(Some("interpreted"), Some("Python")),
            engine(Some("interpreted"), Some("python")),
            engine(Some("jvm"), Some("Java")),
            engine(None, Some("Lua")),
            engine(Some("native"), Some("  ")),
            ServiceTargetState::new("tool", "weather"),
        ];

        let catalog = EngineCatalog::from_capabilities(&services).expect("engines found");
        assert_eq!(catalog.engine_types(), vec!["interpreted", "jvm", "unknown"]);
        assert_eq!(catalog.languages("interpreted"), ["python".to_string()]);
        assert_eq!(catalog.languages("native"), [] as [String; 0]);
        assert_eq!(catalog.default_selection(), Some(("interpreted", "python")));
    }

    #[test]
    fn builtin_catalog_defaults_to_python() {
        assert_eq!(EngineCatalog::from_capabilities(&[]), None);
        let catalog = EngineCatalog::builtin();
        assert_eq!(catalog.default_selection(), Some(("interpreted", "python")));
        assert_eq!(catalog.languages("native"), ["go".to_string(), "rust".to_string()]);
    }
}
