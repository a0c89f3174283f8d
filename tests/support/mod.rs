#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use capsync::{ConsoleConfig, ReconnectBackoff, RouterClient};
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Broadcast payload that ends every open relay stream instead of being sent.
const CLOSE_STREAMS: &str = "\u{0}close";

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
}

impl Reply {
    /// Success wrapped in the `{data, error}` envelope.
    pub fn data(data: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: json!({ "data": data }),
        }
    }

    pub fn raw(status: u16, body: Value) -> Self {
        Self {
            status: StatusCode::from_u16(status).expect("valid status code"),
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub engine_type: String,
    pub language: String,
    pub body: Value,
}

#[derive(Clone)]
pub struct MockState {
    pub capabilities: Arc<Mutex<Reply>>,
    pub tools_state: Arc<Mutex<Reply>>,
    pub resources_state: Arc<Mutex<Reply>>,
    pub namespaces: Arc<Mutex<Reply>>,
    pub forwards: Arc<Mutex<Reply>>,
    pub submit: Arc<Mutex<Reply>>,
    pub submissions: Arc<Mutex<Vec<Submission>>>,
    /// Raw SSE frames replayed on every execution stream request.
    pub execution_frames: Arc<Mutex<Vec<String>>>,
    /// Keep the execution stream open after the scripted frames.
    pub hold_execution_stream: Arc<AtomicBool>,
    pub capability_events: broadcast::Sender<String>,
    pub tool_call_events: broadcast::Sender<String>,
    pub tool_calls_unavailable: Arc<AtomicBool>,
    pub tool_call_scopes: Arc<Mutex<Vec<Option<String>>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockState {
    fn new() -> Self {
        let (capability_events, _) = broadcast::channel(64);
        let (tool_call_events, _) = broadcast::channel(64);
        Self {
            capabilities: Arc::new(Mutex::new(Reply::data(json!([])))),
            tools_state: Arc::new(Mutex::new(Reply::data(json!({})))),
            resources_state: Arc::new(Mutex::new(Reply::data(json!({})))),
            namespaces: Arc::new(Mutex::new(Reply::data(json!([])))),
            forwards: Arc::new(Mutex::new(Reply::data(json!([])))),
            submit: Arc::new(Mutex::new(Reply::raw(
                201,
                json!({ "taskId": "t1", "streamUrl": "/stream/t1" }),
            ))),
            submissions: Arc::new(Mutex::new(Vec::new())),
            execution_frames: Arc::new(Mutex::new(Vec::new())),
            hold_execution_stream: Arc::new(AtomicBool::new(true)),
            capability_events,
            tool_call_events,
            tool_calls_unavailable: Arc::new(AtomicBool::new(false)),
            tool_call_scopes: Arc::new(Mutex::new(Vec::new())),
            hits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn hit(&self, route: &str) {
        let mut hits = self.hits.lock().expect("hits lock");
        *hits.entry(route.to_string()).or_default() += 1;
    }

    pub fn hits(&self, route: &str) -> usize {
        let hits = self.hits.lock().expect("hits lock");
        hits.get(route).copied().unwrap_or_default()
    }

    pub fn set(slot: &Arc<Mutex<Reply>>, reply: Reply) {
        *slot.lock().expect("reply lock") = reply;
    }

    pub fn set_execution_frames(&self, frames: Vec<String>) {
        *self.execution_frames.lock().expect("frames lock") = frames;
    }

    pub fn emit_capability(&self, event: &str, data: Value) {
        let _ = self.capability_events.send(sse_frame(Some(event), &data));
    }

    pub fn emit_capability_raw(&self, frame: String) {
        let _ = self.capability_events.send(frame);
    }

    pub fn close_capability_streams(&self) {
        let _ = self.capability_events.send(CLOSE_STREAMS.to_string());
    }

    pub fn close_tool_call_streams(&self) {
        let _ = self.tool_call_events.send(CLOSE_STREAMS.to_string());
    }

    pub fn emit_tool_call(&self, event: &str, data: Value) {
        let _ = self.tool_call_events.send(sse_frame(Some(event), &data));
    }
}

pub fn sse_frame(event: Option<&str>, data: &Value) -> String {
    match event {
        Some(event) => format!("event: {event}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

fn reply(slot: &Arc<Mutex<Reply>>) -> (StatusCode, Json<Value>) {
    let reply = slot.lock().expect("reply lock").clone();
    (reply.status, Json(reply.body))
}

fn event_stream(body: Body) -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            ("content-type", "text/event-stream"),
            ("cache-control", "no-cache"),
        ],
        body,
    )
}

/// Relays broadcast frames until the channel closes.
fn broadcast_body(mut rx: broadcast::Receiver<String>) -> Body {
    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(": connected\n\n".to_string());

        loop {
            match rx.recv().await {
                Ok(frame) if frame == CLOSE_STREAMS => break,
                Ok(frame) => yield Ok(frame),
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    };
    Body::from_stream(stream)
}

async fn capabilities(State(state): State<MockState>) -> impl IntoResponse {
    state.hit("capabilities");
    reply(&state.capabilities)
}

async fn tools_state(State(state): State<MockState>) -> impl IntoResponse {
    state.hit("tools_state");
    reply(&state.tools_state)
}

async fn resources_state(State(state): State<MockState>) -> impl IntoResponse {
    state.hit("resources_state");
    reply(&state.resources_state)
}

async fn namespaces(State(state): State<MockState>) -> impl IntoResponse {
    state.hit("namespaces");
    reply(&state.namespaces)
}

async fn forwards(State(state): State<MockState>) -> impl IntoResponse {
    state.hit("forwards");
    reply(&state.forwards)
}

async fn capability_notifications(State(state): State<MockState>) -> impl IntoResponse {
    state.hit("capability_notifications");
    event_stream(broadcast_body(state.capability_events.subscribe()))
}

async fn submit_code(
    State(state): State<MockState>,
    Path((engine_type, language)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.hit("submit");
    state
        .submissions
        .lock()
        .expect("submissions lock")
        .push(Submission {
            engine_type,
            language,
            body,
        });
    reply(&state.submit)
}

async fn execution_stream(
    State(state): State<MockState>,
    Path(_task_id): Path<String>,
) -> impl IntoResponse {
    state.hit("execution_stream");
    let frames = state.execution_frames.lock().expect("frames lock").clone();
    let hold = state.hold_execution_stream.load(Ordering::SeqCst);

    let stream = async_stream::stream! {
        for frame in frames {
            yield Ok::<_, Infallible>(frame);
        }
        if hold {
            std::future::pending::<()>().await;
        }
    };
    event_stream(Body::from_stream(stream))
}

async fn tool_call_notifications(State(state): State<MockState>) -> axum::response::Response {
    tool_call_stream(state, None)
}

async fn scoped_tool_call_notifications(
    State(state): State<MockState>,
    Path(connection_id): Path<String>,
) -> axum::response::Response {
    tool_call_stream(state, Some(connection_id))
}

fn tool_call_stream(state: MockState, scope: Option<String>) -> axum::response::Response {
    state.hit("tool_call_notifications");
    state
        .tool_call_scopes
        .lock()
        .expect("scopes lock")
        .push(scope);
    if state.tool_calls_unavailable.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    event_stream(broadcast_body(state.tool_call_events.subscribe())).into_response()
}

pub struct MockRouter {
    pub state: MockState,
    pub base_url: String,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl MockRouter {
    pub fn config(&self) -> ConsoleConfig {
        ConsoleConfig::new(&self.base_url)
            .expect("mock base url is valid")
            .with_reconnect(ReconnectBackoff::new(
                3,
                Duration::from_millis(20),
                Duration::from_millis(50),
            ))
    }

    pub fn client(&self) -> RouterClient {
        RouterClient::new(self.config()).expect("router client builds")
    }

    pub fn stop(self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

pub async fn spawn_mock_router() -> anyhow::Result<MockRouter> {
    let shutdown = CancellationToken::new();
    let state = MockState::new();

    let app = Router::new()
        .route("/api/v1/capabilities", get(capabilities))
        .route("/api/v1/capabilities/tools/state", get(tools_state))
        .route("/api/v1/capabilities/resources/state", get(resources_state))
        .route(
            "/api/v1/capabilities/notifications",
            get(capability_notifications),
        )
        .route(
            "/api/v2/code-execution-engine/{engine_type}/{language}",
            post(submit_code),
        )
        .route("/stream/{task_id}", get(execution_stream))
        .route(
            "/api/v2/tool-calls/notifications",
            get(tool_call_notifications),
        )
        .route(
            "/api/v2/tool-calls/notifications/{connection_id}",
            get(scoped_tool_call_notifications),
        )
        .route("/api/v1/namespaces/list", get(namespaces))
        .route("/api/v1/forwards", get(forwards))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled_owned().await })
                .await;
        }
    });

    Ok(MockRouter {
        state,
        base_url: format!("http://127.0.0.1:{port}"),
        shutdown,
        handle,
    })
}

/// Waits until the watched value satisfies `predicate`.
pub async fn wait_until<T>(
    rx: &mut watch::Receiver<T>,
    what: &str,
    predicate: impl FnMut(&T) -> bool,
) -> T
where
    T: Clone,
{
    match tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(predicate)).await {
        Ok(Ok(value)) => value.clone(),
        Ok(Err(_)) => panic!("watch channel closed while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
