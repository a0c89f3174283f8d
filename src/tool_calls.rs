use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::ConnectionStatus;
use crate::client::RouterClient;
use crate::model::{ToolCallEvent, ToolCallEventType};
use crate::notices::NoticeBoard;
use crate::sse::{EventStream, StreamEvent, StreamFrame, sleep_or_cancel};

pub const TOOL_CALL_LOG_CAPACITY: usize = 1000;
pub const RECONNECT_NOTICE: &str = "Connection to event stream lost. Attempting to reconnect...";

const ALL_CATEGORIES: &str = "all";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFilter {
    pub connection_id: Option<String>,
    pub tool_name: Option<String>,
    pub error_category: Option<String>,
}

impl ToolCallFilter {
    pub fn matches(&self, event: &ToolCallEvent) -> bool {
        let connection_ok = active_term(&self.connection_id)
            .is_none_or(|needle| contains_ignore_case(event.connection_id.as_deref(), needle));
        let tool_ok = active_term(&self.tool_name)
            .is_none_or(|needle| contains_ignore_case(event.tool_name.as_deref(), needle));
        if !connection_ok || !tool_ok {
            return false;
        }

        match active_term(&self.error_category).filter(|category| *category != ALL_CATEGORIES) {
            Some(category) => event
                .error_category
                .is_some_and(|actual| actual.as_str() == category),
            None => true,
        }
    }
}

fn active_term(term: &Option<String>) -> Option<&str> {
    term.as_deref().filter(|term| !term.is_empty())
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|haystack| haystack.to_lowercase().contains(&needle.to_lowercase()))
}

/// Fixed-capacity ring buffer of tool calls, newest first. STARTED inserts;
/// COMPLETED and FAILED update the matching record in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallLog {
    entries: VecDeque<ToolCallEvent>,
    capacity: usize,
}

impl Default for ToolCallLog {
    fn default() -> Self {
        Self::with_capacity(TOOL_CALL_LOG_CAPACITY)
    }
}

impl ToolCallLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolCallEvent> {
        self.entries.iter()
    }

    pub fn get(&self, event_id: &str) -> Option<&ToolCallEvent> {
        self.entries.iter().find(|event| event.event_id == event_id)
    }

    pub fn apply(&mut self, event: ToolCallEvent) -> bool {
        match event.event_type {
            ToolCallEventType::Started => {
                self.push_started(event);
                true
            }
            ToolCallEventType::Completed | ToolCallEventType::Failed => self.update(&event),
        }
    }

    fn push_started(&mut self, event: ToolCallEvent) {
        self.entries.push_front(event);
        self.entries.truncate(self.capacity);
    }

    fn update(&mut self, event: &ToolCallEvent) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.event_id == event.event_id)
        {
            Some(existing) => {
                existing.merge_from(event);
                true
            }
            None => {
                debug!(event_id = %event.event_id, "ignoring update for unknown tool call");
                false
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn filtered(&self, filter: &ToolCallFilter) -> Vec<&ToolCallEvent> {
        self.entries
            .iter()
            .filter(|event| filter.matches(event))
            .collect()
    }

    pub fn export_json(&self, filter: &ToolCallFilter) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.filtered(filter))
    }
}

pub fn export_file_name(at: DateTime<Utc>) -> String {
    format!(
        "tool-call-events-{}.json",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Background reader for the tool-call debug stream, optionally scoped to one
/// connection.
#[derive(Debug)]
pub struct ToolCallMonitor {
    log: Arc<Mutex<ToolCallLog>>,
    changes: watch::Receiver<u64>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ToolCallMonitor {
    pub fn spawn(client: RouterClient, notices: NoticeBoard, connection_id: Option<&str>) -> Self {
        let url = client.config().tool_call_notifications_url(connection_id);
        let log = Arc::new(Mutex::new(ToolCallLog::default()));
        let (changes_tx, changes) = watch::channel(0);
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let shutdown = CancellationToken::new();

        let worker = ToolCallWorker {
            client,
            notices,
            url,
            log: log.clone(),
            changes_tx,
            status_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            log,
            changes,
            status,
            shutdown,
            task: Some(task),
        }
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ToolCallLog) -> R) -> Option<R> {
        self.log.lock().ok().map(|log| f(&log))
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ToolCallMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ToolCallWorker {
    client: RouterClient,
    notices: NoticeBoard,
    url: String,
    log: Arc<Mutex<ToolCallLog>>,
    changes_tx: watch::Sender<u64>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
}

impl ToolCallWorker {
    async fn run(self) {
        let backoff = self.client.config().reconnect;
        let mut failures = 0usize;

        loop {
            self.status_tx.send_replace(ConnectionStatus::Connecting);
            let mut stream = self.client.streams().open(&self.url);
            let Some(opened) = self.pump(&mut stream).await else {
                break;
            };
            if opened {
                failures = 0;
            }

            failures += 1;
            let Some(delay) = backoff.retry(failures) else {
                self.notices.error(
                    "Error",
                    format!("Tool call event stream unavailable after {} attempts", failures - 1),
                );
                self.status_tx.send_replace(ConnectionStatus::GaveUp);
                self.shutdown.cancelled().await;
                break;
            };

            self.notices.error("Error", RECONNECT_NOTICE);
            self.status_tx.send_replace(ConnectionStatus::Reconnecting {
                attempt: failures,
                delay,
            });
            if !sleep_or_cancel(delay, &self.shutdown).await {
                break;
            }
        }

        self.status_tx.send_replace(ConnectionStatus::Closed);
        debug!(url = %self.url, "tool call monitor stopped");
    }

    /// Returns `None` when closed by the owner, otherwise whether the
    /// connection had opened before it was lost.
    async fn pump(&self, stream: &mut EventStream) -> Option<bool> {
        let mut opened = false;
        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => None,
                next = stream.next() => Some(next),
            };
            let Some(next) = next else {
                stream.close();
                return None;
            };

            match next {
                Some(StreamEvent::Opened) => {
                    opened = true;
                    self.status_tx.send_replace(ConnectionStatus::Live);
                    info!(url = %stream.url(), "tool call event stream opened");
                }
                Some(StreamEvent::Frame(frame)) => self.handle_frame(&frame),
                Some(StreamEvent::TransportError(err)) => {
                    warn!(url = %stream.url(), error = %err, "tool call event stream lost");
                }
                Some(StreamEvent::Ended) | None => {
                    stream.close();
                    return Some(opened);
                }
            }
        }
    }

    fn handle_frame(&self, frame: &StreamFrame) {
        let Some(name) = frame.event_name() else {
            debug!("ignoring unnamed tool call frame");
            return;
        };
        if !matches!(name, "started" | "completed" | "failed") {
            debug!(event = name, "ignoring frame without a tool call handler");
            return;
        }

        let event = match ToolCallEvent::parse(&frame.data) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = name, error = %err, "dropping malformed tool call frame");
                return;
            }
        };

        let changed = match self.log.lock() {
            Ok(mut log) => log.apply(event),
            Err(_) => false,
        };
        if changed {
            self.changes_tx.send_modify(|version| *version += 1);
        }
    }
}
