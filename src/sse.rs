use std::fmt;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FRAME_CHANNEL_CAPACITY: usize = 256;

pub const UNNAMED_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl StreamFrame {
    pub fn named(event: &str, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.to_string()),
            id: None,
            data: data.into(),
        }
    }

    pub fn unnamed(data: impl Into<String>) -> Self {
        Self {
            event: None,
            id: None,
            data: data.into(),
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.event
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != UNNAMED_EVENT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened,
    Frame(StreamFrame),
    TransportError(StreamError),
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    Connect(String),
    Status(u16),
    Read(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "event stream connection failed: {msg}"),
            Self::Status(status) => write!(f, "event stream rejected with HTTP {status}"),
            Self::Read(msg) => write!(f, "event stream read error: {msg}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Owner-side handle for one connection. Closing is synchronous and
/// idempotent.
#[derive(Debug, Clone, Default)]
pub struct StreamHandle {
    token: CancellationToken,
}

impl StreamHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
pub struct EventStream {
    url: String,
    rx: mpsc::Receiver<StreamEvent>,
    handle: StreamHandle,
}

impl EventStream {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.handle.is_closed() {
            return None;
        }
        tokio::select! {
            biased;

            _ = self.handle.token.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_channel(url: &str, rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            url: url.to_string(),
            rx,
            handle: StreamHandle::default(),
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[derive(Debug, Clone)]
pub struct EventStreamClient {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl EventStreamClient {
    pub fn new(http: reqwest::Client, connect_timeout: Duration) -> Self {
        Self {
            http,
            connect_timeout,
        }
    }

    /// Opens a connection in the background. Connection failures are
    /// reported as a `TransportError` event followed by `Ended`; there is no
    /// automatic reconnection.
    pub fn open(&self, url: &str) -> EventStream {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let handle = StreamHandle::default();
        let worker = StreamWorker {
            http: self.http.clone(),
            url: url.to_string(),
            connect_timeout: self.connect_timeout,
            tx,
            token: handle.token.clone(),
        };
        tokio::spawn(worker.run());

        EventStream {
            url: url.to_string(),
            rx,
            handle,
        }
    }
}

struct StreamWorker {
    http: reqwest::Client,
    url: String,
    connect_timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
    token: CancellationToken,
}

impl StreamWorker {
    async fn run(self) {
        debug!(url = %self.url, "opening event stream");
        let connect = self
            .http
            .get(&self.url)
            .header("accept", "text/event-stream")
            .header("cache-control", "no-cache")
            .send();

        let response = tokio::select! {
            biased;

            _ = self.token.cancelled() => {
                debug!(url = %self.url, "event stream closed before connect");
                return;
            }
            outcome = tokio::time::timeout(self.connect_timeout, connect) => match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    self.fail(StreamError::Connect(err.to_string())).await;
                    return;
                }
                Err(_) => {
                    self.fail(StreamError::Connect(format!(
                        "timed out after {}ms",
                        self.connect_timeout.as_millis()
                    )))
                    .await;
                    return;
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            self.fail(StreamError::Status(status.as_u16())).await;
            return;
        }

        if !self.emit(StreamEvent::Opened).await {
            return;
        }
        debug!(url = %self.url, "event stream opened");

        let byte_stream = response.bytes_stream();
        let mut sse_stream =
            sse_stream::SseStream::from_bytes_stream(byte_stream.map(|r| r.map_err(SseBodyError)));

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    debug!(url = %self.url, "event stream closed by owner");
                    return;
                }

                next = sse_stream.next() => match next {
                    Some(Ok(sse)) => {
                        let Some(data) = sse.data else {
                            continue;
                        };
                        let frame = StreamFrame {
                            event: sse.event,
                            id: sse.id,
                            data,
                        };
                        if !self.emit(StreamEvent::Frame(frame)).await {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        self.fail(StreamError::Read(err.to_string())).await;
                        return;
                    }
                    None => {
                        debug!(url = %self.url, "event stream ended by server");
                        let _ = self.emit(StreamEvent::Ended).await;
                        return;
                    }
                },
            }
        }
    }

    async fn fail(&self, error: StreamError) {
        warn!(url = %self.url, error = %error, "event stream transport error");
        if self.emit(StreamEvent::TransportError(error)).await {
            let _ = self.emit(StreamEvent::Ended).await;
        }
    }

    async fn emit(&self, event: StreamEvent) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn retry(&self, attempt: usize) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let factor = 1u32 << exponent;
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;

        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[derive(Debug)]
struct SseBodyError(reqwest::Error);

impl fmt::Display for SseBodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for SseBodyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{
        EventStream, ReconnectBackoff, StreamEvent, StreamFrame, StreamHandle, sleep_or_cancel,
    };

    #[test]
    fn backoff_doubles_caps_and_stops() {
        let backoff =
            ReconnectBackoff::new(4, Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(backoff.retry(0), None, "attempts are 1-based");
        assert_eq!(backoff.retry(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.retry(2), Some(Duration::from_millis(200)));
        assert_eq!(
            backoff.retry(3),
            Some(Duration::from_millis(350)),
            "delay should cap at max"
        );
        assert_eq!(backoff.retry(4), Some(Duration::from_millis(350)));
        assert_eq!(backoff.retry(5), None, "budget should be spent");
    }

    #[test]
    fn zero_attempt_budget_never_retries() {
        let backoff = ReconnectBackoff::new(0, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(backoff.retry(1), None);
    }

    #[test]
    fn unnamed_and_message_frames_take_generic_path() {
        assert_eq!(StreamFrame::unnamed("{}").event_name(), None);
        assert_eq!(StreamFrame::named("message", "{}").event_name(), None);
        assert_eq!(StreamFrame::named("", "{}").event_name(), None);
        assert_eq!(
            StreamFrame::named("OUTPUT", "{}").event_name(),
            Some("OUTPUT")
        );
    }

    #[test]
    fn closing_handle_twice_is_harmless() {
        let handle = StreamHandle::default();
        assert!(!handle.is_closed());
        handle.close();
        handle.close();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn closed_stream_yields_no_more_events() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = EventStream::from_channel("http://test/stream", rx);
        tx.send(StreamEvent::Opened).await.expect("send opened");
        assert_eq!(stream.next().await, Some(StreamEvent::Opened));

        tx.send(StreamEvent::Frame(StreamFrame::unnamed("{}")))
            .await
            .expect("send frame");
        stream.close();
        assert_eq!(stream.next().await, None, "closed stream must stay silent");
    }

    #[tokio::test]
    async fn sleep_or_cancel_returns_early_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &token).await);

        let live = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &live).await);
    }
}
