use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RouterClient;
use crate::model::{CapabilityEvent, CapabilityEventKind, ServiceTargetState};
use crate::notices::NoticeBoard;
use crate::reconcile::CapabilitySet;
use crate::snapshot;
use crate::sse::{EventStream, StreamEvent, StreamFrame, sleep_or_cancel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Live,
    Reconnecting { attempt: usize, delay: Duration },
    GaveUp,
    Closed,
}

/// Handle to the background reconciliation task. Dropping it tears the
/// connection down.
#[derive(Debug)]
pub struct CapabilityMonitor {
    entries: watch::Receiver<Vec<ServiceTargetState>>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CapabilityMonitor {
    pub fn spawn(client: RouterClient, notices: NoticeBoard) -> Self {
        let (entries_tx, entries) = watch::channel(Vec::new());
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let shutdown = CancellationToken::new();

        let worker = MonitorWorker {
            client,
            notices,
            entries_tx,
            status_tx,
            shutdown: shutdown.clone(),
            set: CapabilitySet::default(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            entries,
            status,
            shutdown,
            task: Some(task),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ServiceTargetState>> {
        self.entries.clone()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn current(&self) -> Vec<ServiceTargetState> {
        self.entries.borrow().clone()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Closes the connection and waits for the task to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CapabilityMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum PumpEnd {
    Closed,
    Lost { opened: bool, reason: String },
}

struct MonitorWorker {
    client: RouterClient,
    notices: NoticeBoard,
    entries_tx: watch::Sender<Vec<ServiceTargetState>>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
    set: CapabilitySet,
}

impl MonitorWorker {
    async fn run(mut self) {
        let backoff = self.client.config().reconnect;
        let url = self.client.config().capability_notifications_url();
        let mut failures = 0usize;

        loop {
            self.status_tx.send_replace(ConnectionStatus::Connecting);

            let loaded = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                outcome = snapshot::fetch_capabilities(&self.client) => outcome,
            };

            let reason = match loaded {
                Ok(set) => {
                    self.set = set;
                    self.publish();

                    let mut stream = self.client.streams().open(&url);
                    match self.pump(&mut stream).await {
                        PumpEnd::Closed => break,
                        PumpEnd::Lost { opened, reason } => {
                            if opened {
                                failures = 0;
                            }
                            format!("Capability event stream error: {reason}")
                        }
                    }
                }
                Err(err) => {
                    self.set = CapabilitySet::default();
                    self.publish();
                    format!("Failed to load capabilities: {err}")
                }
            };

            failures += 1;
            match backoff.retry(failures) {
                Some(delay) => {
                    self.notices.error("Error", reason);
                    info!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting capability stream"
                    );
                    self.status_tx.send_replace(ConnectionStatus::Reconnecting {
                        attempt: failures,
                        delay,
                    });
                    if !sleep_or_cancel(delay, &self.shutdown).await {
                        break;
                    }
                }
                None => {
                    self.notices.error(
                        "Error",
                        format!("{reason}. Giving up after {} attempts", failures - 1),
                    );
                    warn!(attempts = failures - 1, "capability stream reconnect budget spent");
                    self.status_tx.send_replace(ConnectionStatus::GaveUp);
                    self.shutdown.cancelled().await;
                    break;
                }
            }
        }

        self.status_tx.send_replace(ConnectionStatus::Closed);
        debug!("capability monitor stopped");
    }

    async fn pump(&mut self, stream: &mut EventStream) -> PumpEnd {
        let mut opened = false;
        let mut last_error = None;

        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => None,
                next = stream.next() => Some(next),
            };
            let Some(next) = next else {
                stream.close();
                return PumpEnd::Closed;
            };

            match next {
                Some(StreamEvent::Opened) => {
                    opened = true;
                    self.status_tx.send_replace(ConnectionStatus::Live);
                    info!(url = %stream.url(), "capability event stream opened");
                }
                Some(StreamEvent::Frame(frame)) => self.handle_frame(&frame).await,
                Some(StreamEvent::TransportError(err)) => last_error = Some(err.to_string()),
                Some(StreamEvent::Ended) | None => {
                    stream.close();
                    return PumpEnd::Lost {
                        opened,
                        reason: last_error.unwrap_or_else(|| "stream ended".to_string()),
                    };
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &StreamFrame) {
        let Some(kind) = frame.event_name().and_then(CapabilityEventKind::from_frame_name) else {
            debug!(event = ?frame.event, "ignoring frame without a capability handler");
            return;
        };

        let event = match CapabilityEvent::parse(kind, &frame.data) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = kind.as_str(), error = %err, "dropping malformed capability frame");
                return;
            }
        };

        let reduction = self.set.apply(&event, Local::now());
        if reduction.changed {
            debug!(event = event.kind().as_str(), id = %event.id(), "capability state changed");
            self.publish();
        }

        if let Some(id) = reduction.refresh {
            self.refresh_entry(&id).await;
        }
    }

    /// REGISTER carries identity but no live health. Only the registered
    /// entry is merged so newer deltas for other entries are kept.
    async fn refresh_entry(&mut self, id: &str) {
        let health = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return,
            health = snapshot::fetch_health(&self.client) => health,
        };

        match health {
            Ok(health) => {
                if self.set.merge_health_for(id, &health, Local::now()) {
                    self.publish();
                }
            }
            Err(err) => {
                self.notices
                    .error("Error", format!("Failed to refresh capability state: {err}"));
            }
        }
    }

    fn publish(&self) {
        self.entries_tx.send_replace(self.set.entries().to_vec());
    }
}
