pub mod cache;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod console;
pub mod execution;
pub mod logging;
pub mod model;
pub mod notices;
pub mod reconcile;
pub mod snapshot;
pub mod sse;
pub mod tool_calls;

pub use cache::{CatalogCache, SnapshotCache};
pub use capabilities::{CapabilityMonitor, ConnectionStatus};
pub use client::{ApiError, RouterClient};
pub use config::ConsoleConfig;
pub use console::Console;
pub use execution::{
    EngineCatalog, ExecutionLog, ExecutionRequest, ExecutionSession, SessionState,
    SubmissionError,
};
pub use notices::{Notice, NoticeBoard, NoticeKind};
pub use reconcile::{CapabilitySet, HealthSnapshot};
pub use sse::{EventStream, EventStreamClient, ReconnectBackoff, StreamEvent, StreamFrame};
pub use tool_calls::{ToolCallFilter, ToolCallLog, ToolCallMonitor};
