use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
const RECENT_LOG_LINES: usize = 1000;

static RECENT_LOGS: OnceLock<RecentLogs> = OnceLock::new();

/// Tail of the formatted log output, for a diagnostics panel.
#[derive(Debug, Clone)]
pub struct RecentLogs {
    lines: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
}

impl RecentLogs {
    fn new(max_lines: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(max_lines))),
            max_lines: max_lines.max(1),
        }
    }

    fn record(&self, bytes: &[u8]) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        for line in String::from_utf8_lossy(bytes).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if lines.len() == self.max_lines {
                let _ = lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }

    /// Up to `limit` most recent lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => {
                let skip = lines.len().saturating_sub(limit);
                lines.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

/// Installs the global subscriber: `RUST_LOG` when set, otherwise
/// `default_filter`. Returns `Ok(false)` when already installed.
pub fn init_tracing(default_filter: &str) -> Result<bool> {
    if RECENT_LOGS.get().is_some() {
        return Ok(false);
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter '{default_filter}'"))?,
    };

    let logs = RecentLogs::new(RECENT_LOG_LINES);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .with_writer(StderrTail { logs: logs.clone() })
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;
    let _ = RECENT_LOGS.set(logs);
    Ok(true)
}

pub fn recent_logs() -> Option<RecentLogs> {
    RECENT_LOGS.get().cloned()
}

#[derive(Clone)]
struct StderrTail {
    logs: RecentLogs,
}

struct StderrTailWriter {
    logs: RecentLogs,
    stderr: io::Stderr,
}

impl<'a> MakeWriter<'a> for StderrTail {
    type Writer = StderrTailWriter;

    fn make_writer(&'a self) -> Self::Writer {
        StderrTailWriter {
            logs: self.logs.clone(),
            stderr: io::stderr(),
        }
    }
}

impl Write for StderrTailWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.stderr.write(buf)?;
        self.logs.record(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stderr.flush()
    }
}
