use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

const DEFAULT_MAX_NOTICES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Error,
    Warning,
    Info,
}

/// A transient user-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
    pub raised_at: Instant,
}

#[derive(Debug, Default)]
struct BoardState {
    next_id: u64,
    notices: VecDeque<Notice>,
}

/// Shared board of auto-dismissing notices. Notices expire after a fixed
/// visibility window and never block.
#[derive(Debug, Clone)]
pub struct NoticeBoard {
    inner: Arc<Mutex<BoardState>>,
    ttl: Duration,
    max_notices: usize,
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_NOTICES)
    }

    pub fn with_capacity(ttl: Duration, max_notices: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoardState::default())),
            ttl,
            max_notices: max_notices.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn error(&self, title: &str, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Error, title, message)
    }

    pub fn warning(&self, title: &str, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Warning, title, message)
    }

    pub fn info(&self, title: &str, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Info, title, message)
    }

    pub fn push(&self, kind: NoticeKind, title: &str, message: impl Into<String>) -> u64 {
        self.push_at(kind, title, message.into(), Instant::now())
    }

    fn push_at(&self, kind: NoticeKind, title: &str, message: String, now: Instant) -> u64 {
        match kind {
            NoticeKind::Error | NoticeKind::Warning => {
                warn!(title = %title, message = %message, "notice raised")
            }
            NoticeKind::Info => info!(title = %title, message = %message, "notice raised"),
        }

        let Ok(mut state) = self.inner.lock() else {
            return 0;
        };
        state.next_id += 1;
        let id = state.next_id;
        while state.notices.len() >= self.max_notices {
            let _ = state.notices.pop_front();
        }
        state.notices.push_back(Notice {
            id,
            kind,
            title: title.to_string(),
            message,
            raised_at: now,
        });
        id
    }

    /// Notices still inside their visibility window, oldest first. Expired
    /// notices are dropped.
    pub fn active(&self) -> Vec<Notice> {
        self.active_at(Instant::now())
    }

    fn active_at(&self, now: Instant) -> Vec<Notice> {
        let Ok(mut state) = self.inner.lock() else {
            return Vec::new();
        };
        let ttl = self.ttl;
        state
            .notices
            .retain(|notice| now.saturating_duration_since(notice.raised_at) < ttl);
        state.notices.iter().cloned().collect()
    }

    pub fn dismiss(&self, id: u64) -> bool {
        let Ok(mut state) = self.inner.lock() else {
            return false;
        };
        let before = state.notices.len();
        state.notices.retain(|notice| notice.id != id);
        state.notices.len() != before
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.notices.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{NoticeBoard, NoticeKind};

    #[test]
    fn notices_expire_after_visibility_window() {
        let board = NoticeBoard::new(Duration::from_secs(10));
        let start = Instant::now();
        board.push_at(NoticeKind::Error, "Error", "boom".to_string(), start);

        assert_eq!(board.active_at(start + Duration::from_secs(9)).len(), 1);
        assert!(board.active_at(start + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn dismiss_removes_only_the_named_notice() {
        let board = NoticeBoard::new(Duration::from_secs(10));
        let first = board.error("Error", "one");
        let second = board.info("Info", "two");

        assert!(board.dismiss(first));
        assert!(!board.dismiss(first), "second dismiss is a no-op");
        let active = board.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second);
    }

    #[test]
    fn board_drops_oldest_when_full() {
        let board = NoticeBoard::with_capacity(Duration::from_secs(10), 2);
        board.warning("Warning", "one");
        board.warning("Warning", "two");
        board.warning("Warning", "three");

        let messages: Vec<_> = board
            .active()
            .into_iter()
            .map(|notice| notice.message)
            .collect();
        assert_eq!(messages, vec!["two", "three"]);
    }
}
