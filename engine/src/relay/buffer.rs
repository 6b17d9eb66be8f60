//! Line assembly, the delivery backlog and the filterable history

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// Longest partial line held while waiting for its newline
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Splits a byte stream into lines, holding a trailing partial line until
/// its newline arrives. A partial line reaching [`MAX_PENDING_BYTES`] is
/// emitted as-is.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete lines in `bytes`, without their terminators
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);

        while self.pending.len() >= MAX_PENDING_BYTES {
            lines.push(decode_line(&self.pending[..MAX_PENDING_BYTES]));
            self.pending.drain(..MAX_PENDING_BYTES);
        }
        lines
    }

    /// Whatever partial line is left once the source has closed
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// What a consumer receives from [`Backlog::recv`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Lines in arrival order; `dropped` counts lines discarded since the
    /// previous delivery because the consumer fell behind
    Lines { lines: Vec<String>, dropped: u64 },
    /// The source has ended
    Closed(String),
}

#[derive(Debug, Default)]
struct BacklogState {
    lines: VecDeque<String>,
    dropped: u64,
    closed: Option<String>,
    finished: bool,
}

/// Bounded single-consumer queue between the forwarding task and a client.
///
/// Pushing never waits; once `capacity` lines are queued the oldest is
/// discarded.
#[derive(Debug, Clone)]
pub struct Backlog {
    state: Arc<Mutex<BacklogState>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BacklogState::default())),
            notify: Arc::new(Notify::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BacklogState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, line: String) {
        {
            let mut state = self.lock();
            if state.closed.is_some() {
                return;
            }
            if state.lines.len() >= self.capacity {
                state.lines.pop_front();
                state.dropped += 1;
            }
            state.lines.push_back(line);
        }
        self.notify.notify_one();
    }

    /// Mark the source as ended. Queued lines are still delivered before
    /// `notice`.
    pub fn close(&self, notice: impl Into<String>) {
        {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(notice.into());
            }
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Option<Option<Delivery>> {
        let mut state = self.lock();
        if !state.lines.is_empty() {
            let lines = state.lines.drain(..).collect();
            let dropped = std::mem::take(&mut state.dropped);
            return Some(Some(Delivery::Lines { lines, dropped }));
        }
        if state.finished {
            return Some(None);
        }
        if let Some(notice) = state.closed.clone() {
            state.finished = true;
            return Some(Some(Delivery::Closed(notice)));
        }
        None
    }

    /// Wait for the next delivery. Returns `None` after the close notice
    /// has been delivered.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.take() {
                return delivery;
            }
            self.notify.notified().await;
        }
    }
}

/// Recent lines kept server side so a client can re-filter without the
/// remote source being read again
#[derive(Debug)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        for line in lines {
            if self.lines.len() >= self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines containing `keyword`, or every line when there is none
    pub fn render(&self, keyword: Option<&str>) -> Vec<String> {
        self.lines
            .iter()
            .filter(|line| matches_keyword(line, keyword))
            .cloned()
            .collect()
    }
}

/// Case-insensitive substring match; an empty keyword matches everything
pub fn matches_keyword(line: &str, keyword: Option<&str>) -> bool {
    match keyword {
        Some(keyword) if !keyword.is_empty() => line.to_lowercase().contains(&keyword.to_lowercase()),
        _ => true,
    }
}
