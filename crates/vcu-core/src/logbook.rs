//! In-memory status log, filled from `tracing` events and forwarded to the
//! ground station as STATUSTEXT.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use vcu_proto::mavlink::common::MavSeverity;

const MAX_ENTRIES: usize = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: u32,
    pub severity: MavSeverity,
    pub text: String,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<LogEntry>,
    next_id: u32,
    live: Option<mpsc::UnboundedSender<LogEntry>>,
}

#[derive(Default)]
pub struct LogBook {
    inner: Mutex<Inner>,
    paused: AtomicBool,
}

impl LogBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, severity: MavSeverity, text: impl Into<String>) {
        let mut inner = self.lock();
        let entry = LogEntry { id: inner.next_id, severity, text: text.into() };
        inner.next_id += 1;
        if inner.entries.len() == MAX_ENTRIES {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry.clone());
        if !self.paused.load(Ordering::Relaxed) {
            if let Some(tx) = &inner.live {
                if tx.send(entry).is_err() {
                    inner.live = None;
                }
            }
        }
    }

    /// Live feed of new entries; replaces any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().live = Some(tx);
        rx
    }

    /// Stops live forwarding while a replay is running. Entries are still kept.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn last_id(&self) -> Option<u32> {
        self.lock().entries.back().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries with `start <= id <= end`.
    pub fn range(&self, start: u32, end: u32) -> Vec<LogEntry> {
        self.lock().entries.iter().filter(|e| e.id >= start && e.id <= end).cloned().collect()
    }
}

fn severity(level: &Level, debug: bool) -> Option<MavSeverity> {
    match *level {
        Level::ERROR => Some(MavSeverity::MAV_SEVERITY_ERROR),
        Level::WARN => Some(MavSeverity::MAV_SEVERITY_WARNING),
        Level::INFO => Some(MavSeverity::MAV_SEVERITY_INFO),
        Level::DEBUG if debug => Some(MavSeverity::MAV_SEVERITY_DEBUG),
        _ => None,
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            write!(self.0, "{:?}", value).ok();
        }
    }
}

/// Captures events from the vehicle crates into a [`LogBook`].
pub struct LogBookLayer {
    book: Arc<LogBook>,
    debug: bool,
}

impl LogBookLayer {
    pub fn new(book: Arc<LogBook>, debug: bool) -> Self {
        Self { book, debug }
    }
}

impl<S: Subscriber> Layer<S> for LogBookLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !meta.target().starts_with("vcu") {
            return;
        }
        let Some(severity) = severity(meta.level(), self.debug) else {
            return;
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if !visitor.0.is_empty() {
            self.book.push(severity, visitor.0);
        }
    }
}
