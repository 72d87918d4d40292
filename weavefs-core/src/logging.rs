//! Shared log queue and the `tracing` layer that feeds it.
//!
//! Events recorded in this process go to a bounded pending buffer first. The
//! buffer is moved into the instance's shared [`LogQueue`] the next time this
//! process writes to the instance, or on a read once it is large or old enough
//! (see [`PendingLog::flush_due`]). Logging while the lock is held never
//! re-enters it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::types::LogLevel;

/// Maximum number of records kept in an instance's shared queue.
pub const LOG_QUEUE_CAPACITY: usize = 2048;

const PENDING_CAPACITY: usize = 1024;
const PENDING_FLUSH_THRESHOLD: usize = 64;
const PENDING_FLUSH_AGE_MS: i64 = 250;

static MAX_LEVEL: AtomicU8 = AtomicU8::new(2);
static PENDING: OnceLock<Arc<PendingLog>> = OnceLock::new();

/// One formatted log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub level: LogLevel,
    pub process_id: u32,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    /// Creates a record stamped with the current time and process id.
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            level,
            process_id: std::process::id(),
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timestamp() {
            Some(time) => write!(f, "{}", time.format("%H:%M:%S%.3f"))?,
            None => write!(f, "--:--:--.---")?,
        }
        write!(
            f,
            " [{}] ({}) {}: {}",
            self.level.tag(),
            self.process_id,
            self.target,
            self.message
        )
    }
}

/// Bounded queue of records shared by every process of an instance.
///
/// When full, the oldest record is dropped and counted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogQueue {
    records: VecDeque<LogRecord>,
    dropped: u64,
}

impl LogQueue {
    pub fn push(&mut self, record: LogRecord) {
        if self.records.len() >= LOG_QUEUE_CAPACITY {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(record);
    }

    pub fn pop(&mut self) -> Option<LogRecord> {
        self.records.pop_front()
    }

    pub fn front(&self) -> Option<&LogRecord> {
        self.records.front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.dropped = 0;
    }
}

/// Process-local buffer between the `tracing` layer and the shared queue.
#[derive(Debug, Default)]
pub struct PendingLog {
    records: Mutex<VecDeque<LogRecord>>,
    dropped: AtomicU64,
}

impl PendingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer used by [`SharedLogLayer::new`] and drained by instances.
    pub fn global() -> Arc<PendingLog> {
        PENDING.get_or_init(|| Arc::new(PendingLog::new())).clone()
    }

    pub fn push(&self, record: LogRecord) {
        let mut records = self.records.lock();
        if records.len() >= PENDING_CAPACITY {
            records.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// True when enough records are buffered, or the oldest has waited long
    /// enough, that a read should pay for forwarding them.
    pub fn flush_due(&self) -> bool {
        let records = self.records.lock();
        match records.front() {
            None => false,
            Some(_) if records.len() >= PENDING_FLUSH_THRESHOLD => true,
            Some(oldest) => Utc::now().timestamp_millis() - oldest.timestamp_ms >= PENDING_FLUSH_AGE_MS,
        }
    }

    /// Moves every buffered record into `queue`.
    ///
    /// # Returns
    /// Number of records moved
    pub fn drain_into(&self, queue: &mut LogQueue) -> usize {
        let mut records = self.records.lock();
        let count = records.len();
        for record in records.drain(..) {
            queue.push(record);
        }
        count
    }

    /// Records discarded before they reached an instance.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sets the most verbose level forwarded to the shared queue.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level.to_u8(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

/// `tracing` layer that turns events into [`LogRecord`]s.
pub struct SharedLogLayer {
    sink: Arc<PendingLog>,
    max_level: Option<LogLevel>,
}

impl SharedLogLayer {
    /// Creates a layer writing to the process-wide pending buffer.
    pub fn new() -> Self {
        Self::with_sink(PendingLog::global())
    }

    pub fn with_sink(sink: Arc<PendingLog>) -> Self {
        Self {
            sink,
            max_level: None,
        }
    }

    /// Pins the level of this layer instead of following [`set_max_level`].
    pub fn with_max_level(mut self, level: LogLevel) -> Self {
        self.max_level = Some(level);
        self
    }
}

impl Default for SharedLogLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subscriber> Layer<S> for SharedLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = LogLevel::from(metadata.level());
        if level > self.max_level.unwrap_or_else(max_level) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink
            .push(LogRecord::new(level, metadata.target(), visitor.finish()));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Installs the global subscriber.
///
/// Events always go to the shared queue of the connected instance; with
/// `to_local` they are also printed to stderr, filtered by `RUST_LOG`.
///
/// # Returns
/// `false` if a global subscriber was already installed
pub fn init_logging(to_local: bool) -> bool {
    let local = to_local.then(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(SharedLogLayer::new())
        .with(local)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_queue_bounded() {
        let mut queue = LogQueue::default();
        for i in 0..LOG_QUEUE_CAPACITY + 3 {
            queue.push(LogRecord::new(LogLevel::Info, "test", format!("record {}", i)));
        }
        assert_eq!(queue.len(), LOG_QUEUE_CAPACITY);
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.front().unwrap().message, "record 3");
    }

    #[test]
    fn test_record_format() {
        let record = LogRecord {
            timestamp_ms: 3_723_004,
            level: LogLevel::Warn,
            process_id: 42,
            target: "weavefs_core::link".to_string(),
            message: "linked".to_string(),
        };
        assert_eq!(record.to_string(), "01:02:03.004 [W] (42) weavefs_core::link: linked");
    }

    #[test]
    fn test_layer_records_events() {
        let sink = Arc::new(PendingLog::new());
        let subscriber = tracing_subscriber::registry()
            .with(SharedLogLayer::with_sink(sink.clone()).with_max_level(LogLevel::Info));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(count = 3, "linked entries");
            tracing::trace!("too verbose for the default level");
        });

        let mut queue = LogQueue::default();
        assert_eq!(sink.drain_into(&mut queue), 1);
        let record = queue.pop().unwrap();
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.message, "linked entries count=3");
        assert_eq!(record.process_id, std::process::id());
        assert!(sink.is_empty());
    }
}
