//! Error tracking for diagnostics and breaker tuning.
//!
//! [`ErrorTracker::record`] writes each classified failure to a durable
//! [`ErrorSink`] under a bounded timeout. A slow or failing sink never fails
//! the file operation: the record is kept in a bounded local buffer, logged,
//! and reported back as [`RecordOutcome::Buffered`] (or `Dropped` once the
//! buffer is full) so callers can see that observability is degraded.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorKind;

/// Default time a sink write may take before the record is buffered.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 50;
/// Default number of records kept for [`ErrorTracker::query`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 4096;
/// Default number of records buffered while the sink is failing.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Milliseconds since the UNIX epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Immutable record of one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// The operation that failed.
    pub operation_id: String,
    /// The provider or backend that failed.
    pub target: String,
    /// Classification.
    pub kind: ErrorKind,
    /// Wall-clock time of the failure (ms since epoch).
    pub timestamp_ms: u64,
    /// 1-based attempt number on this target.
    pub attempt: u32,
    /// Underlying message, if any.
    pub message: Option<String>,
}

impl ErrorContext {
    /// Captures a failure now.
    pub fn new(
        operation_id: impl Into<String>,
        target: impl Into<String>,
        kind: ErrorKind,
        attempt: u32,
        message: Option<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            target: target.into(),
            kind,
            timestamp_ms: epoch_ms(),
            attempt,
            message,
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on '{}' (attempt {})",
            self.kind, self.target, self.attempt
        )?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Failure writing to a durable sink.
#[derive(Debug, Clone, Error)]
#[error("error sink unavailable: {0}")]
pub struct SinkError(pub String);

/// Durable destination for error records, such as a tracked-error table.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// Persists one record.
    async fn write(&self, context: &ErrorContext) -> Result<(), SinkError>;

    /// Reads back records for diagnostics tooling.
    async fn query(&self, filter: &ErrorFilter) -> Result<Vec<ErrorContext>, SinkError>;
}

/// In-memory sink, useful for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryErrorSink {
    records: Mutex<Vec<ErrorContext>>,
}

impl InMemoryErrorSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records persisted.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True if nothing has been persisted.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ErrorSink for InMemoryErrorSink {
    async fn write(&self, context: &ErrorContext) -> Result<(), SinkError> {
        self.records.lock().push(context.clone());
        Ok(())
    }

    async fn query(&self, filter: &ErrorFilter) -> Result<Vec<ErrorContext>, SinkError> {
        Ok(filter.apply(self.records.lock().iter()))
    }
}

/// Selection criteria for [`ErrorTracker::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFilter {
    /// Only records for this operation.
    pub operation_id: Option<String>,
    /// Only records for this target.
    pub target: Option<String>,
    /// Only records of this kind.
    pub kind: Option<ErrorKind>,
    /// Only records at or after this time (ms since epoch).
    pub since_ms: Option<u64>,
    /// Return at most this many records, newest last.
    pub limit: Option<usize>,
}

impl ErrorFilter {
    /// Matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches records for one operation.
    pub fn for_operation(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: Some(operation_id.into()),
            ..Self::default()
        }
    }

    /// Matches records for one target.
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    /// Whether `context` satisfies every set criterion.
    pub fn matches(&self, context: &ErrorContext) -> bool {
        self.operation_id
            .as_deref()
            .map_or(true, |id| id == context.operation_id)
            && self.target.as_deref().map_or(true, |t| t == context.target)
            && self.kind.map_or(true, |k| k == context.kind)
            && self.since_ms.map_or(true, |s| context.timestamp_ms >= s)
    }

    fn apply<'a>(&self, records: impl Iterator<Item = &'a ErrorContext>) -> Vec<ErrorContext> {
        let mut matched: Vec<ErrorContext> =
            records.filter(|c| self.matches(c)).cloned().collect();
        if let Some(limit) = self.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}

/// What happened to a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Written to the durable sink (or no sink is configured).
    Persisted,
    /// The sink failed or timed out; kept in the local buffer.
    Buffered,
    /// The sink failed and the local buffer is full; only logged.
    Dropped,
}

impl RecordOutcome {
    /// True unless the record reached the sink.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, RecordOutcome::Persisted)
    }
}

/// Tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Bound on one sink write.
    pub flush_timeout: Duration,
    /// Records kept for local queries.
    pub history_capacity: usize,
    /// Records buffered while the sink is failing.
    pub buffer_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Tracker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Records passed to [`ErrorTracker::record`].
    pub recorded: u64,
    /// Records written to the sink, including flushed ones.
    pub persisted: u64,
    /// Records that went to the local buffer.
    pub buffered: u64,
    /// Records lost because the buffer was full.
    pub dropped: u64,
    /// Records currently waiting in the buffer.
    pub pending: usize,
}

#[derive(Debug, Default)]
struct TrackerState {
    history: VecDeque<ErrorContext>,
    pending: VecDeque<ErrorContext>,
    counts: BTreeMap<(String, ErrorKind), u64>,
    stats: TrackerStats,
}

/// Records classified failures.
pub struct ErrorTracker {
    config: TrackerConfig,
    sink: Option<Arc<dyn ErrorSink>>,
    state: Mutex<TrackerState>,
}

impl ErrorTracker {
    /// Creates a tracker that only keeps local history.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            sink: None,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Creates a tracker that persists to `sink`.
    pub fn with_sink(config: TrackerConfig, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(config)
        }
    }

    /// Records one failure. Never fails; see [`RecordOutcome`].
    pub async fn record(&self, context: ErrorContext) -> RecordOutcome {
        self.remember(&context);

        let Some(sink) = &self.sink else {
            self.state.lock().stats.persisted += 1;
            return RecordOutcome::Persisted;
        };

        let failure = match tokio::time::timeout(self.config.flush_timeout, sink.write(&context)).await {
            Ok(Ok(())) => {
                self.state.lock().stats.persisted += 1;
                debug!(operation_id = %context.operation_id, kind = %context.kind, "error recorded");
                return RecordOutcome::Persisted;
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!(
                "sink write exceeded {}ms",
                self.config.flush_timeout.as_millis()
            ),
        };

        warn!(
            operation_id = %context.operation_id,
            backend = %context.target,
            kind = %context.kind,
            attempt = context.attempt,
            timestamp_ms = context.timestamp_ms,
            message = context.message.as_deref().unwrap_or(""),
            reason = %failure,
            "error sink write failed, buffering locally"
        );
        self.buffer(context)
    }

    /// Retries buffered records against the sink. Returns how many were persisted.
    pub async fn flush_pending(&self) -> usize {
        let Some(sink) = &self.sink else {
            return 0;
        };
        let batch: Vec<ErrorContext> = self.state.lock().pending.drain(..).collect();
        let mut flushed = 0;
        let mut remaining = batch.into_iter();

        for context in remaining.by_ref() {
            let written =
                tokio::time::timeout(self.config.flush_timeout, sink.write(&context)).await;
            if matches!(written, Ok(Ok(()))) {
                flushed += 1;
            } else {
                let mut state = self.state.lock();
                state.pending.push_front(context);
                break;
            }
        }

        let mut state = self.state.lock();
        // Whatever was not attempted goes back behind the record that failed.
        for context in remaining {
            state.pending.push_back(context);
        }
        state.stats.persisted += flushed as u64;
        state.stats.pending = state.pending.len();
        if flushed > 0 {
            debug!(flushed, pending = state.pending.len(), "flushed buffered errors");
        }
        flushed
    }

    /// Queries local history.
    pub fn query(&self, filter: &ErrorFilter) -> Vec<ErrorContext> {
        filter.apply(self.state.lock().history.iter())
    }

    /// Total failures per (target, kind), for breaker and retry tuning.
    pub fn counts(&self) -> BTreeMap<(String, ErrorKind), u64> {
        self.state.lock().counts.clone()
    }

    /// Failures recorded against one target.
    pub fn count_for_target(&self, target: &str) -> u64 {
        self.state
            .lock()
            .counts
            .iter()
            .filter(|((t, _), _)| t == target)
            .map(|(_, n)| n)
            .sum()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TrackerStats {
        let state = self.state.lock();
        TrackerStats {
            pending: state.pending.len(),
            ..state.stats.clone()
        }
    }

    fn remember(&self, context: &ErrorContext) {
        let mut state = self.state.lock();
        state.stats.recorded += 1;
        *state
            .counts
            .entry((context.target.clone(), context.kind))
            .or_insert(0) += 1;
        if self.config.history_capacity > 0 {
            if state.history.len() == self.config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(context.clone());
        }
    }

    fn buffer(&self, context: ErrorContext) -> RecordOutcome {
        let mut state = self.state.lock();
        if state.pending.len() >= self.config.buffer_capacity {
            state.stats.dropped += 1;
            warn!(
                operation_id = %context.operation_id,
                capacity = self.config.buffer_capacity,
                "error buffer full, record kept only in logs"
            );
            return RecordOutcome::Dropped;
        }
        state.pending.push_back(context);
        state.stats.buffered += 1;
        state.stats.pending = state.pending.len();
        RecordOutcome::Buffered
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("config", &self.config)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
