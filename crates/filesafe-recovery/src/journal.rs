//! Rollback journal for multi-step file operations.
//!
//! Every operation the recovery manager runs gets one journal entry. Each step
//! that completes is appended together with a compensating action that undoes
//! it. When the operation fails for good, [`OperationLog::rollback`] runs the
//! compensations in strict reverse order of recording. A compensation that
//! fails is logged and reported in the [`RollbackResult`], and rollback
//! carries on with the earlier steps.
//!
//! Entries that reach a terminal status are kept in a bounded archive so a
//! repeated commit or rollback is answered with
//! [`JournalError::InvalidState`] instead of running anything twice.
//!
//! The journal itself lives in memory. Callers that need entries to survive a
//! restart persist a [`JournalSnapshot`] and hand it back to
//! [`OperationLog::restore`].

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, FileOpError, JournalError};
use crate::metadata::FileMetadata;
use crate::tracker::epoch_ms;

/// Default number of terminal entries kept for duplicate detection.
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 10_000;
/// Default bound on one compensating action.
pub const DEFAULT_COMPENSATION_TIMEOUT_MS: u64 = 30_000;

/// Inverse of a completed step, run during rollback.
#[async_trait]
pub trait CompensatingAction: Send + Sync {
    /// Undoes the step.
    async fn compensate(&self) -> Result<(), FileOpError>;
}

struct FnCompensation<F>(F);

#[async_trait]
impl<F, Fut> CompensatingAction for FnCompensation<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FileOpError>> + Send + 'static,
{
    async fn compensate(&self) -> Result<(), FileOpError> {
        (self.0)().await
    }
}

/// Wraps an async closure as a compensating action.
pub fn compensation_fn<F, Fut>(f: F) -> Box<dyn CompensatingAction>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FileOpError>> + Send + 'static,
{
    Box::new(FnCompensation(f))
}

/// Compensation for steps with nothing to undo, such as a read.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompensation;

#[async_trait]
impl CompensatingAction for NoCompensation {
    async fn compensate(&self) -> Result<(), FileOpError> {
        Ok(())
    }
}

/// Rebinds compensating actions to steps restored from a snapshot.
pub trait CompensationResolver: Send + Sync {
    /// Returns the compensation for `step`, or `None` if it cannot be undone.
    fn resolve(&self, operation_id: &str, step: &StepDescriptor)
        -> Option<Box<dyn CompensatingAction>>;
}

/// Serializable description of one completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Step name, unique among the live steps of one operation.
    pub name: String,
    /// Target the step ran against.
    pub target: String,
    /// Provider id of whatever the step created.
    pub provider_file_id: Option<String>,
    /// Free-form detail, e.g. an upload session id.
    pub detail: Option<String>,
}

impl StepDescriptor {
    /// Describes a step named `name` on `target`.
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            provider_file_id: None,
            detail: None,
        }
    }

    /// Sets the provider id the step produced.
    pub fn with_provider_file_id(mut self, id: impl Into<String>) -> Self {
        self.provider_file_id = Some(id.into());
        self
    }

    /// Sets free-form detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Overall status of a journaled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// In flight.
    Pending,
    /// Completed; immutable.
    Committed,
    /// Compensated after failure.
    RolledBack,
    /// Given up without compensation.
    Abandoned,
}

impl OperationStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Committed => "committed",
            OperationStatus::RolledBack => "rolled back",
            OperationStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compensation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    /// The step whose compensation failed.
    pub step: String,
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Failure detail.
    pub message: String,
}

/// Outcome of compensating an operation's steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    /// The operation that was rolled back.
    pub operation_id: String,
    /// Steps compensated successfully, in the order they were compensated.
    pub compensated: Vec<String>,
    /// Steps whose compensation failed, in the order they were attempted.
    pub failed: Vec<CompensationFailure>,
}

impl RollbackResult {
    /// An empty result for `operation_id`.
    pub fn empty(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            ..Self::default()
        }
    }

    /// True if every compensation succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of steps attempted.
    pub fn attempted(&self) -> usize {
        self.compensated.len() + self.failed.len()
    }

    /// Appends the outcome of a later compensation pass.
    pub fn merge(&mut self, later: RollbackResult) {
        self.compensated.extend(later.compensated);
        self.failed.extend(later.failed);
    }
}

impl fmt::Display for RollbackResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rolled back {} steps, {} compensations failed",
            self.compensated.len(),
            self.failed.len()
        )
    }
}

/// Journal limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Terminal entries kept; oldest are evicted first.
    pub archive_capacity: usize,
    /// Bound on one compensating action.
    pub compensation_timeout: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
            compensation_timeout: Duration::from_millis(DEFAULT_COMPENSATION_TIMEOUT_MS),
        }
    }
}

/// Journal counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStats {
    /// Entries begun or restored.
    pub begun: u64,
    /// Entries committed.
    pub committed: u64,
    /// Entries rolled back.
    pub rolled_back: u64,
    /// Entries abandoned.
    pub abandoned: u64,
    /// Steps recorded.
    pub steps_recorded: u64,
    /// Compensations that succeeded.
    pub compensations_run: u64,
    /// Compensations that failed.
    pub compensations_failed: u64,
}

struct JournaledStep {
    descriptor: StepDescriptor,
    action: Box<dyn CompensatingAction>,
}

struct JournalEntry {
    operation_id: String,
    metadata: FileMetadata,
    status: OperationStatus,
    steps: Vec<JournaledStep>,
    started_ms: u64,
    updated_ms: u64,
}

impl JournalEntry {
    fn require_pending(&self, action: &'static str) -> Result<(), JournalError> {
        if self.status == OperationStatus::Pending {
            Ok(())
        } else {
            Err(JournalError::InvalidState {
                operation_id: self.operation_id.clone(),
                status: self.status.as_str(),
                action,
            })
        }
    }

    fn finish(&mut self, status: OperationStatus) -> Vec<JournaledStep> {
        self.status = status;
        self.updated_ms = epoch_ms();
        std::mem::take(&mut self.steps)
    }

    fn to_snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            operation_id: self.operation_id.clone(),
            metadata: self.metadata.clone(),
            status: self.status,
            steps: self.steps.iter().map(|s| s.descriptor.clone()).collect(),
            started_ms: self.started_ms,
            updated_ms: self.updated_ms,
        }
    }
}

/// Handle to one journal entry, returned by [`OperationLog::begin`].
#[derive(Clone)]
pub struct JournalHandle {
    operation_id: String,
    entry: Arc<Mutex<JournalEntry>>,
}

impl JournalHandle {
    /// The journaled operation.
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Current status.
    pub fn status(&self) -> OperationStatus {
        self.entry.lock().status
    }
}

impl fmt::Debug for JournalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalHandle")
            .field("operation_id", &self.operation_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Serialized form of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// Operation id.
    pub operation_id: String,
    /// The file the operation acts on.
    pub metadata: FileMetadata,
    /// Status at snapshot time.
    pub status: OperationStatus,
    /// Live steps, in recording order.
    pub steps: Vec<StepDescriptor>,
    /// When the entry was begun (ms since epoch).
    pub started_ms: u64,
    /// Last status change (ms since epoch).
    pub updated_ms: u64,
}

/// Serialized form of the whole journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSnapshot {
    /// When the snapshot was taken (ms since epoch).
    pub taken_ms: u64,
    /// Pending entries first, then archived ones oldest first.
    pub entries: Vec<EntrySnapshot>,
}

impl JournalSnapshot {
    /// Encodes the snapshot with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, JournalError> {
        bincode::serialize(self).map_err(|e| JournalError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Decodes a snapshot produced by [`JournalSnapshot::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JournalError> {
        bincode::deserialize(bytes).map_err(|e| JournalError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Entries still pending.
    pub fn pending(&self) -> impl Iterator<Item = &EntrySnapshot> {
        self.entries
            .iter()
            .filter(|e| e.status == OperationStatus::Pending)
    }
}

/// What [`OperationLog::restore`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Pending entries restored with all compensations bound.
    pub pending: Vec<String>,
    /// Pending entries with unresolvable steps, marked abandoned.
    pub abandoned: Vec<String>,
    /// Terminal entries restored into the archive.
    pub archived: usize,
    /// Entries skipped because the id was already journaled.
    pub skipped: Vec<String>,
}

/// In-memory rollback journal.
pub struct OperationLog {
    config: JournalConfig,
    entries: DashMap<String, Arc<Mutex<JournalEntry>>>,
    archive: Mutex<VecDeque<String>>,
    stats: Mutex<JournalStats>,
}

impl OperationLog {
    /// Creates an empty journal.
    pub fn new(config: JournalConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            archive: Mutex::new(VecDeque::new()),
            stats: Mutex::new(JournalStats::default()),
        }
    }

    /// Opens an entry for `operation_id`.
    pub fn begin(
        &self,
        operation_id: impl Into<String>,
        metadata: FileMetadata,
    ) -> Result<JournalHandle, JournalError> {
        let operation_id = operation_id.into();
        let now = epoch_ms();
        let entry = Arc::new(Mutex::new(JournalEntry {
            operation_id: operation_id.clone(),
            metadata,
            status: OperationStatus::Pending,
            steps: Vec::new(),
            started_ms: now,
            updated_ms: now,
        }));

        match self.entries.entry(operation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(JournalError::DuplicateOperation { operation_id });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }
        self.stats.lock().begun += 1;
        debug!(operation_id = %operation_id, "journal entry begun");
        Ok(JournalHandle {
            operation_id,
            entry,
        })
    }

    /// Looks up the handle for an operation.
    pub fn handle(&self, operation_id: &str) -> Option<JournalHandle> {
        self.entries.get(operation_id).map(|e| JournalHandle {
            operation_id: operation_id.to_string(),
            entry: Arc::clone(e.value()),
        })
    }

    /// Appends a completed step and its compensating action.
    pub fn record_step(
        &self,
        handle: &JournalHandle,
        step: StepDescriptor,
        action: Box<dyn CompensatingAction>,
    ) -> Result<(), JournalError> {
        let mut entry = handle.entry.lock();
        entry.require_pending("record step")?;
        if entry.steps.iter().any(|s| s.descriptor.name == step.name) {
            return Err(JournalError::DuplicateStep {
                operation_id: handle.operation_id.clone(),
                step: step.name,
            });
        }
        debug!(
            operation_id = %handle.operation_id,
            step = %step.name,
            backend = %step.target,
            seq = entry.steps.len(),
            "journal step recorded"
        );
        entry.steps.push(JournaledStep {
            descriptor: step,
            action,
        });
        entry.updated_ms = epoch_ms();
        drop(entry);
        self.stats.lock().steps_recorded += 1;
        Ok(())
    }

    /// Whether a live step named `name` exists, so a retry can skip it.
    pub fn has_step(&self, handle: &JournalHandle, name: &str) -> bool {
        handle
            .entry
            .lock()
            .steps
            .iter()
            .any(|s| s.descriptor.name == name)
    }

    /// Descriptors of the live steps, in recording order.
    pub fn steps(&self, handle: &JournalHandle) -> Vec<StepDescriptor> {
        handle
            .entry
            .lock()
            .steps
            .iter()
            .map(|s| s.descriptor.clone())
            .collect()
    }

    /// Marks the operation committed. Its compensations are discarded.
    pub fn commit(&self, handle: &JournalHandle) -> Result<(), JournalError> {
        let steps = {
            let mut entry = handle.entry.lock();
            entry.require_pending("commit")?;
            entry.finish(OperationStatus::Committed)
        };
        self.archive(&handle.operation_id);
        self.stats.lock().committed += 1;
        info!(operation_id = %handle.operation_id, steps = steps.len(), "operation committed");
        Ok(())
    }

    /// Compensates every step in reverse order and marks the operation rolled back.
    ///
    /// Fails only if the operation is not pending. Compensation failures are
    /// reported in the result.
    pub async fn rollback(&self, handle: &JournalHandle) -> Result<RollbackResult, JournalError> {
        let steps = {
            let mut entry = handle.entry.lock();
            entry.require_pending("roll back")?;
            entry.finish(OperationStatus::RolledBack)
        };
        self.archive(&handle.operation_id);
        self.stats.lock().rolled_back += 1;

        let result = self.compensate(&handle.operation_id, steps).await;
        info!(
            operation_id = %handle.operation_id,
            compensated = result.compensated.len(),
            failed = result.failed.len(),
            "operation rolled back"
        );
        Ok(result)
    }

    /// Rolls back by id.
    pub async fn rollback_by_id(&self, operation_id: &str) -> Result<RollbackResult, JournalError> {
        let handle = self
            .handle(operation_id)
            .ok_or_else(|| JournalError::UnknownOperation {
                operation_id: operation_id.to_string(),
            })?;
        self.rollback(&handle).await
    }

    /// Compensates the live steps in reverse order but leaves the operation
    /// pending, so it can continue on another target.
    pub async fn unwind(&self, handle: &JournalHandle) -> Result<RollbackResult, JournalError> {
        let steps = {
            let mut entry = handle.entry.lock();
            entry.require_pending("unwind")?;
            entry.updated_ms = epoch_ms();
            std::mem::take(&mut entry.steps)
        };
        debug!(operation_id = %handle.operation_id, steps = steps.len(), "unwinding steps");
        Ok(self.compensate(&handle.operation_id, steps).await)
    }

    /// Marks the operation abandoned without compensating anything.
    pub fn abandon(&self, handle: &JournalHandle) -> Result<(), JournalError> {
        let steps = {
            let mut entry = handle.entry.lock();
            entry.require_pending("abandon")?;
            entry.finish(OperationStatus::Abandoned)
        };
        self.archive(&handle.operation_id);
        self.stats.lock().abandoned += 1;
        warn!(
            operation_id = %handle.operation_id,
            steps = steps.len(),
            "operation abandoned with uncompensated steps"
        );
        Ok(())
    }

    /// Status of an operation, if it is still journaled or archived.
    pub fn status(&self, operation_id: &str) -> Option<OperationStatus> {
        self.entries.get(operation_id).map(|e| e.value().lock().status)
    }

    /// Number of pending operations.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().lock().status == OperationStatus::Pending)
            .count()
    }

    /// Number of archived terminal entries.
    pub fn archived_count(&self) -> usize {
        self.archive.lock().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> JournalStats {
        self.stats.lock().clone()
    }

    /// Captures every entry for persistence.
    pub fn snapshot(&self) -> JournalSnapshot {
        let archived: Vec<String> = self.archive.lock().iter().cloned().collect();
        let mut entries: Vec<EntrySnapshot> = self
            .entries
            .iter()
            .map(|e| e.value().lock().to_snapshot())
            .filter(|e| e.status == OperationStatus::Pending)
            .collect();
        entries.sort_by(|a, b| {
            (a.started_ms, &a.operation_id).cmp(&(b.started_ms, &b.operation_id))
        });
        entries.extend(
            archived
                .iter()
                .filter_map(|id| self.entries.get(id).map(|e| e.value().lock().to_snapshot())),
        );
        JournalSnapshot {
            taken_ms: epoch_ms(),
            entries,
        }
    }

    /// Loads entries from a snapshot, binding compensations through `resolver`.
    ///
    /// A pending entry with any step the resolver cannot bind is marked
    /// abandoned, since it can no longer be rolled back completely.
    pub fn restore(
        &self,
        snapshot: JournalSnapshot,
        resolver: &dyn CompensationResolver,
    ) -> RestoreReport {
        let mut report = RestoreReport::default();

        for snap in snapshot.entries {
            if self.entries.contains_key(&snap.operation_id) {
                warn!(operation_id = %snap.operation_id, "skipping restore of journaled operation");
                report.skipped.push(snap.operation_id);
                continue;
            }

            let mut status = snap.status;
            let mut steps = Vec::with_capacity(snap.steps.len());
            if status == OperationStatus::Pending {
                for descriptor in snap.steps {
                    match resolver.resolve(&snap.operation_id, &descriptor) {
                        Some(action) => steps.push(JournaledStep { descriptor, action }),
                        None => {
                            warn!(
                                operation_id = %snap.operation_id,
                                step = %descriptor.name,
                                "no compensation for restored step, abandoning operation"
                            );
                            status = OperationStatus::Abandoned;
                            steps.clear();
                            break;
                        }
                    }
                }
            }

            let entry = JournalEntry {
                operation_id: snap.operation_id.clone(),
                metadata: snap.metadata,
                status,
                steps,
                started_ms: snap.started_ms,
                updated_ms: snap.updated_ms,
            };
            self.entries
                .insert(snap.operation_id.clone(), Arc::new(Mutex::new(entry)));

            match (snap.status, status) {
                (OperationStatus::Pending, OperationStatus::Pending) => {
                    self.stats.lock().begun += 1;
                    report.pending.push(snap.operation_id);
                }
                (OperationStatus::Pending, _) => {
                    self.stats.lock().abandoned += 1;
                    self.archive(&snap.operation_id);
                    report.abandoned.push(snap.operation_id);
                }
                _ => {
                    self.archive(&snap.operation_id);
                    report.archived += 1;
                }
            }
        }

        info!(
            pending = report.pending.len(),
            abandoned = report.abandoned.len(),
            archived = report.archived,
            "journal restored"
        );
        report
    }

    /// Rolls back every pending entry. Used after [`OperationLog::restore`]
    /// to clean up operations that were in flight when the process stopped.
    pub async fn recover_pending(&self) -> Vec<RollbackResult> {
        let mut pending: Vec<JournalHandle> = self
            .entries
            .iter()
            .filter(|e| e.value().lock().status == OperationStatus::Pending)
            .map(|e| JournalHandle {
                operation_id: e.key().clone(),
                entry: Arc::clone(e.value()),
            })
            .collect();
        pending.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));

        let mut results = Vec::with_capacity(pending.len());
        for handle in pending {
            // Another task may have finished the entry since it was listed.
            if let Ok(result) = self.rollback(&handle).await {
                results.push(result);
            }
        }
        results
    }

    async fn compensate(&self, operation_id: &str, steps: Vec<JournaledStep>) -> RollbackResult {
        let mut result = RollbackResult::empty(operation_id);

        for step in steps.into_iter().rev() {
            let name = step.descriptor.name;
            let outcome =
                tokio::time::timeout(self.config.compensation_timeout, step.action.compensate())
                    .await
                    .unwrap_or_else(|_| Err(FileOpError::timed_out(self.config.compensation_timeout)));

            match outcome {
                Ok(()) => {
                    debug!(operation_id, step = %name, "step compensated");
                    result.compensated.push(name);
                }
                Err(err) => {
                    warn!(
                        operation_id,
                        step = %name,
                        kind = %err.kind,
                        error = %err.message,
                        "compensation failed, continuing rollback"
                    );
                    result.failed.push(CompensationFailure {
                        step: name,
                        kind: err.kind,
                        message: err.message,
                    });
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.compensations_run += result.compensated.len() as u64;
        stats.compensations_failed += result.failed.len() as u64;
        result
    }

    fn archive(&self, operation_id: &str) {
        let evicted = {
            let mut archive = self.archive.lock();
            archive.push_back(operation_id.to_string());
            if archive.len() > self.config.archive_capacity {
                archive.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            self.entries.remove(&old);
            debug!(operation_id = %old, "evicted archived journal entry");
        }
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new(JournalConfig::default())
    }
}

impl fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationLog")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish()
    }
}
