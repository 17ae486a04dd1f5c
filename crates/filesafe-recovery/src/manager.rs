//! The recovery manager: retry, breaker, journal, fallback and rollback
//! around one caller-supplied file operation.
//!
//! # Flow
//!
//! 1. The target's breaker is asked for a permit. If it refuses, the fallback
//!    router is consulted; with no alternate the operation fails with
//!    [`RecoveryError::CircuitOpen`] before anything is journaled.
//! 2. A journal entry is opened.
//! 3. The operation runs under the per-attempt deadline, raced against the
//!    cancel token. Success records a completion step, commits the entry,
//!    heals the breaker and marks the file stored.
//! 4. A failure is recorded with the error tracker and handed to the retry
//!    policy. Retries sleep without blocking other operations. Once retries
//!    are exhausted the breaker is told, the router may pick another target
//!    (the steps journaled against the failed target are unwound first), and
//!    otherwise the entry is rolled back and a terminal error returned.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelRegistry, CancelToken};
use crate::circuitbreaker::{BreakerPermit, BreakerRegistry};
use crate::config::{RecoveryOptions, RerouteBudget};
use crate::error::{ConfigError, ErrorKind, FileOpError, JournalError, RecoveryError, Result};
use crate::fallback::FallbackRouter;
use crate::journal::{
    CompensatingAction, JournalHandle, NoCompensation, OperationLog, OperationStatus,
    RollbackResult, StepDescriptor,
};
use crate::metadata::{FileMetadata, LifecycleState, MetadataStore};
use crate::provider::{delete_compensation, FileProvider, ProviderRegistry};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::tracker::{ErrorContext, ErrorSink, ErrorTracker, RecordOutcome};

/// Default name of the step recorded when an operation succeeds.
pub const COMPLETION_STEP: &str = "complete";

/// A file operation to run under recovery.
#[derive(Debug, Clone)]
pub struct FileOperation {
    /// Unique operation id; also the journal key.
    pub operation_id: String,
    /// Requested target.
    pub target: String,
    /// The file the operation acts on.
    pub metadata: FileMetadata,
    /// Retry settings; the manager's defaults when `None`.
    pub retry: Option<RetryConfig>,
    /// Caller cancellation.
    pub cancel: Option<CancelToken>,
    /// Name of the step recorded on success.
    pub completion_step: String,
}

impl FileOperation {
    /// Describes an operation on `metadata` against `target`.
    pub fn new(
        operation_id: impl Into<String>,
        target: impl Into<String>,
        metadata: FileMetadata,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            target: target.into(),
            metadata,
            retry: None,
            cancel: None,
            completion_step: COMPLETION_STEP.to_string(),
        }
    }

    /// Like [`FileOperation::new`] with a generated operation id.
    pub fn for_file(target: impl Into<String>, metadata: FileMetadata) -> Self {
        Self::new(Uuid::new_v4().to_string(), target, metadata)
    }

    /// Overrides the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Attaches a cancel token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Renames the completion step.
    pub fn with_completion_step(mut self, name: impl Into<String>) -> Self {
        self.completion_step = name.into();
        self
    }
}

/// What one attempt gets to work with.
#[derive(Clone)]
pub struct AttemptContext {
    /// The operation.
    pub operation_id: String,
    /// Target of this attempt.
    pub target: String,
    /// Provider serving the target.
    pub provider: Arc<dyn FileProvider>,
    /// 1-based attempt number on this target.
    pub attempt: u32,
    /// The file the operation acts on.
    pub metadata: FileMetadata,
    journal: Arc<OperationLog>,
    handle: JournalHandle,
}

impl AttemptContext {
    /// A step descriptor named `name` on this attempt's target.
    pub fn step(&self, name: impl Into<String>) -> StepDescriptor {
        StepDescriptor::new(name, self.target.clone())
    }

    /// Journals a completed step.
    pub fn record_step(
        &self,
        step: StepDescriptor,
        action: Box<dyn CompensatingAction>,
    ) -> std::result::Result<(), FileOpError> {
        self.journal
            .record_step(&self.handle, step, action)
            .map_err(FileOpError::from)
    }

    /// Whether an earlier attempt already journaled `name` on this target.
    pub fn has_step(&self, name: &str) -> bool {
        self.journal.has_step(&self.handle, name)
    }

    /// Descriptors of the steps journaled so far.
    pub fn steps(&self) -> Vec<StepDescriptor> {
        self.journal.steps(&self.handle)
    }
}

impl fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptContext")
            .field("operation_id", &self.operation_id)
            .field("target", &self.target)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// A best-effort side effect that did not fully succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Degradation {
    /// An error record did not reach the durable sink.
    TrackerWrite {
        /// Target of the failed attempt.
        target: String,
        /// Attempt number of the failed attempt.
        attempt: u32,
        /// True if the record was buffered, false if it was dropped.
        buffered: bool,
    },
    /// The metadata hook failed.
    MetadataUpdate {
        /// State that could not be written.
        state: LifecycleState,
        /// Failure detail.
        message: String,
    },
}

/// Result of a successful [`RecoveryManager::execute`].
#[derive(Debug, Clone)]
pub struct RecoveryOutcome<T> {
    /// The operation's return value.
    pub value: T,
    /// Target that served the operation.
    pub target: String,
    /// Provider calls made across all targets.
    pub attempts: u32,
    /// Targets visited, in order.
    pub targets_tried: Vec<String>,
    /// Retry delays waited, in order.
    pub delays: Vec<Duration>,
    /// Compensations run when leaving failed targets.
    pub unwound: RollbackResult,
    /// Best-effort side effects that degraded.
    pub degraded: Vec<Degradation>,
}

impl<T> RecoveryOutcome<T> {
    /// Whether the operation ended on a different target than requested.
    pub fn rerouted(&self) -> bool {
        self.targets_tried.len() > 1
    }

    /// Whether observability or metadata updates degraded.
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

enum AttemptOutcome<T> {
    Done(T),
    Failed(FileOpError),
    Cancelled(CancelReason),
}

struct RunState {
    tried: HashSet<String>,
    targets_tried: Vec<String>,
    total_attempts: u32,
    delays: Vec<Duration>,
    unwound: RollbackResult,
    degraded: Vec<Degradation>,
}

impl RunState {
    fn new(operation_id: &str) -> Self {
        Self {
            tried: HashSet::new(),
            targets_tried: Vec::new(),
            total_attempts: 0,
            delays: Vec::new(),
            unwound: RollbackResult::empty(operation_id),
            degraded: Vec::new(),
        }
    }

    fn visit(&mut self, target: &str) {
        if self.tried.insert(target.to_string()) {
            self.targets_tried.push(target.to_string());
        }
    }
}

struct Lease {
    target: String,
    provider: Arc<dyn FileProvider>,
    permit: BreakerPermit,
}

/// Ties one `execute` call to its registry slot and journal entry.
///
/// Dropping it releases the cancel slot. If the caller dropped the `execute`
/// future while the entry was still pending, the entry is rolled back on a
/// background task and the file marked failed; outside a runtime the entry is
/// left pending for [`OperationLog::recover_pending`].
struct InFlight<'a> {
    cancels: &'a CancelRegistry,
    journal: Arc<OperationLog>,
    metadata: Arc<dyn MetadataStore>,
    operation_id: String,
    file_id: String,
    handle: Option<JournalHandle>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.cancels.complete(&self.operation_id);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.status() != OperationStatus::Pending {
            return;
        }

        let operation_id = self.operation_id.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%operation_id, "operation abandoned outside a runtime, left pending");
            return;
        };
        warn!(%operation_id, "operation abandoned mid-flight, rolling back");
        let journal = Arc::clone(&self.journal);
        let metadata = Arc::clone(&self.metadata);
        let file_id = self.file_id.clone();
        runtime.spawn(async move {
            match journal.rollback(&handle).await {
                Ok(result) => debug!(%operation_id, %result, "abandoned operation rolled back"),
                Err(err) => warn!(%operation_id, error = %err, "abandoned operation not rolled back"),
            }
            if let Err(err) = metadata
                .update_file_state(&file_id, LifecycleState::Failed, None)
                .await
            {
                warn!(%file_id, error = %err, "metadata update failed");
            }
        });
    }
}

/// Builds a [`RecoveryManager`].
pub struct RecoveryManagerBuilder {
    options: RecoveryOptions,
    providers: Arc<ProviderRegistry>,
    metadata: Arc<dyn MetadataStore>,
    sink: Option<Arc<dyn ErrorSink>>,
    breakers: Option<Arc<BreakerRegistry>>,
    journal: Option<Arc<OperationLog>>,
}

impl RecoveryManagerBuilder {
    /// Uses `options` instead of the defaults.
    pub fn options(mut self, options: RecoveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Persists error records to `sink`.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Shares an existing breaker registry.
    pub fn breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Shares an existing journal, e.g. one restored from a snapshot.
    pub fn journal(mut self, journal: Arc<OperationLog>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Validates the options and builds the manager.
    pub fn build(self) -> std::result::Result<RecoveryManager, ConfigError> {
        self.options.validate()?;
        let options = self.options;
        let tracker = match self.sink {
            Some(sink) => ErrorTracker::with_sink(options.tracker_config(), sink),
            None => ErrorTracker::new(options.tracker_config()),
        };
        let (_, shutdown) = new_cancel_pair();
        Ok(RecoveryManager {
            breakers: self
                .breakers
                .unwrap_or_else(|| Arc::new(BreakerRegistry::new(options.breaker_config()))),
            journal: self
                .journal
                .unwrap_or_else(|| Arc::new(OperationLog::new(options.journal_config()))),
            router: options.fallback_router(),
            tracker: Arc::new(tracker),
            retry: options.retry_config(),
            attempt_timeout: options.attempt_timeout(),
            reroute_budget: options.reroute_budget,
            providers: self.providers,
            metadata: self.metadata,
            cancels: CancelRegistry::new(),
            shutdown,
            options,
        })
    }
}

/// Orchestrates recovery for file operations.
pub struct RecoveryManager {
    providers: Arc<ProviderRegistry>,
    breakers: Arc<BreakerRegistry>,
    journal: Arc<OperationLog>,
    router: FallbackRouter,
    tracker: Arc<ErrorTracker>,
    metadata: Arc<dyn MetadataStore>,
    cancels: CancelRegistry,
    shutdown: CancelHandle,
    retry: RetryConfig,
    attempt_timeout: Duration,
    reroute_budget: RerouteBudget,
    options: RecoveryOptions,
}

impl RecoveryManager {
    /// Starts building a manager over `providers`, reporting file state to `metadata`.
    pub fn builder(
        providers: Arc<ProviderRegistry>,
        metadata: Arc<dyn MetadataStore>,
    ) -> RecoveryManagerBuilder {
        RecoveryManagerBuilder {
            options: RecoveryOptions::default(),
            providers,
            metadata,
            sink: None,
            breakers: None,
            journal: None,
        }
    }

    /// Breaker registry.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Rollback journal.
    pub fn journal(&self) -> &Arc<OperationLog> {
        &self.journal
    }

    /// Error tracker.
    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    /// Fallback router.
    pub fn router(&self) -> &FallbackRouter {
        &self.router
    }

    /// Provider registry.
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Effective options.
    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    /// Cancels one in-flight operation. Returns false if it is not running.
    pub fn cancel(&self, operation_id: &str, reason: CancelReason) -> bool {
        self.cancels.cancel(operation_id, reason)
    }

    /// Cancels every in-flight operation started without a caller token.
    pub fn shutdown(&self) {
        info!(active = self.cancels.stats().active, "cancelling in-flight operations");
        self.shutdown.cancel(CancelReason::Shutdown);
    }

    /// Runs `call` under recovery.
    ///
    /// `call` is invoked once per attempt with a fresh [`AttemptContext`]. It
    /// should journal each completed sub-step through the context so that a
    /// failure can be compensated, and may use [`AttemptContext::has_step`] to
    /// resume after a retry.
    pub async fn execute<T, F, Fut>(&self, op: FileOperation, call: F) -> Result<RecoveryOutcome<T>>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, FileOpError>>,
    {
        let parent = op.cancel.clone().unwrap_or_else(|| self.shutdown.token());
        let Some(cancel) = self.cancels.register(&op.operation_id, &parent) else {
            warn!(operation_id = %op.operation_id, "operation id already in flight");
            return Err(RecoveryError::Journal(JournalError::DuplicateOperation {
                operation_id: op.operation_id,
            }));
        };
        let mut in_flight = InFlight {
            cancels: &self.cancels,
            journal: Arc::clone(&self.journal),
            metadata: Arc::clone(&self.metadata),
            operation_id: op.operation_id.clone(),
            file_id: op.metadata.file_id.clone(),
            handle: None,
        };
        self.run(op, cancel, call, &mut in_flight).await
    }

    /// Uploads `data` as a single object, journaling a delete as its compensation.
    pub async fn upload(&self, op: FileOperation, data: Bytes) -> Result<RecoveryOutcome<String>> {
        self.execute(op, move |ctx| {
            let data = data.clone();
            async move {
                let id = ctx.provider.upload(data, &ctx.metadata).await?;
                ctx.record_step(
                    ctx.step("upload").with_provider_file_id(id.clone()),
                    delete_compensation(Arc::clone(&ctx.provider), id.clone()),
                )?;
                Ok(id)
            }
        })
        .await
    }

    /// Downloads `provider_file_id`.
    pub async fn download(
        &self,
        op: FileOperation,
        provider_file_id: &str,
    ) -> Result<RecoveryOutcome<Bytes>> {
        let id = provider_file_id.to_string();
        self.execute(op, move |ctx| {
            let id = id.clone();
            async move { ctx.provider.download(&id).await }
        })
        .await
    }

    async fn run<T, F, Fut>(
        &self,
        op: FileOperation,
        cancel: CancelToken,
        mut call: F,
        in_flight: &mut InFlight<'_>,
    ) -> Result<RecoveryOutcome<T>>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, FileOpError>>,
    {
        let retry = op.retry.clone().unwrap_or_else(|| self.retry.clone());
        let mut state = RunState::new(&op.operation_id);

        let mut lease = self.admit(&op.target, &mut state)?;
        let handle = self.journal.begin(op.operation_id.clone(), op.metadata.clone())?;
        in_flight.handle = Some(handle.clone());
        info!(
            operation_id = %op.operation_id,
            backend = %lease.target,
            probe = lease.permit.is_probe(),
            "operation started"
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            state.total_attempts += 1;
            let ctx = AttemptContext {
                operation_id: op.operation_id.clone(),
                target: lease.target.clone(),
                provider: Arc::clone(&lease.provider),
                attempt,
                metadata: op.metadata.clone(),
                journal: Arc::clone(&self.journal),
                handle: handle.clone(),
            };

            let outcome = tokio::select! {
                biased;
                reason = cancel.cancelled() => AttemptOutcome::Cancelled(reason),
                result = tokio::time::timeout(self.attempt_timeout, call(ctx)) => match result {
                    Ok(Ok(value)) => AttemptOutcome::Done(value),
                    Ok(Err(err)) => AttemptOutcome::Failed(err),
                    Err(_) => AttemptOutcome::Failed(FileOpError::timed_out(self.attempt_timeout)),
                },
            };

            let err = match outcome {
                AttemptOutcome::Done(value) => {
                    return self.succeed(&op, &handle, lease, state, value).await;
                }
                AttemptOutcome::Cancelled(reason) => {
                    drop(lease);
                    return self.abort_cancelled(&op, &handle, state, reason).await;
                }
                AttemptOutcome::Failed(err) => err,
            };

            let context = ErrorContext::new(
                op.operation_id.clone(),
                lease.target.clone(),
                err.kind,
                attempt,
                Some(err.message.clone()),
            );
            self.track(&mut state, context.clone()).await;

            let budget_attempt = match self.reroute_budget {
                RerouteBudget::PerTarget => attempt,
                RerouteBudget::Shared => state.total_attempts,
            };
            let decision =
                RetryPolicy::decide_with_hint(err.kind, budget_attempt, &retry, err.retry_after);
            if decision.retry {
                warn!(
                    operation_id = %op.operation_id,
                    backend = %lease.target,
                    attempt,
                    kind = %err.kind,
                    delay_ms = decision.delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                state.delays.push(decision.delay);
                let interrupted = tokio::select! {
                    biased;
                    reason = cancel.cancelled() => Some(reason),
                    _ = tokio::time::sleep(decision.delay) => None,
                };
                if let Some(reason) = interrupted {
                    drop(lease);
                    return self.abort_cancelled(&op, &handle, state, reason).await;
                }
                continue;
            }

            let failed_target = lease.target.clone();
            lease.permit.failure(err.kind);

            let may_reroute = match self.reroute_budget {
                RerouteBudget::PerTarget => true,
                RerouteBudget::Shared => state.total_attempts < retry.max_attempts,
            };
            let next = if may_reroute {
                self.reroute(&failed_target, err.kind, &mut state)
            } else {
                None
            };
            match next {
                Some(next) => {
                    let unwound = self.journal.unwind(&handle).await?;
                    info!(
                        operation_id = %op.operation_id,
                        from = %failed_target,
                        to = %next.target,
                        unwound = unwound.attempted(),
                        "continuing on fallback target"
                    );
                    state.unwound.merge(unwound);
                    lease = next;
                    attempt = 0;
                }
                None => return self.fail_terminal(&op, &handle, state, context).await,
            }
        }
    }

    fn admit(&self, target: &str, state: &mut RunState) -> Result<Lease> {
        let provider = self
            .providers
            .get(target)
            .ok_or_else(|| RecoveryError::UnknownTarget {
                target: target.to_string(),
            })?;
        state.visit(target);

        match self.breakers.get_or_create(target).try_acquire() {
            Ok(permit) => Ok(Lease {
                target: target.to_string(),
                provider,
                permit,
            }),
            Err(rejection) => {
                warn!(
                    backend = target,
                    state = ?rejection.state,
                    retry_in_ms = rejection.retry_in.map(|d| d.as_millis() as u64),
                    "circuit rejected operation, consulting fallback"
                );
                self.reroute(target, ErrorKind::TargetUnavailable, state)
                    .ok_or_else(|| RecoveryError::CircuitOpen {
                        target: target.to_string(),
                    })
            }
        }
    }

    fn reroute(&self, from: &str, kind: ErrorKind, state: &mut RunState) -> Option<Lease> {
        let mut from = from.to_string();
        let mut kind = kind;
        loop {
            let next = self.router.route(&from, kind, &state.tried, &self.breakers)?;
            state.visit(&next);
            match self.providers.get(&next) {
                Some(provider) => match self.breakers.get_or_create(&next).try_acquire() {
                    Ok(permit) => {
                        return Some(Lease {
                            target: next,
                            provider,
                            permit,
                        })
                    }
                    Err(rejection) => {
                        debug!(backend = %next, state = ?rejection.state, "fallback target rejected")
                    }
                },
                None => warn!(backend = %next, "fallback target has no provider"),
            }
            from = next;
            kind = ErrorKind::TargetUnavailable;
        }
    }

    async fn track(&self, state: &mut RunState, context: ErrorContext) {
        let target = context.target.clone();
        let attempt = context.attempt;
        match self.tracker.record(context).await {
            RecordOutcome::Persisted => {}
            outcome => state.degraded.push(Degradation::TrackerWrite {
                target,
                attempt,
                buffered: outcome == RecordOutcome::Buffered,
            }),
        }
    }

    async fn update_metadata(
        &self,
        file_id: &str,
        lifecycle: LifecycleState,
        backend: Option<&str>,
    ) -> Option<Degradation> {
        let update = self.metadata.update_file_state(file_id, lifecycle, backend);
        let failure = match tokio::time::timeout(self.attempt_timeout, update).await {
            Ok(Ok(())) => return None,
            Ok(Err(err)) => err.to_string(),
            Err(_) => FileOpError::timed_out(self.attempt_timeout).to_string(),
        };
        warn!(file_id, state = %lifecycle, reason = %failure, "metadata update failed");
        Some(Degradation::MetadataUpdate {
            state: lifecycle,
            message: failure,
        })
    }

    async fn succeed<T>(
        &self,
        op: &FileOperation,
        handle: &JournalHandle,
        lease: Lease,
        mut state: RunState,
        value: T,
    ) -> Result<RecoveryOutcome<T>> {
        if !self.journal.has_step(handle, &op.completion_step) {
            self.journal.record_step(
                handle,
                StepDescriptor::new(op.completion_step.clone(), lease.target.clone()),
                Box::new(NoCompensation),
            )?;
        }
        self.journal.commit(handle)?;
        lease.permit.success();

        if let Some(degraded) = self
            .update_metadata(
                &op.metadata.file_id,
                LifecycleState::Stored,
                Some(&lease.target),
            )
            .await
        {
            state.degraded.push(degraded);
        }

        info!(
            operation_id = %op.operation_id,
            backend = %lease.target,
            attempts = state.total_attempts,
            rerouted = state.targets_tried.len() > 1,
            "operation succeeded"
        );
        Ok(RecoveryOutcome {
            value,
            target: lease.target,
            attempts: state.total_attempts,
            targets_tried: state.targets_tried,
            delays: state.delays,
            unwound: state.unwound,
            degraded: state.degraded,
        })
    }

    async fn fail_terminal<T>(
        &self,
        op: &FileOperation,
        handle: &JournalHandle,
        mut state: RunState,
        last_error: ErrorContext,
    ) -> Result<RecoveryOutcome<T>> {
        let rollback = self.journal.rollback(handle).await?;
        state.unwound.merge(rollback);
        let rollback = state.unwound;
        // The error carries no degradation list; the metadata hook logs its own failure.
        let _ = self
            .update_metadata(&op.metadata.file_id, LifecycleState::Failed, None)
            .await;

        error!(
            operation_id = %op.operation_id,
            backend = %last_error.target,
            kind = %last_error.kind,
            attempts = state.total_attempts,
            compensated = rollback.compensated.len(),
            compensation_failures = rollback.failed.len(),
            "operation failed terminally"
        );
        Err(RecoveryError::Terminal {
            operation_id: op.operation_id.clone(),
            attempts: state.total_attempts,
            last_error: Box::new(last_error),
            rollback,
            targets_tried: state.targets_tried,
        })
    }

    async fn abort_cancelled<T>(
        &self,
        op: &FileOperation,
        handle: &JournalHandle,
        mut state: RunState,
        reason: CancelReason,
    ) -> Result<RecoveryOutcome<T>> {
        let rollback = self.journal.rollback(handle).await?;
        state.unwound.merge(rollback);
        let _ = self
            .update_metadata(&op.metadata.file_id, LifecycleState::Failed, None)
            .await;
        warn!(
            operation_id = %op.operation_id,
            %reason,
            compensated = state.unwound.compensated.len(),
            "operation cancelled and rolled back"
        );
        Err(RecoveryError::Cancelled {
            operation_id: op.operation_id.clone(),
            reason,
            rollback: state.unwound,
        })
    }
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("providers", &self.providers)
            .field("breakers", &self.breakers.count())
            .field("retry", &self.retry)
            .field("reroute_budget", &self.reroute_budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuitbreaker::CircuitState;
    use crate::memory::{MemoryProvider, ProviderCall};
    use crate::metadata::InMemoryMetadataStore;

    struct Fixture {
        manager: RecoveryManager,
        primary: Arc<MemoryProvider>,
        secondary: Arc<MemoryProvider>,
        metadata: Arc<InMemoryMetadataStore>,
    }

    fn options() -> RecoveryOptions {
        let mut options = RecoveryOptions {
            jitter_fraction: 0.0,
            failure_threshold: 3,
            ..RecoveryOptions::default()
        };
        options.fallback_chains.insert(
            "documents".to_string(),
            vec!["primary".to_string(), "secondary".to_string()],
        );
        options
    }

    fn fixture(options: RecoveryOptions) -> Fixture {
        let primary = Arc::new(MemoryProvider::new("primary"));
        let secondary = Arc::new(MemoryProvider::new("secondary"));
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(primary.clone());
        providers.register(secondary.clone());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let manager = RecoveryManager::builder(providers, metadata.clone())
            .options(options)
            .build()
            .unwrap();
        Fixture {
            manager,
            primary,
            secondary,
            metadata,
        }
    }

    fn op(fx: &Fixture, id: &str) -> FileOperation {
        let meta = FileMetadata::for_content(format!("file-{id}"), b"payload");
        fx.metadata.insert(meta.clone());
        FileOperation::new(id, "primary", meta)
    }

    fn payload() -> Bytes {
        Bytes::from_static(b"payload")
    }

    #[tokio::test]
    async fn test_upload_success_commits_and_stores() {
        let fx = fixture(options());
        let outcome = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap();

        assert_eq!(outcome.target, "primary");
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.rerouted());
        assert!(fx.primary.contains(&outcome.value));
        assert_eq!(
            fx.manager.journal().status("op-1"),
            Some(OperationStatus::Committed)
        );
        let meta = fx.metadata.get("file-op-1").unwrap();
        assert_eq!(meta.state, LifecycleState::Stored);
        assert_eq!(meta.backend_id.as_deref(), Some("primary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_with_exact_delays() {
        let fx = fixture(options());
        fx.primary
            .fail_times(ProviderCall::Upload, 2, FileOpError::transient("blip"));

        let start = tokio::time::Instant::now();
        let outcome = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(fx.manager.tracker().stats().recorded, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_rolls_back_without_retry() {
        let fx = fixture(options());
        fx.primary
            .fail_next(ProviderCall::Upload, FileOpError::permanent("bad token"));

        let err = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap_err();
        match &err {
            RecoveryError::Terminal {
                attempts,
                last_error,
                targets_tried,
                ..
            } => {
                assert_eq!(*attempts, 1);
                assert_eq!(last_error.kind, ErrorKind::Permanent);
                assert_eq!(targets_tried, &vec!["primary".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.secondary.total_calls(), 0);
        assert_eq!(fx.manager.breakers().get_or_create("primary").failure_count(), 0);
        assert_eq!(fx.metadata.state_of("file-op-1"), Some(LifecycleState::Failed));
        assert_eq!(
            fx.manager.journal().status("op-1"),
            Some(OperationStatus::RolledBack)
        );
    }

    #[tokio::test]
    async fn test_unavailable_reroutes_to_secondary() {
        let fx = fixture(options());
        fx.primary
            .fail_always(ProviderCall::Upload, FileOpError::unavailable("region down"));

        let outcome = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap();
        assert_eq!(outcome.target, "secondary");
        assert!(outcome.rerouted());
        assert_eq!(outcome.targets_tried, vec!["primary", "secondary"]);
        assert_eq!(fx.primary.calls(ProviderCall::Upload), 1);
        assert!(fx.secondary.contains(&outcome.value));
        assert_eq!(
            fx.manager.breakers().get_or_create("primary").state(),
            CircuitState::Open
        );
        assert_eq!(
            fx.metadata.get("file-op-1").unwrap().backend_id.as_deref(),
            Some("secondary")
        );
    }

    #[tokio::test]
    async fn test_open_circuit_without_fallback_fails_fast() {
        let mut options = options();
        options.fallback_chains.clear();
        let fx = fixture(options);
        fx.manager.breakers().get_or_create("primary").trip();

        let err = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::CircuitOpen { ref target } if target == "primary"));
        assert_eq!(fx.primary.total_calls(), 0);
        assert_eq!(fx.manager.journal().status("op-1"), None);
        assert_eq!(fx.metadata.state_of("file-op-1"), Some(LifecycleState::Pending));
    }

    #[tokio::test]
    async fn test_open_circuit_routes_before_journal() {
        let fx = fixture(options());
        fx.manager.breakers().get_or_create("primary").trip();
        let outcome = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap();
        assert_eq!(outcome.target, "secondary");
        assert_eq!(fx.primary.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let fx = fixture(options());
        let meta = FileMetadata::for_content("f", b"x");
        let err = fx
            .manager
            .upload(FileOperation::new("op-1", "nowhere", meta), payload())
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::UnknownTarget { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_operation_id_rejected() {
        let fx = fixture(options());
        fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap();
        let err = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Journal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let options = RecoveryOptions {
            attempt_timeout_ms: 50,
            max_attempts: 2,
            ..options()
        };
        let fx = fixture(options);
        fx.primary.set_latency(Some(Duration::from_secs(5)));

        let err = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Transient));
        assert_eq!(fx.primary.calls(ProviderCall::Upload), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_rolls_back() {
        let fx = Arc::new(fixture(RecoveryOptions {
            base_delay_ms: 1_000,
            ..options()
        }));
        fx.primary
            .fail_always(ProviderCall::CompleteSession, FileOpError::transient("flaky"));

        let (token, handle) = new_cancel_pair();
        let operation = op(&fx, "op-1").with_cancel(token);
        let runner = Arc::clone(&fx);
        let task = tokio::spawn(async move {
            runner
                .manager
                .execute(operation, |ctx| async move {
                    if !ctx.has_step("open-session") {
                        let session = ctx.provider.open_upload_session(&ctx.metadata).await?;
                        ctx.record_step(
                            ctx.step("open-session"),
                            crate::provider::abort_compensation(
                                Arc::clone(&ctx.provider),
                                session.clone(),
                            ),
                        )?;
                        return ctx
                            .provider
                            .complete_upload_session(&session)
                            .await
                            .map(|_| ());
                    }
                    Err(FileOpError::transient("still flaky"))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.cancel(CancelReason::UserRequested);
        let err = task.await.unwrap().unwrap_err();
        match err {
            RecoveryError::Cancelled {
                reason, rollback, ..
            } => {
                assert_eq!(reason, CancelReason::UserRequested);
                assert_eq!(rollback.compensated, vec!["open-session"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.primary.open_sessions(), 0);
        assert_eq!(fx.metadata.state_of("file-op-1"), Some(LifecycleState::Failed));
    }

    #[tokio::test]
    async fn test_cancel_by_operation_id() {
        let fx = Arc::new(fixture(options()));
        fx.primary.set_latency(Some(Duration::from_secs(3600)));
        let operation = op(&fx, "op-1");
        let runner = Arc::clone(&fx);
        let task =
            tokio::spawn(async move { runner.manager.upload(operation, payload()).await });

        while !fx.manager.cancel("op-1", CancelReason::Shutdown) {
            tokio::task::yield_now().await;
        }
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::Cancelled {
                reason: CancelReason::Shutdown,
                ..
            }
        ));
    }

    #[test]
    fn test_upload_future_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let fx = fixture(options());
        assert_send(fx.manager.upload(op(&fx, "op-1"), payload()));
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_keeps_original_cancellable() {
        let fx = Arc::new(fixture(options()));
        fx.primary.set_latency(Some(Duration::from_secs(3600)));
        let operation = op(&fx, "op-1");
        let runner = Arc::clone(&fx);
        let task =
            tokio::spawn(async move { runner.manager.upload(operation, payload()).await });
        while fx.primary.calls(ProviderCall::Upload) == 0 {
            tokio::task::yield_now().await;
        }

        let err = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::Journal(JournalError::DuplicateOperation { .. })
        ));
        assert_eq!(fx.primary.calls(ProviderCall::Upload), 1);

        assert!(fx.manager.cancel("op-1", CancelReason::UserRequested));
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RecoveryError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_rolls_back_in_background() {
        let fx = fixture(options());
        let undone = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&undone);

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            fx.manager.execute(op(&fx, "op-1"), move |ctx| {
                let log = Arc::clone(&log);
                async move {
                    ctx.record_step(
                        ctx.step("create-draft"),
                        crate::journal::compensation_fn(move || {
                            let log = Arc::clone(&log);
                            async move {
                                log.lock().push("create-draft");
                                Ok(())
                            }
                        }),
                    )?;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, FileOpError>(())
                }
            }),
        )
        .await;
        assert!(abandoned.is_err());

        // Let the background rollback run.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*undone.lock(), vec!["create-draft"]);
        assert_eq!(
            fx.manager.journal().status("op-1"),
            Some(OperationStatus::RolledBack)
        );
        assert_eq!(fx.manager.journal().pending_count(), 0);
        assert_eq!(fx.metadata.state_of("file-op-1"), Some(LifecycleState::Failed));
        assert!(!fx.manager.cancel("op-1", CancelReason::UserRequested));
    }

    #[tokio::test]
    async fn test_shared_budget_limits_reroute() {
        let options = RecoveryOptions {
            reroute_budget: RerouteBudget::Shared,
            max_attempts: 1,
            ..options()
        };
        let fx = fixture(options);
        fx.primary
            .fail_always(ProviderCall::Upload, FileOpError::unavailable("down"));
        let err = fx.manager.upload(op(&fx, "op-1"), payload()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Terminal { .. }));
        assert_eq!(fx.secondary.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_metadata_failure_is_reported_as_degraded() {
        let fx = fixture(options());
        // Not inserted into the metadata store.
        let meta = FileMetadata::for_content("untracked", b"x");
        let outcome = fx
            .manager
            .upload(FileOperation::new("op-1", "primary", meta), payload())
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert!(matches!(
            outcome.degraded[0],
            Degradation::MetadataUpdate {
                state: LifecycleState::Stored,
                ..
            }
        ));
    }

    #[test]
    fn test_builder_rejects_invalid_options() {
        let providers = Arc::new(ProviderRegistry::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let result = RecoveryManager::builder(providers, metadata)
            .options(RecoveryOptions {
                max_attempts: 0,
                ..RecoveryOptions::default()
            })
            .build();
        assert!(result.is_err());
    }
}
