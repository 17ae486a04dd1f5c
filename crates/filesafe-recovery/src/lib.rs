#![warn(missing_docs)]

//! filesafe recovery subsystem: retry, circuit breaking, rollback journal and
//! fallback routing for file operations against remote storage providers.
//!
//! A [`RecoveryManager`] wraps every provider operation. Transient failures are
//! retried with exponential backoff, a per-target [`CircuitBreaker`] stops
//! calls to unhealthy targets, the [`OperationLog`] compensates completed
//! steps when an operation cannot finish, and the [`FallbackRouter`] moves
//! work to the next target in a storage class chain.

pub mod cancel;
pub mod circuitbreaker;
pub mod cli;
pub mod config;
pub mod error;
pub mod fallback;
pub mod journal;
pub mod local;
pub mod manager;
pub mod memory;
pub mod metadata;
pub mod provider;
pub mod retry;
pub mod telemetry;
pub mod tracker;
pub mod transfer;

pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelRegistry, CancelToken};
pub use circuitbreaker::{
    BreakerConfig, BreakerPermit, BreakerRegistry, BreakerRejection, BreakerSnapshot,
    CircuitBreaker, CircuitState,
};
pub use config::{RecoveryOptions, RerouteBudget};
pub use error::{ConfigError, ErrorKind, FileOpError, JournalError, RecoveryError, Result};
pub use fallback::{FallbackRouter, RerouteEvent};
pub use journal::{
    compensation_fn, CompensatingAction, CompensationResolver, JournalConfig, JournalHandle,
    JournalSnapshot, NoCompensation, OperationLog, OperationStatus, RestoreReport, RollbackResult,
    StepDescriptor,
};
pub use local::LocalDiskProvider;
pub use manager::{
    AttemptContext, Degradation, FileOperation, RecoveryManager, RecoveryManagerBuilder,
    RecoveryOutcome,
};
pub use memory::{MemoryProvider, ProviderCall};
pub use metadata::{ContentHash, FileMetadata, InMemoryMetadataStore, LifecycleState, MetadataStore};
pub use provider::{FileProvider, ProviderRegistry, UploadSession};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use telemetry::{init_tracing, LogFormat};
pub use tracker::{
    ErrorContext, ErrorFilter, ErrorSink, ErrorTracker, InMemoryErrorSink, RecordOutcome,
    TrackerConfig, TrackerStats,
};
pub use transfer::{upload_chunked, DEFAULT_CHUNK_SIZE};
