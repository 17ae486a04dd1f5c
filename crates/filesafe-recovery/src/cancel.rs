//! Cooperative cancellation for in-flight file operations.
//!
//! A [`CancelHandle`] triggers cancellation; any number of [`CancelToken`]
//! clones observe it, either by polling [`CancelToken::is_cancelled`] or by
//! awaiting [`CancelToken::cancelled`] inside a `select!`. The recovery
//! manager races every provider call and every retry sleep against the token,
//! so cancellation is seen at each suspension point.

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller asked for it.
    #[default]
    UserRequested,
    /// An overall deadline expired.
    DeadlineExceeded,
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "user requested"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Error returned when an operation is cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled: {0}")]
pub struct CancelledError(pub CancelReason);

struct CancelState {
    tx: watch::Sender<Option<CancelReason>>,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn new(initial: Option<CancelReason>) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initial);
        Arc::new(Self {
            tx,
            children: Mutex::new(Vec::new()),
        })
    }

    fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    fn cancel(&self, reason: CancelReason) {
        let first = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }
        let children: Vec<Arc<CancelState>> = {
            let mut children = self.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.cancel(reason);
        }
    }
}

/// Observes cancellation. Cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            state: CancelState::new(None),
        }
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.reason().is_some()
    }

    /// The reason, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.state.reason()
    }

    /// Returns `Err` if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        match self.reason() {
            Some(reason) => Err(CancelledError(reason)),
            None => Ok(()),
        }
    }

    /// Completes once the token is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.state.tx.subscribe();
        // Copy the reason out so no watch guard is held across an await.
        let reason = rx
            .wait_for(Option::is_some)
            .await
            .map(|reason| (*reason).unwrap_or_default());
        match reason {
            Ok(reason) => reason,
            // The sender lives as long as this token, so this never happens.
            Err(_) => std::future::pending().await,
        }
    }

    /// Creates a child pair. Cancelling this token cancels the child; the
    /// child can also be cancelled on its own without affecting this token.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let state = CancelState::new(self.reason());
        self.state.children.lock().push(Arc::downgrade(&state));
        (
            CancelToken {
                state: Arc::clone(&state),
            },
            CancelHandle { state },
        )
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancels with `reason`. Only the first reason sticks.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.reason().is_some()
    }

    /// A new token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Arc::clone(&self.state),
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("reason", &self.state.reason())
            .finish()
    }
}

/// Creates a token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = CancelState::new(None);
    (
        CancelToken {
            state: Arc::clone(&state),
        },
        CancelHandle { state },
    )
}

/// Cancellation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelStats {
    /// Operations registered.
    pub registered: u64,
    /// Operations cancelled through the registry.
    pub cancelled: u64,
    /// Operations that completed and were removed.
    pub completed: u64,
    /// Operations currently registered.
    pub active: usize,
}

/// Cancel handles of in-flight operations, keyed by operation id.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    handles: DashMap<String, CancelHandle>,
    stats: Mutex<CancelStats>,
}

impl CancelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operation. The returned token is a child of `parent`.
    ///
    /// Returns `None`, leaving the registry untouched, if `operation_id` is
    /// already in flight.
    pub fn register(&self, operation_id: &str, parent: &CancelToken) -> Option<CancelToken> {
        match self.handles.entry(operation_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (token, handle) = parent.child();
                slot.insert(handle);
                self.stats.lock().registered += 1;
                Some(token)
            }
        }
    }

    /// Cancels one operation. Returns false if it is not registered.
    pub fn cancel(&self, operation_id: &str, reason: CancelReason) -> bool {
        let Some(handle) = self.handles.get(operation_id).map(|h| h.value().clone()) else {
            return false;
        };
        handle.cancel(reason);
        self.stats.lock().cancelled += 1;
        debug!(operation_id, %reason, "operation cancelled");
        true
    }

    /// Cancels every registered operation.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let handles: Vec<CancelHandle> = self.handles.iter().map(|h| h.value().clone()).collect();
        for handle in &handles {
            handle.cancel(reason);
        }
        self.stats.lock().cancelled += handles.len() as u64;
        handles.len()
    }

    /// Removes a finished operation.
    pub fn complete(&self, operation_id: &str) {
        if self.handles.remove(operation_id).is_some() {
            self.stats.lock().completed += 1;
        }
    }

    /// Whether an operation is registered.
    pub fn is_registered(&self, operation_id: &str) -> bool {
        self.handles.contains_key(operation_id)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CancelStats {
        CancelStats {
            active: self.handles.len(),
            ..self.stats.lock().clone()
        }
    }
}
