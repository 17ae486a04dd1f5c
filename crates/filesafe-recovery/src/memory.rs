//! In-memory provider with scripted fault injection.
//!
//! Used by tests and demos to drive the recovery paths: each call type has a
//! queue of one-shot failures and an optional sticky failure that simulates an
//! outage, plus optional per-call latency for deadline tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::FileOpError;
use crate::metadata::FileMetadata;
use crate::provider::{ChunkAck, FileProvider, UploadSession};

/// The provider calls that can be scripted and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderCall {
    /// [`FileProvider::upload`].
    Upload,
    /// [`FileProvider::open_upload_session`].
    OpenSession,
    /// [`FileProvider::upload_chunk`].
    UploadChunk,
    /// [`FileProvider::complete_upload_session`].
    CompleteSession,
    /// [`FileProvider::abort_upload_session`].
    AbortSession,
    /// [`FileProvider::download`].
    Download,
    /// [`FileProvider::delete`].
    Delete,
}

#[derive(Debug, Default)]
struct Faults {
    queued: HashMap<ProviderCall, VecDeque<FileOpError>>,
    sticky: HashMap<ProviderCall, FileOpError>,
    latency: Option<Duration>,
}

/// Counters for a [`MemoryProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProviderStats {
    /// Files currently stored.
    pub stored: usize,
    /// Sessions currently open.
    pub open_sessions: usize,
    /// Calls made per call type, including failed ones.
    pub calls: BTreeMap<ProviderCall, u64>,
    /// Calls that returned an injected failure.
    pub injected_failures: u64,
}

/// Provider that keeps files in memory.
#[derive(Debug)]
pub struct MemoryProvider {
    name: String,
    files: Mutex<HashMap<String, Bytes>>,
    sessions: Mutex<HashMap<String, BTreeMap<u32, Bytes>>>,
    faults: Mutex<Faults>,
    calls: Mutex<BTreeMap<ProviderCall, u64>>,
    injected: AtomicU64,
    next_id: AtomicU64,
}

impl MemoryProvider {
    /// Creates an empty provider serving `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(BTreeMap::new()),
            injected: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Makes the next `call` fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, call: ProviderCall, error: FileOpError) {
        self.faults
            .lock()
            .queued
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Makes the next `times` calls of `call` fail with `error`.
    pub fn fail_times(&self, call: ProviderCall, times: usize, error: FileOpError) {
        for _ in 0..times {
            self.fail_next(call, error.clone());
        }
    }

    /// Makes every `call` fail with `error` until [`MemoryProvider::heal`].
    pub fn fail_always(&self, call: ProviderCall, error: FileOpError) {
        self.faults.lock().sticky.insert(call, error);
    }

    /// Removes every scripted failure and latency.
    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Calls made of one type.
    pub fn calls(&self, call: ProviderCall) -> u64 {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    /// Calls made of every type.
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Whether a file with this id is stored.
    pub fn contains(&self, provider_file_id: &str) -> bool {
        self.files.lock().contains_key(provider_file_id)
    }

    /// Number of stored files.
    pub fn stored_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Number of open upload sessions.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryProviderStats {
        MemoryProviderStats {
            stored: self.stored_count(),
            open_sessions: self.open_sessions(),
            calls: self.calls.lock().clone(),
            injected_failures: self.injected.load(Ordering::Relaxed),
        }
    }

    async fn enter(&self, call: ProviderCall) -> Result<(), FileOpError> {
        *self.calls.lock().entry(call).or_insert(0) += 1;
        let (latency, fault) = {
            let mut faults = self.faults.lock();
            let fault = match faults.queued.get_mut(&call).and_then(VecDeque::pop_front) {
                Some(err) => Some(err),
                None => faults.sticky.get(&call).cloned(),
            };
            (faults.latency, fault)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(err) => {
                self.injected.fetch_add(1, Ordering::Relaxed);
                trace!(backend = %self.name, ?call, kind = %err.kind, "injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{prefix}-{n}", self.name)
    }
}

#[async_trait]
impl FileProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, data: Bytes, _metadata: &FileMetadata) -> Result<String, FileOpError> {
        self.enter(ProviderCall::Upload).await?;
        let id = self.next_id("file");
        self.files.lock().insert(id.clone(), data);
        Ok(id)
    }

    async fn open_upload_session(
        &self,
        metadata: &FileMetadata,
    ) -> Result<UploadSession, FileOpError> {
        self.enter(ProviderCall::OpenSession).await?;
        let session_id = self.next_id("session");
        self.sessions
            .lock()
            .insert(session_id.clone(), BTreeMap::new());
        Ok(UploadSession {
            session_id,
            target: self.name.clone(),
            file_id: metadata.file_id.clone(),
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkAck, FileOpError> {
        self.enter(ProviderCall::UploadChunk).await?;
        let received = data.len() as u64;
        let mut sessions = self.sessions.lock();
        let chunks = sessions.get_mut(&session.session_id).ok_or_else(|| {
            FileOpError::permanent(format!("unknown session {}", session.session_id))
        })?;
        chunks.insert(chunk_index, data);
        Ok(ChunkAck {
            session_id: session.session_id.clone(),
            chunk_index,
            received,
        })
    }

    async fn complete_upload_session(
        &self,
        session: &UploadSession,
    ) -> Result<String, FileOpError> {
        self.enter(ProviderCall::CompleteSession).await?;
        let chunks = self
            .sessions
            .lock()
            .remove(&session.session_id)
            .ok_or_else(|| {
                FileOpError::permanent(format!("unknown session {}", session.session_id))
            })?;
        let mut assembled = BytesMut::new();
        for chunk in chunks.values() {
            assembled.extend_from_slice(chunk);
        }
        let id = self.next_id("file");
        self.files.lock().insert(id.clone(), assembled.freeze());
        Ok(id)
    }

    async fn abort_upload_session(&self, session: &UploadSession) -> Result<(), FileOpError> {
        self.enter(ProviderCall::AbortSession).await?;
        self.sessions.lock().remove(&session.session_id);
        Ok(())
    }

    async fn download(&self, provider_file_id: &str) -> Result<Bytes, FileOpError> {
        self.enter(ProviderCall::Download).await?;
        self.files
            .lock()
            .get(provider_file_id)
            .cloned()
            .ok_or_else(|| FileOpError::permanent(format!("file {provider_file_id} not found")))
    }

    async fn delete(&self, provider_file_id: &str) -> Result<(), FileOpError> {
        self.enter(ProviderCall::Delete).await?;
        // Deleting a missing file succeeds so compensations stay idempotent.
        self.files.lock().remove(provider_file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn meta() -> FileMetadata {
        FileMetadata::for_content("f1", b"hello world")
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let p = MemoryProvider::new("primary");
        let id = p.upload(Bytes::from_static(b"hello"), &meta()).await.unwrap();
        assert!(id.starts_with("primary-file-"));
        assert_eq!(p.download(&id).await.unwrap(), Bytes::from_static(b"hello"));
        p.delete(&id).await.unwrap();
        assert!(!p.contains(&id));
        assert_eq!(p.download(&id).await.unwrap_err().kind, ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_chunked_session_assembles_in_order() {
        let p = MemoryProvider::new("primary");
        let session = p.open_upload_session(&meta()).await.unwrap();
        p.upload_chunk(&session, 1, Bytes::from_static(b" world"))
            .await
            .unwrap();
        let ack = p
            .upload_chunk(&session, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(ack.received, 5);
        let id = p.complete_upload_session(&session).await.unwrap();
        assert_eq!(p.download(&id).await.unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(p.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_queued_faults_consumed_in_order() {
        let p = MemoryProvider::new("primary");
        p.fail_next(ProviderCall::Upload, FileOpError::transient("blip"));
        p.fail_next(ProviderCall::Upload, FileOpError::rate_limited("slow", None));

        let data = Bytes::from_static(b"x");
        assert_eq!(
            p.upload(data.clone(), &meta()).await.unwrap_err().kind,
            ErrorKind::Transient
        );
        assert_eq!(
            p.upload(data.clone(), &meta()).await.unwrap_err().kind,
            ErrorKind::RateLimited
        );
        assert!(p.upload(data, &meta()).await.is_ok());
        assert_eq!(p.calls(ProviderCall::Upload), 3);
        assert_eq!(p.stats().injected_failures, 2);
    }

    #[tokio::test]
    async fn test_sticky_fault_until_healed() {
        let p = MemoryProvider::new("primary");
        p.fail_always(ProviderCall::Download, FileOpError::unavailable("down"));
        assert!(p.download("x").await.is_err());
        assert!(p.download("x").await.is_err());
        p.heal();
        assert_eq!(p.download("x").await.unwrap_err().kind, ErrorKind::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency() {
        let p = MemoryProvider::new("primary");
        p.set_latency(Some(Duration::from_millis(250)));
        let start = tokio::time::Instant::now();
        p.delete("missing").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
