//! The capability every storage or content provider implements.
//!
//! The recovery manager only ever sees `Arc<dyn FileProvider>`, looked up by
//! target name in a [`ProviderRegistry`]. Implementations must classify their
//! failures into a [`FileOpError`] at the source; raw transport errors never
//! cross this boundary.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FileOpError;
use crate::journal::{compensation_fn, CompensatingAction, CompensationResolver, StepDescriptor};
use crate::metadata::FileMetadata;

/// Prefix of [`StepDescriptor::detail`] for steps that opened an upload session.
pub const SESSION_DETAIL_PREFIX: &str = "session:";

/// An open chunked-upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Provider-assigned session id.
    pub session_id: String,
    /// Target the session lives on.
    pub target: String,
    /// Logical file being uploaded.
    pub file_id: String,
}

/// Acknowledgement of one uploaded chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// Session the chunk belongs to.
    pub session_id: String,
    /// Index of the acknowledged chunk.
    pub chunk_index: u32,
    /// Bytes received by the provider for this chunk.
    pub received: u64,
}

/// Generic provider capability.
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Target name this provider serves.
    fn name(&self) -> &str;

    /// Uploads a whole file, returning the provider-assigned id.
    async fn upload(&self, data: Bytes, metadata: &FileMetadata) -> Result<String, FileOpError>;

    /// Starts a chunked upload.
    async fn open_upload_session(&self, metadata: &FileMetadata)
        -> Result<UploadSession, FileOpError>;

    /// Uploads one chunk. Re-sending an index replaces it.
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkAck, FileOpError>;

    /// Assembles the chunks in index order, returning the provider-assigned id.
    async fn complete_upload_session(&self, session: &UploadSession)
        -> Result<String, FileOpError>;

    /// Discards a session and its chunks.
    async fn abort_upload_session(&self, session: &UploadSession) -> Result<(), FileOpError>;

    /// Downloads a file.
    async fn download(&self, provider_file_id: &str) -> Result<Bytes, FileOpError>;

    /// Deletes a file.
    async fn delete(&self, provider_file_id: &str) -> Result<(), FileOpError>;
}

/// Compensation that deletes `provider_file_id` from `provider`.
pub fn delete_compensation(
    provider: Arc<dyn FileProvider>,
    provider_file_id: String,
) -> Box<dyn CompensatingAction> {
    compensation_fn(move || {
        let provider = Arc::clone(&provider);
        let id = provider_file_id.clone();
        async move { provider.delete(&id).await }
    })
}

/// Compensation that aborts `session` on `provider`.
pub fn abort_compensation(
    provider: Arc<dyn FileProvider>,
    session: UploadSession,
) -> Box<dyn CompensatingAction> {
    compensation_fn(move || {
        let provider = Arc::clone(&provider);
        let session = session.clone();
        async move { provider.abort_upload_session(&session).await }
    })
}

/// Target name to provider mapping.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn FileProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own name.
    pub fn register(&self, provider: Arc<dyn FileProvider>) {
        let name = provider.name().to_string();
        debug!(backend = %name, "provider registered");
        self.providers.insert(name, provider);
    }

    /// Registers `provider` under `target`.
    pub fn register_as(&self, target: &str, provider: Arc<dyn FileProvider>) {
        self.providers.insert(target.to_string(), provider);
    }

    /// The provider for `target`.
    pub fn get(&self, target: &str) -> Option<Arc<dyn FileProvider>> {
        self.providers.get(target).map(|p| Arc::clone(p.value()))
    }

    /// Whether `target` has a provider.
    pub fn contains(&self, target: &str) -> bool {
        self.providers.contains_key(target)
    }

    /// Registered target names, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("targets", &self.targets())
            .finish()
    }
}

/// Rebinds restored journal steps to provider calls: session steps abort the
/// session, steps that produced a provider file delete it.
impl CompensationResolver for ProviderRegistry {
    fn resolve(
        &self,
        operation_id: &str,
        step: &StepDescriptor,
    ) -> Option<Box<dyn CompensatingAction>> {
        let provider = self.get(&step.target)?;
        if let Some(session_id) = step
            .detail
            .as_deref()
            .and_then(|d| d.strip_prefix(SESSION_DETAIL_PREFIX))
        {
            let session = UploadSession {
                session_id: session_id.to_string(),
                target: step.target.clone(),
                file_id: operation_id.to_string(),
            };
            return Some(abort_compensation(provider, session));
        }
        let id = step.provider_file_id.clone()?;
        Some(delete_compensation(provider, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MemoryProvider::new("primary")));
        registry.register_as("cache", Arc::new(MemoryProvider::new("local")));

        assert!(registry.contains("primary"));
        assert_eq!(registry.get("cache").unwrap().name(), "local");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.targets(), vec!["cache", "primary"]);
    }

    #[tokio::test]
    async fn test_resolver_deletes_uploaded_file() {
        let provider = Arc::new(MemoryProvider::new("primary"));
        let registry = ProviderRegistry::new();
        registry.register(provider.clone());

        let meta = FileMetadata::for_content("f1", b"data");
        let id = provider.upload(Bytes::from_static(b"data"), &meta).await.unwrap();
        assert!(provider.contains(&id));

        let step = StepDescriptor::new("upload", "primary").with_provider_file_id(id.clone());
        let action = registry.resolve("op-1", &step).unwrap();
        action.compensate().await.unwrap();
        assert!(!provider.contains(&id));
    }

    #[tokio::test]
    async fn test_resolver_aborts_session() {
        let provider = Arc::new(MemoryProvider::new("primary"));
        let registry = ProviderRegistry::new();
        registry.register(provider.clone());

        let meta = FileMetadata::for_content("f1", b"data");
        let session = provider.open_upload_session(&meta).await.unwrap();
        assert_eq!(provider.open_sessions(), 1);

        let step = StepDescriptor::new("open-session", "primary")
            .with_detail(format!("{SESSION_DETAIL_PREFIX}{}", session.session_id));
        registry
            .resolve("op-1", &step)
            .unwrap()
            .compensate()
            .await
            .unwrap();
        assert_eq!(provider.open_sessions(), 0);
    }

    #[test]
    fn test_resolver_unknown_target_or_plain_step() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MemoryProvider::new("primary")));
        assert!(registry
            .resolve("op", &StepDescriptor::new("x", "gone").with_provider_file_id("1"))
            .is_none());
        assert!(registry
            .resolve("op", &StepDescriptor::new("create-draft", "primary"))
            .is_none());
    }
}
