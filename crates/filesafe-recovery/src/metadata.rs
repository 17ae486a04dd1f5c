//! Tracked-file descriptors and the caller's persistence hook.
//!
//! The recovery subsystem never owns file metadata. It only writes the
//! lifecycle state and backend id through [`MetadataStore`] as a side effect
//! of a successful or terminally failed operation.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FileOpError;

/// Lifecycle of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Known but not yet transferred.
    #[default]
    Pending,
    /// A transfer is in flight.
    Uploading,
    /// Stored on a backend.
    Stored,
    /// The last operation failed terminally.
    Failed,
    /// Removed from its backend.
    Deleted,
}

impl LifecycleState {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Uploading => "uploading",
            LifecycleState::Stored => "stored",
            LifecycleState::Failed => "failed",
            LifecycleState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// BLAKE3 digest of a file's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hashes `data`.
    pub fn of(data: &[u8]) -> Self {
        ContentHash(*blake3::hash(data).as_bytes())
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Descriptor of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Logical id assigned by the caller.
    pub file_id: String,
    /// Id assigned by the provider once an upload completes.
    pub provider_file_id: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Content digest.
    pub content_hash: ContentHash,
    /// Backend currently holding the file, if any.
    pub backend_id: Option<String>,
    /// Lifecycle state.
    pub state: LifecycleState,
}

impl FileMetadata {
    /// Describes a pending file with the given contents.
    pub fn for_content(file_id: impl Into<String>, data: &[u8]) -> Self {
        Self {
            file_id: file_id.into(),
            provider_file_id: None,
            size: data.len() as u64,
            content_hash: ContentHash::of(data),
            backend_id: None,
            state: LifecycleState::Pending,
        }
    }
}

/// Caller-supplied persistence hook for file metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Records a lifecycle transition and the backend that holds the file.
    async fn update_file_state(
        &self,
        file_id: &str,
        state: LifecycleState,
        backend_id: Option<&str>,
    ) -> Result<(), FileOpError>;

    /// Loads a file's metadata.
    async fn load_file_metadata(&self, file_id: &str) -> Result<FileMetadata, FileOpError>;
}

/// [`MetadataStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    files: RwLock<HashMap<String, FileMetadata>>,
}

impl InMemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file.
    pub fn insert(&self, metadata: FileMetadata) {
        self.files.write().insert(metadata.file_id.clone(), metadata);
    }

    /// Returns a copy of a file's metadata.
    pub fn get(&self, file_id: &str) -> Option<FileMetadata> {
        self.files.read().get(file_id).cloned()
    }

    /// Current state of a file.
    pub fn state_of(&self, file_id: &str) -> Option<LifecycleState> {
        self.files.read().get(file_id).map(|m| m.state)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn update_file_state(
        &self,
        file_id: &str,
        state: LifecycleState,
        backend_id: Option<&str>,
    ) -> Result<(), FileOpError> {
        let mut files = self.files.write();
        let entry = files
            .get_mut(file_id)
            .ok_or_else(|| FileOpError::permanent(format!("unknown file {file_id}")))?;
        entry.state = state;
        if let Some(backend) = backend_id {
            entry.backend_id = Some(backend.to_string());
        }
        debug!(file_id, %state, backend = backend_id.unwrap_or("-"), "file state updated");
        Ok(())
    }

    async fn load_file_metadata(&self, file_id: &str) -> Result<FileMetadata, FileOpError> {
        self.get(file_id)
            .ok_or_else(|| FileOpError::permanent(format!("unknown file {file_id}")))
    }
}
