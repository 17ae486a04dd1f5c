//! Local-disk provider, used as the last tier of a fallback chain.
//!
//! Every upload is stored as its own object under `<root>/objects/`, named
//! `<blake3 hex>-<uuid>`. The digest lets downloads verify contents; the uuid
//! keeps two uploads of identical bytes apart, so deleting one never removes
//! the other. Upload sessions keep one file per chunk under
//! `<root>/sessions/<session_id>/`. Writes go to a temporary file first and are
//! renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::FileOpError;
use crate::metadata::{ContentHash, FileMetadata};
use crate::provider::{ChunkAck, FileProvider, UploadSession};

const OBJECTS_DIR: &str = "objects";
const SESSIONS_DIR: &str = "sessions";
const CHUNK_SUFFIX: &str = ".chunk";

/// Provider backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalDiskProvider {
    name: String,
    root: PathBuf,
}

impl LocalDiskProvider {
    /// Creates a provider rooted at `root`, creating its directories.
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, FileOpError> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR)).await?;
        fs::create_dir_all(root.join(SESSIONS_DIR)).await?;
        let name = name.into();
        debug!(backend = %name, root = %root.display(), "local disk provider opened");
        Ok(Self { name, root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &str) -> Result<PathBuf, FileOpError> {
        parse_object_id(id)?;
        Ok(self.root.join(OBJECTS_DIR).join(id))
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, FileOpError> {
        if Uuid::parse_str(session_id).is_err() {
            return Err(FileOpError::permanent(format!(
                "invalid session id '{session_id}'"
            )));
        }
        Ok(self.root.join(SESSIONS_DIR).join(session_id))
    }

    async fn store_object(&self, data: &[u8]) -> Result<String, FileOpError> {
        let id = format!("{}-{}", ContentHash::of(data).to_hex(), Uuid::new_v4().simple());
        let path = self.object_path(&id)?;
        write_atomic(&path, data).await?;
        Ok(id)
    }
}

/// Splits an object id into its digest and uniquifier, rejecting anything
/// that could escape the objects directory.
fn parse_object_id(id: &str) -> Result<(&str, &str), FileOpError> {
    let is_hex = |part: &str, len: usize| {
        part.len() == len && part.bytes().all(|b| b.is_ascii_hexdigit())
    };
    match id.split_once('-') {
        Some((digest, unique)) if is_hex(digest, 64) && is_hex(unique, 32) => Ok((digest, unique)),
        _ => Err(FileOpError::permanent(format!("invalid object id '{id}'"))),
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), FileOpError> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    fs::write(&tmp, data).await?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

fn remove_if_exists(result: std::io::Result<()>) -> Result<(), FileOpError> {
    match result {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl FileProvider for LocalDiskProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, data: Bytes, _metadata: &FileMetadata) -> Result<String, FileOpError> {
        self.store_object(&data).await
    }

    async fn open_upload_session(
        &self,
        metadata: &FileMetadata,
    ) -> Result<UploadSession, FileOpError> {
        let session_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.session_dir(&session_id)?).await?;
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
        let dir = self.session_dir(&session.session_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(FileOpError::permanent(format!(
                "unknown session {}",
                session.session_id
            )));
        }
        let path = dir.join(format!("{chunk_index:08}{CHUNK_SUFFIX}"));
        write_atomic(&path, &data).await?;
        Ok(ChunkAck {
            session_id: session.session_id.clone(),
            chunk_index,
            received: data.len() as u64,
        })
    }

    async fn complete_upload_session(
        &self,
        session: &UploadSession,
    ) -> Result<String, FileOpError> {
        let dir = self.session_dir(&session.session_id)?;
        let mut chunks = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let index = name
                .to_str()
                .and_then(|n| n.strip_suffix(CHUNK_SUFFIX))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(index) = index {
                chunks.push((index, entry.path()));
            }
        }
        chunks.sort_by_key(|(index, _)| *index);

        let mut assembled = BytesMut::new();
        for (_, path) in &chunks {
            assembled.extend_from_slice(&fs::read(path).await?);
        }
        let id = self.store_object(&assembled).await?;
        fs::remove_dir_all(&dir).await?;
        debug!(backend = %self.name, session = %session.session_id, chunks = chunks.len(), "session completed");
        Ok(id)
    }

    async fn abort_upload_session(&self, session: &UploadSession) -> Result<(), FileOpError> {
        let dir = self.session_dir(&session.session_id)?;
        remove_if_exists(fs::remove_dir_all(&dir).await)
    }

    async fn download(&self, provider_file_id: &str) -> Result<Bytes, FileOpError> {
        let (digest, _) = parse_object_id(provider_file_id)?;
        let data = fs::read(self.object_path(provider_file_id)?).await?;
        if ContentHash::of(&data).to_hex() != digest {
            return Err(FileOpError::permanent(format!(
                "object {provider_file_id} does not match its digest"
            )));
        }
        Ok(Bytes::from(data))
    }

    async fn delete(&self, provider_file_id: &str) -> Result<(), FileOpError> {
        let path = self.object_path(provider_file_id)?;
        remove_if_exists(fs::remove_file(&path).await)
    }
}
