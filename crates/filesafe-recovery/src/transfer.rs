//! Resumable chunked upload on top of the journal.
//!
//! Every sub-step is journaled as it completes: the session open (compensated
//! by aborting the session), each chunk (no compensation of its own, the
//! session abort discards it), and the completion (compensated by deleting the
//! assembled file). A retry on the same target skips the journaled steps and
//! resumes with the first chunk not yet acknowledged. A reroute unwinds the
//! steps first, so the fallback target starts from a fresh session.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::FileOpError;
use crate::journal::NoCompensation;
use crate::manager::{AttemptContext, FileOperation, RecoveryManager, RecoveryOutcome};
use crate::provider::{abort_compensation, delete_compensation, UploadSession, SESSION_DETAIL_PREFIX};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Step name for the session open.
pub const OPEN_SESSION_STEP: &str = "open-session";

/// Step name for the session completion.
pub const COMPLETE_SESSION_STEP: &str = "complete-session";

/// Step name for chunk `index`.
pub fn chunk_step(index: u32) -> String {
    format!("chunk-{index:08}")
}

fn journaled_session(ctx: &AttemptContext) -> Option<UploadSession> {
    ctx.steps()
        .into_iter()
        .find(|s| s.name == OPEN_SESSION_STEP)
        .and_then(|s| {
            s.detail
                .as_deref()
                .and_then(|d| d.strip_prefix(SESSION_DETAIL_PREFIX))
                .map(|id| UploadSession {
                    session_id: id.to_string(),
                    target: s.target.clone(),
                    file_id: ctx.metadata.file_id.clone(),
                })
        })
}

/// Uploads `data` in `chunk_size` pieces through one provider session,
/// resuming from the journal. Returns the provider file id.
pub async fn upload_chunked(
    ctx: &AttemptContext,
    data: &Bytes,
    chunk_size: usize,
) -> Result<String, FileOpError> {
    if chunk_size == 0 {
        return Err(FileOpError::internal("chunk size must be positive"));
    }
    if let Some(done) = ctx
        .steps()
        .into_iter()
        .find(|s| s.name == COMPLETE_SESSION_STEP)
        .and_then(|s| s.provider_file_id)
    {
        return Ok(done);
    }

    let session = match journaled_session(ctx) {
        Some(session) => session,
        None => {
            let session = ctx.provider.open_upload_session(&ctx.metadata).await?;
            ctx.record_step(
                ctx.step(OPEN_SESSION_STEP)
                    .with_detail(format!("{SESSION_DETAIL_PREFIX}{}", session.session_id)),
                abort_compensation(Arc::clone(&ctx.provider), session.clone()),
            )?;
            session
        }
    };

    let mut resumed = 0usize;
    for (index, offset) in (0..data.len()).step_by(chunk_size).enumerate() {
        let index = u32::try_from(index)
            .map_err(|_| FileOpError::internal("too many chunks for one session"))?;
        let name = chunk_step(index);
        if ctx.has_step(&name) {
            resumed += 1;
            continue;
        }
        let end = (offset + chunk_size).min(data.len());
        let ack = ctx
            .provider
            .upload_chunk(&session, index, data.slice(offset..end))
            .await?;
        if ack.received != (end - offset) as u64 {
            return Err(FileOpError::transient(format!(
                "chunk {index} short: {} of {} bytes acknowledged",
                ack.received,
                end - offset
            )));
        }
        ctx.record_step(ctx.step(name), Box::new(NoCompensation))?;
    }
    if resumed > 0 {
        debug!(
            operation_id = %ctx.operation_id,
            backend = %ctx.target,
            resumed,
            "resumed chunked upload"
        );
    }

    let id = ctx.provider.complete_upload_session(&session).await?;
    ctx.record_step(
        ctx.step(COMPLETE_SESSION_STEP).with_provider_file_id(id.clone()),
        delete_compensation(Arc::clone(&ctx.provider), id.clone()),
    )?;
    Ok(id)
}

impl RecoveryManager {
    /// Uploads `data` through a chunked session under recovery.
    pub async fn upload_chunked(
        &self,
        op: FileOperation,
        data: Bytes,
        chunk_size: usize,
    ) -> crate::error::Result<RecoveryOutcome<String>> {
        self.execute(op, move |ctx| {
            let data = data.clone();
            async move { upload_chunked(&ctx, &data, chunk_size).await }
        })
        .await
    }
}
