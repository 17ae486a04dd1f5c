//! Journal Durability Tests
//!
//! Snapshot the journal while an operation is in flight, lose the process,
//! restore from the snapshot and roll back what was left behind.

#[cfg(test)]
mod tests {
    use crate::harness::{ScenarioBuilder, TestEnv};
    use bytes::Bytes;
    use filesafe_recovery::provider::delete_compensation;
    use filesafe_recovery::{
        FileMetadata, FileOpError, FileProvider, JournalError, JournalSnapshot, LocalDiskProvider,
        NoCompensation, OperationLog, OperationStatus, ProviderRegistry, StepDescriptor,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn test_restore_after_crash_deletes_orphaned_upload() {
        let env = TestEnv::new("restore_after_crash");
        let snapshot_path = env.tempdir().join("journal.bin");
        let disk = env.local_provider("local-cache").await;
        let s = ScenarioBuilder::new()
            .provider("local-cache", disk.clone())
            .build();

        let manager = Arc::clone(&s.manager);
        let op = s.operation("op-1", "local-cache");
        let task = tokio::spawn(async move {
            manager
                .execute(op, |ctx| async move {
                    let id = ctx
                        .provider
                        .upload(Bytes::from_static(b"orphan"), &ctx.metadata)
                        .await?;
                    ctx.record_step(
                        ctx.step("upload").with_provider_file_id(id.clone()),
                        delete_compensation(Arc::clone(&ctx.provider), id),
                    )?;
                    // Publishing never returns; the process dies here.
                    std::future::pending::<Result<(), FileOpError>>().await
                })
                .await
        });

        let journal = s.manager.journal();
        loop {
            if let Some(handle) = journal.handle("op-1") {
                if !journal.steps(&handle).is_empty() {
                    break;
                }
            }
            tokio::task::yield_now().await;
        }
        std::fs::write(&snapshot_path, journal.snapshot().to_bytes().unwrap()).unwrap();
        let orphan = journal.steps(&journal.handle("op-1").unwrap())[0]
            .provider_file_id
            .clone()
            .unwrap();
        // The stalled task stands in for the dead process; it is never
        // resumed, so its own rollback never runs.
        drop(s);

        let disk = env.local_provider("local-cache").await;
        assert!(disk.download(&orphan).await.is_ok());

        let registry = ProviderRegistry::new();
        registry.register(disk.clone());
        let restored = OperationLog::default();
        let bytes = std::fs::read(&snapshot_path).unwrap();
        let report = restored.restore(JournalSnapshot::from_bytes(&bytes).unwrap(), &registry);
        assert_eq!(report.pending, vec!["op-1"]);

        let results = restored.recover_pending().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].compensated, vec!["upload"]);
        assert!(disk.download(&orphan).await.is_err());
        assert_eq!(restored.status("op-1"), Some(OperationStatus::RolledBack));
        task.abort();
    }

    #[tokio::test]
    async fn test_unresolvable_step_abandons_operation() {
        let log = OperationLog::default();
        let handle = log
            .begin("op-1", FileMetadata::for_content("f", b"f"))
            .unwrap();
        log.record_step(
            &handle,
            StepDescriptor::new("create-draft", "gone"),
            Box::new(NoCompensation),
        )
        .unwrap();

        let restored = OperationLog::default();
        let report = restored.restore(log.snapshot(), &ProviderRegistry::new());
        assert_eq!(report.abandoned, vec!["op-1"]);
        assert_eq!(restored.status("op-1"), Some(OperationStatus::Abandoned));
        assert!(restored.recover_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_restored_terminal_entries_stay_terminal() {
        let s = ScenarioBuilder::new().target("primary").build();
        s.manager
            .upload(s.operation("op-1", "primary"), Bytes::from_static(b"done"))
            .await
            .unwrap();

        let restored = Arc::new(OperationLog::default());
        let report = restored.restore(s.manager.journal().snapshot(), s.registry.as_ref());
        assert_eq!(report.archived, 1);
        assert!(matches!(
            restored.rollback_by_id("op-1").await,
            Err(JournalError::InvalidState { .. })
        ));

        // A manager built on the restored journal refuses to reuse the id.
        let again = ScenarioBuilder::new()
            .target("primary")
            .journal(Arc::clone(&restored))
            .build();
        assert!(again
            .manager
            .upload(again.operation("op-1", "primary"), Bytes::from_static(b"again"))
            .await
            .is_err());
        assert_eq!(again.provider("primary").total_calls(), 0);
    }

    #[tokio::test]
    async fn test_chunked_upload_to_local_disk() {
        let env = TestEnv::new("chunked_local");
        let disk: Arc<LocalDiskProvider> = env.local_provider("local-cache").await;
        let s = ScenarioBuilder::new()
            .provider("local-cache", disk.clone())
            .build();

        let data = Bytes::from(vec![7u8; 10_000]);
        let outcome = s
            .manager
            .upload_chunked(s.operation("op-1", "local-cache"), data.clone(), 4096)
            .await
            .unwrap();
        assert_eq!(disk.download(&outcome.value).await.unwrap(), data);
        assert_eq!(
            std::fs::read_dir(disk.root().join("sessions")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_inspect_journal_reports_snapshot_file() -> anyhow::Result<()> {
        let env = TestEnv::new("inspect_journal");
        let s = ScenarioBuilder::new().target("primary").build();
        s.manager
            .upload(s.operation("done", "primary"), Bytes::from_static(b"a"))
            .await?;
        s.manager
            .journal()
            .begin("stuck", FileMetadata::for_content("stuck", b"b"))?;

        let path = env.tempdir().join("journal.bin");
        std::fs::write(&path, s.manager.journal().snapshot().to_bytes()?)?;

        let all: serde_json::Value =
            serde_json::from_str(&filesafe_recovery::cli::inspect_journal(&path, false)?)?;
        assert_eq!(all["total"], 2);
        assert_eq!(all["pending"], 1);

        let pending: serde_json::Value =
            serde_json::from_str(&filesafe_recovery::cli::inspect_journal(&path, true)?)?;
        let entries = pending["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["operation_id"], "stuck");
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_of_identical_bytes_keeps_committed_file() {
        let env = TestEnv::new("identical_bytes_rollback");
        let disk = env.local_provider("local-cache").await;
        let s = ScenarioBuilder::new()
            .provider("local-cache", disk.clone())
            .build();
        let payload = Bytes::from_static(b"same-bytes");

        let committed = s
            .manager
            .upload(s.operation("op-a", "local-cache"), payload.clone())
            .await
            .unwrap();

        let data = payload.clone();
        let err = s
            .manager
            .execute(s.operation("op-b", "local-cache"), move |ctx| {
                let data = data.clone();
                async move {
                    let id = ctx.provider.upload(data, &ctx.metadata).await?;
                    ctx.record_step(
                        ctx.step("upload").with_provider_file_id(id.clone()),
                        delete_compensation(Arc::clone(&ctx.provider), id),
                    )?;
                    Err::<(), _>(FileOpError::permanent("rejected by policy"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.rollback().unwrap().compensated, vec!["upload"]);

        assert_eq!(disk.download(&committed.value).await.unwrap(), payload);
        assert_eq!(
            s.manager.journal().status("op-a"),
            Some(OperationStatus::Committed)
        );
    }
}
