//! Cancellation Tests
//!
//! A cancelled operation is rolled back before the cancellation is reported.

#[cfg(test)]
mod tests {
    use crate::harness::{CompensationLog, ScenarioBuilder};
    use bytes::Bytes;
    use filesafe_recovery::{
        new_cancel_pair, CancelReason, FileOpError, LifecycleState, OperationStatus, ProviderCall,
        RecoveryError,
    };
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_call_rolls_back_journaled_steps() {
        let s = ScenarioBuilder::new().target("primary").build();
        let undo = CompensationLog::new();
        let log = undo.clone();
        let (token, handle) = new_cancel_pair();
        let op = s.operation("op-1", "primary").with_cancel(token);
        let manager = Arc::clone(&s.manager);

        let task = tokio::spawn(async move {
            manager
                .execute(op, move |ctx| {
                    let log = log.clone();
                    async move {
                        ctx.record_step(ctx.step("create-draft"), log.action("create-draft"))?;
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, FileOpError>(())
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel(CancelReason::DeadlineExceeded);
        let err = task.await.unwrap().unwrap_err();

        match err {
            RecoveryError::Cancelled {
                operation_id,
                reason,
                rollback,
            } => {
                assert_eq!(operation_id, "op-1");
                assert_eq!(reason, CancelReason::DeadlineExceeded);
                assert_eq!(rollback.compensated, vec!["create-draft"]);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(undo.entries(), vec!["create-draft"]);
        assert_eq!(
            s.manager.journal().status("op-1"),
            Some(OperationStatus::RolledBack)
        );
        assert_eq!(s.file_state("op-1"), Some(LifecycleState::Failed));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_calls_provider() {
        let s = ScenarioBuilder::new().target("primary").build();
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);

        let err = s
            .manager
            .upload(
                s.operation("op-1", "primary").with_cancel(token),
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Cancelled { .. }));
        assert_eq!(s.provider("primary").total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all_inflight() {
        let s = ScenarioBuilder::new().target("primary").build();
        let primary = s.provider("primary");
        primary.set_latency(Some(Duration::from_secs(60)));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let manager = Arc::clone(&s.manager);
            let op = s.operation(&format!("op-{i}"), "primary");
            tasks.push(tokio::spawn(async move {
                manager.upload(op, Bytes::from_static(b"payload")).await
            }));
        }
        while primary.calls(ProviderCall::Upload) < 3 {
            tokio::task::yield_now().await;
        }

        s.manager.shutdown();
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(
                err,
                RecoveryError::Cancelled {
                    reason: CancelReason::Shutdown,
                    ..
                }
            ));
        }
        assert_eq!(primary.stored_count(), 0);
        assert_eq!(s.manager.journal().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_sleep() {
        let s = ScenarioBuilder::new()
            .target("primary")
            .configure(|o| {
                o.base_delay_ms = 5_000;
                o.max_delay_ms = 5_000;
            })
            .build();
        let primary = s.provider("primary");
        primary.fail_always(ProviderCall::Upload, FileOpError::transient("blip"));

        let manager = Arc::clone(&s.manager);
        let op = s.operation("op-1", "primary");
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(async move { manager.upload(op, Bytes::from_static(b"x")).await });

        while primary.calls(ProviderCall::Upload) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(s.manager.cancel("op-1", CancelReason::UserRequested));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RecoveryError::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(primary.calls(ProviderCall::Upload), 1);
        assert!(!s.manager.cancel("op-1", CancelReason::UserRequested));
    }
}
