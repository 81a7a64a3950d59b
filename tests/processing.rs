mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use upload_pipeline::events::EventReceiver;
use upload_pipeline::models::ImportConfig;
use upload_pipeline::processor::{BatchContext, RecordBatch};
use upload_pipeline::prelude::*;

/// Sleeps per batch, then accepts or rejects every batch.
struct SlowProcessor {
    delay: Duration,
    accept: bool,
}

#[async_trait]
impl BatchProcessor for SlowProcessor {
    async fn process_batch(&self, _ctx: &BatchContext, batch: &RecordBatch) -> Result<(), String> {
        tokio::time::sleep(self.delay).await;
        if self.accept {
            Ok(())
        } else {
            Err(format!("batch {} rejected", batch.index))
        }
    }
}

fn lead_rows(rows: usize) -> Bytes {
    let mut csv = String::from("id,email\n");
    for i in 0..rows {
        csv.push_str(&format!("{i},lead{i}@example.com\n"));
    }
    Bytes::from(csv)
}

fn batches_of(size: usize) -> ProcessRequest {
    ProcessRequest {
        csv_config: None,
        import_config: Some(ImportConfig { batch_size: Some(size), options: None }),
    }
}

async fn uploaded_session(stack: &LocalStack, rows: usize) -> (UploadSession, EventReceiver) {
    let (session, events) = UploadSession::create(
        Arc::new(stack.api.clone()),
        Arc::new(lead_rows(rows)),
        new_upload("leads.csv"),
        fast_transfer_config(256, 2),
    )
    .await
    .unwrap();
    assert_eq!(session.start().await.unwrap(), UploadOutcome::Uploaded);
    (session, events)
}

#[tokio::test]
async fn cancel_during_processing_freezes_the_counters() {
    let processor = SlowProcessor { delay: Duration::from_millis(50), accept: true };
    let stack = local_stack(Arc::new(processor)).await;
    let (session, mut events) = uploaded_session(&stack, 40).await;

    let started = session.start_processing(batches_of(1)).await.unwrap();
    assert_eq!(started.total_batches, 40);

    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, UploadEvent::ProcessingProgress(s) if s.completed_batches > 0)
    })
    .await;
    session.cancel().await;
    assert!(!session.polling_active().await);

    let frozen = stack.manager.processing_stats(session.job_id()).await.unwrap();
    assert!(frozen.completed_batches > 0);
    assert!(!frozen.is_terminal());

    // Batches still in flight finish without moving the counters.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let later = stack.manager.processing_stats(session.job_id()).await.unwrap();
    assert_eq!(later, frozen);

    let job = stack.manager.get_job(session.job_id()).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!stack.manager.assembled_path(session.job_id()).exists());

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                UploadEvent::ProcessingCompleted(_) | UploadEvent::ProcessingFailed { .. }
            ),
            "unexpected {event:?} after cancel"
        );
    }
}

#[tokio::test]
async fn every_batch_failing_fails_the_job() {
    let processor = SlowProcessor { delay: Duration::from_millis(1), accept: false };
    let stack = local_stack(Arc::new(processor)).await;
    let (session, mut events) = uploaded_session(&stack, 10).await;

    let started = session.start_processing(batches_of(5)).await.unwrap();
    assert_eq!(started.total_batches, 2);

    let event = wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, UploadEvent::ProcessingCompleted(_) | UploadEvent::ProcessingFailed { .. })
    })
    .await;
    match event {
        UploadEvent::ProcessingFailed { stats, message } => {
            let expected = ProcessingStats {
                total_batches: 2,
                completed_batches: 0,
                failed_batches: 2,
            };
            assert_eq!(stats, expected);
            assert!(message.contains("2 of 2 batches failed"), "message: {message}");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let job = stack.manager.get_job(session.job_id()).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    tokio::time::timeout(Duration::from_secs(1), async {
        while session.polling_active().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("processing poller kept running");
}
