mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{days_ago, fast_queue, row, spawn_pipeline, spawn_pipeline_with};
use service_core::error::AppError;
use statement_service::models::{CandidateTransaction, ProcessingStage, Statement, StatementStatus};
use statement_service::services::extraction::{
    ExtractionError, ExtractionProvider, MockExtractionProvider,
};
use statement_service::services::LedgerRepository;
use statement_service::workers::{IngestionConfig, QueueStatus};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn one_row() -> Vec<CandidateTransaction> {
    vec![row(&days_ago(3), "COFFEE SHOP", "-4.50")]
}

#[tokio::test]
async fn test_concurrency_never_exceeds_max() {
    let mut mock = MockExtractionProvider::new();
    let names: Vec<String> = (0..5).map(|i| format!("stmt-{}.pdf", i)).collect();
    for name in &names {
        mock = mock
            .with_rows(name.as_bytes(), one_row())
            .with_delay(name.as_bytes(), Duration::from_millis(200));
    }
    let mock = Arc::new(mock);
    let pipeline =
        spawn_pipeline_with(mock.clone(), fast_queue(2), IngestionConfig::default()).await;

    let mut ids = Vec::new();
    for name in &names {
        let statement = pipeline.upload(name, name.as_bytes()).await;
        pipeline.queue.enqueue(statement.id).await;
        ids.push(statement.id);
    }
    assert!(pipeline.queue.status().active <= 2);

    for id in &ids {
        let statement = pipeline.wait_for_terminal(*id).await;
        assert_eq!(statement.status, StatementStatus::Completed);
    }

    assert_eq!(mock.call_count(), 5);
    assert_eq!(mock.max_in_flight(), 2);
    assert_eq!(pipeline.repo.max_in_flight(), 2);
}

#[tokio::test]
async fn test_statements_claimed_oldest_first() {
    let mock = Arc::new(MockExtractionProvider::new());
    let pipeline =
        spawn_pipeline_with(mock.clone(), fast_queue(1), IngestionConfig::default()).await;

    let mut ids = Vec::new();
    for (i, name) in ["first.pdf", "second.pdf", "third.pdf"].iter().enumerate() {
        let mut statement = Statement::new(
            pipeline.user_id,
            pipeline.profile_id,
            *name,
            "application/pdf",
            1,
            *name,
        );
        statement.created_at = Utc::now() - chrono::Duration::minutes(10 - i as i64);
        let statement = pipeline
            .upload_statement(statement, name.as_bytes())
            .await;
        ids.push(statement.id);
    }

    // Enqueue newest first; claiming still follows upload order
    for id in ids.iter().rev() {
        pipeline.queue.enqueue(*id).await;
    }
    for id in &ids {
        pipeline.wait_for_terminal(*id).await;
    }

    assert_eq!(
        mock.calls(),
        vec![
            "first.pdf".to_string(),
            "second.pdf".to_string(),
            "third.pdf".to_string()
        ]
    );
}

#[tokio::test]
async fn test_timed_out_job_frees_its_slot() {
    let mock = Arc::new(
        MockExtractionProvider::new()
            .with_rows(b"slow.pdf", one_row())
            .with_delay(b"slow.pdf", Duration::from_secs(30))
            .with_rows(b"fast.pdf", one_row()),
    );
    let pipeline = spawn_pipeline_with(
        mock.clone(),
        fast_queue(1),
        IngestionConfig {
            extraction_timeout: Duration::from_millis(150),
            ..Default::default()
        },
    )
    .await;

    let slow = pipeline.upload("slow.pdf", b"slow.pdf").await;
    let fast = pipeline.upload("fast.pdf", b"fast.pdf").await;
    pipeline.queue.enqueue(slow.id).await;
    pipeline.queue.enqueue(fast.id).await;

    let slow = pipeline.wait_for_terminal(slow.id).await;
    assert_eq!(slow.status, StatementStatus::Failed);
    assert!(slow
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
    assert!(pipeline
        .repo
        .list_statement_transactions(slow.id)
        .await
        .unwrap()
        .is_empty());

    let fast = pipeline.wait_for_terminal(fast.id).await;
    assert_eq!(fast.status, StatementStatus::Completed);
    assert_eq!(fast.processed_count, Some(1));
}

#[tokio::test]
async fn test_supervisor_exits_when_idle_and_restarts_on_enqueue() {
    let mock = MockExtractionProvider::new()
        .with_rows(b"a.pdf", one_row())
        .with_rows(b"b.pdf", one_row());
    let pipeline = spawn_pipeline(mock, fast_queue(2)).await;

    let a = pipeline.upload("a.pdf", b"a.pdf").await;
    pipeline.queue.enqueue(a.id).await;
    pipeline.wait_for_terminal(a.id).await;
    pipeline.wait_idle().await;
    assert_eq!(pipeline.queue.status(), QueueStatus { active: 0, max: 2 });

    let b = pipeline.upload("b.pdf", b"b.pdf").await;
    pipeline.queue.enqueue(b.id).await;
    let b = pipeline.wait_for_terminal(b.id).await;
    assert_eq!(b.status, StatementStatus::Completed);
}

#[tokio::test]
async fn test_resume_picks_up_statements_left_queued() {
    let mock = MockExtractionProvider::new().with_rows(b"left.pdf", one_row());
    let pipeline = spawn_pipeline(mock, fast_queue(1)).await;

    let statement = pipeline.upload("left.pdf", b"left.pdf").await;
    assert!(pipeline.repo.mark_queued(statement.id).await.unwrap());
    assert!(!pipeline.queue.is_running());

    pipeline.queue.resume();
    let statement = pipeline.wait_for_terminal(statement.id).await;
    assert_eq!(statement.status, StatementStatus::Completed);
}

#[tokio::test]
async fn test_supervisor_outlives_database_outage() {
    let mock = MockExtractionProvider::new().with_rows(b"outage.pdf", one_row());
    let pipeline = spawn_pipeline(mock, fast_queue(1)).await;

    let statement = pipeline.upload("outage.pdf", b"outage.pdf").await;
    assert!(pipeline.repo.mark_queued(statement.id).await.unwrap());

    pipeline.repo.set_unavailable(true);
    pipeline.queue.resume();
    // Several poll intervals of failed claims
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(pipeline.queue.is_running());

    pipeline.repo.set_unavailable(false);
    let statement = pipeline.wait_for_terminal(statement.id).await;
    assert_eq!(statement.status, StatementStatus::Completed);
    assert_eq!(statement.processed_count, Some(1));

    pipeline.wait_idle().await;
}

#[tokio::test]
async fn test_requeue_replaces_transactions() {
    let rows = vec![
        row(&days_ago(5), "GROCER", "-20.00"),
        row(&days_ago(4), "PAYROLL", "1000.00"),
        row(&days_ago(3), "FUEL", "-35.10"),
    ];
    let mock = MockExtractionProvider::new().with_rows(b"jan.pdf", rows);
    let pipeline = spawn_pipeline(mock, fast_queue(1)).await;

    let statement = pipeline.upload("jan.pdf", b"jan.pdf").await;
    pipeline.queue.enqueue(statement.id).await;
    pipeline.wait_for_terminal(statement.id).await;
    assert_eq!(pipeline.repo.transaction_count(), 3);

    let status = pipeline.queue.requeue(statement.id).await.unwrap();
    assert_eq!(status.max, 1);
    let statement = pipeline.wait_for_terminal(statement.id).await;

    assert_eq!(statement.status, StatementStatus::Completed);
    assert_eq!(statement.processed_count, Some(3));
    assert_eq!(pipeline.repo.transaction_count(), 3);
}

#[tokio::test]
async fn test_requeue_rejects_unknown_and_in_flight() {
    let mock = MockExtractionProvider::new()
        .with_rows(b"busy.pdf", one_row())
        .with_delay(b"busy.pdf", Duration::from_millis(500));
    let pipeline = spawn_pipeline(mock, fast_queue(1)).await;

    let unknown = pipeline.queue.requeue(Uuid::new_v4()).await;
    assert!(matches!(unknown, Err(AppError::NotFound(_))));

    let statement = pipeline.upload("busy.pdf", b"busy.pdf").await;
    pipeline.queue.enqueue(statement.id).await;
    pipeline.wait_for_in_flight(statement.id).await;

    let busy = pipeline.queue.requeue(statement.id).await;
    assert!(matches!(busy, Err(AppError::Conflict(_))));

    let statement = pipeline.wait_for_terminal(statement.id).await;
    assert_eq!(statement.status, StatementStatus::Completed);
}

#[tokio::test]
async fn test_enqueue_swallows_repository_errors() {
    let pipeline = spawn_pipeline(MockExtractionProvider::new(), fast_queue(1)).await;
    let statement = pipeline.upload("x.pdf", b"x.pdf").await;

    pipeline.repo.set_unavailable(true);
    pipeline.queue.enqueue(statement.id).await;
    pipeline.repo.set_unavailable(false);

    let stored = pipeline.statement(statement.id).await;
    assert_eq!(stored.processing_stage, ProcessingStage::Uploaded);
    assert!(!pipeline.queue.is_running());
}

#[tokio::test]
async fn test_done_statement_is_not_enqueued_again() {
    let mock = MockExtractionProvider::new().with_rows(b"done.pdf", one_row());
    let pipeline = spawn_pipeline(mock, fast_queue(1)).await;

    let statement = pipeline.upload("done.pdf", b"done.pdf").await;
    pipeline.queue.enqueue(statement.id).await;
    pipeline.wait_for_terminal(statement.id).await;
    pipeline.wait_idle().await;

    pipeline.queue.enqueue(statement.id).await;
    let stored = pipeline.statement(statement.id).await;
    assert_eq!(stored.processing_stage, ProcessingStage::Done);
    assert_eq!(pipeline.repo.transaction_count(), 1);
}

/// Panics on one document, returns nothing for the rest.
struct PanickingExtractor;

#[async_trait]
impl ExtractionProvider for PanickingExtractor {
    async fn extract(
        &self,
        bytes: &[u8],
        _declared_type: &str,
    ) -> Result<Vec<CandidateTransaction>, ExtractionError> {
        if bytes == b"boom" {
            panic!("extractor exploded");
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "panicking"
    }
}

#[tokio::test]
async fn test_panicking_job_marks_failed_and_frees_slot() {
    let pipeline = spawn_pipeline_with(
        Arc::new(PanickingExtractor),
        fast_queue(1),
        IngestionConfig::default(),
    )
    .await;

    let bad = pipeline.upload("boom.pdf", b"boom").await;
    let good = pipeline.upload("fine.pdf", b"fine").await;
    pipeline.queue.enqueue(bad.id).await;
    pipeline.queue.enqueue(good.id).await;

    let bad = pipeline.wait_for_terminal(bad.id).await;
    assert_eq!(bad.status, StatementStatus::Failed);
    assert!(bad.error_message.unwrap_or_default().contains("panicked"));

    let good = pipeline.wait_for_terminal(good.id).await;
    assert_eq!(good.status, StatementStatus::Completed);
    assert_eq!(good.record_count, Some(0));
}
