//! Common test utilities for statement-service integration tests.

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use service_core::config::Config as CommonConfig;
use statement_service::config::{
    DatabaseConfig, ExtractionConfig, PipelineConfig, QueueSettings, StatementServiceConfig,
    StorageConfig,
};
use statement_service::models::{CandidateTransaction, Statement};
use statement_service::services::extraction::{ExtractionProvider, MockExtractionProvider};
use statement_service::services::{InMemoryRepository, LedgerRepository, LocalStorage, Storage};
use statement_service::workers::{IngestionConfig, IngestionJob, QueueConfig, QueueManager};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

static INIT: Once = Once::new();

/// How long waiters poll before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,statement_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn fast_queue(max_concurrent: usize) -> QueueConfig {
    QueueConfig {
        max_concurrent,
        poll_interval: Duration::from_millis(200),
    }
}

/// Service configuration for in-process apps; nothing here is dialed.
pub fn test_config() -> StatementServiceConfig {
    StatementServiceConfig {
        common: CommonConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
        },
        service_name: "statement-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 1,
            min_connections: 1,
        },
        storage: StorageConfig {
            local_path: String::new(),
        },
        extraction: ExtractionConfig {
            endpoint: String::new(),
            api_key: None,
            model: None,
            timeout_secs: 5,
        },
        queue: QueueSettings {
            max_concurrent: 3,
            poll_interval_ms: 200,
            shutdown_grace_secs: 1,
        },
        pipeline: PipelineConfig {
            metrics_window_days: 30,
            recurring_lookback_days: 730,
        },
    }
}

pub fn row(date: &str, description: &str, amount: &str) -> CandidateTransaction {
    CandidateTransaction {
        date: date.to_string(),
        description: description.to_string(),
        amount: amount.to_string(),
        ..Default::default()
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// ISO date `days` before today.
pub fn days_ago(days: i64) -> String {
    (today() - ChronoDuration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

/// A queue wired to in-memory persistence, temp-dir storage and a scripted
/// extraction provider.
pub struct TestPipeline {
    pub repo: Arc<InMemoryRepository>,
    pub storage: Arc<LocalStorage>,
    pub extractor: Arc<dyn ExtractionProvider>,
    pub queue: QueueManager,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    _dir: TempDir,
}

pub async fn spawn_pipeline(extractor: MockExtractionProvider, queue: QueueConfig) -> TestPipeline {
    spawn_pipeline_with(Arc::new(extractor), queue, IngestionConfig::default()).await
}

pub async fn spawn_pipeline_with(
    extractor: Arc<dyn ExtractionProvider>,
    queue: QueueConfig,
    ingestion: IngestionConfig,
) -> TestPipeline {
    init_tracing();

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let storage = Arc::new(
        LocalStorage::new(dir.path())
            .await
            .expect("Failed to create storage"),
    );
    let repo = Arc::new(InMemoryRepository::new());

    let job = Arc::new(IngestionJob::new(
        repo.clone(),
        storage.clone(),
        extractor.clone(),
        ingestion,
    ));
    let queue = QueueManager::new(repo.clone(), job, queue);

    TestPipeline {
        repo,
        storage,
        extractor,
        queue,
        user_id: Uuid::new_v4(),
        profile_id: Uuid::new_v4(),
        _dir: dir,
    }
}

impl TestPipeline {
    /// Store `content` under `name` and register an uploaded statement for it.
    pub async fn upload(&self, name: &str, content: &[u8]) -> Statement {
        let statement = Statement::new(
            self.user_id,
            self.profile_id,
            name,
            "application/pdf",
            content.len() as i64,
            name,
        );
        self.upload_statement(statement, content).await
    }

    pub async fn upload_statement(&self, statement: Statement, content: &[u8]) -> Statement {
        self.storage
            .store_bytes(&statement.storage_path, content.to_vec())
            .await
            .expect("Failed to store statement bytes");
        self.repo
            .insert_statement(&statement)
            .await
            .expect("Failed to insert statement");
        statement
    }

    pub async fn statement(&self, id: Uuid) -> Statement {
        self.repo
            .get_statement(id)
            .await
            .expect("Failed to load statement")
            .expect("Statement missing")
    }

    /// Poll until the statement reaches DONE or FAILED.
    pub async fn wait_for_terminal(&self, id: Uuid) -> Statement {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let statement = self.statement(id).await;
            if statement.processing_stage.is_terminal() {
                return statement;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "Statement {} stuck in {:?}",
                    id, statement.processing_stage
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until a job owns the statement.
    pub async fn wait_for_in_flight(&self, id: Uuid) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while !self.statement(id).await.processing_stage.is_in_flight() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "Statement {} never started",
                id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the supervisor has exited.
    pub async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.queue.is_running() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "Queue supervisor never went idle"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
