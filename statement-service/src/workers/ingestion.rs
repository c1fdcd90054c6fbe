use crate::models::{ProcessingStage, Statement};
use crate::services::cash_flow::compute_metrics;
use crate::services::categorizer::Categorizer;
use crate::services::extraction::{ExtractionError, ExtractionProvider};
use crate::services::metrics::{record_dropped_rows, record_extraction, record_ingestion};
use crate::services::normalizer::Normalizer;
use crate::services::recurring::{DetectionConfig, RecurringChargeDetector};
use crate::services::repository::LedgerRepository;
use crate::services::storage::{Storage, StorageError};
use chrono::{Duration as ChronoDuration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Upper bound on one extraction call.
    pub extraction_timeout: Duration,
    pub metrics_window_days: i64,
    pub recurring_lookback_days: i64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            extraction_timeout: Duration::from_secs(90),
            metrics_window_days: 30,
            recurring_lookback_days: 730,
        }
    }
}

/// Why an ingestion run failed. The display text is what lands in the
/// statement's error field.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Failed to fetch statement: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Extraction(#[from] ExtractionError),

    #[error("Extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),

    #[error("No parseable transactions in {record_count} extracted rows")]
    NoParseableTransactions { record_count: usize },

    #[error("{0}")]
    Repository(#[from] AppError),

    #[error("Persisted {persisted} of {expected} transactions")]
    Invariant { expected: usize, persisted: usize },
}

impl IngestionError {
    /// Whether a manual requeue has a chance of succeeding without changing
    /// the document.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retriable(),
            Self::Extraction(e) => matches!(
                e,
                ExtractionError::Network(_)
                    | ExtractionError::Timeout(_)
                    | ExtractionError::RateLimited
                    | ExtractionError::Api(_)
            ),
            Self::ExtractionTimeout(_) | Self::Repository(_) => true,
            Self::NoParseableTransactions { .. } | Self::Invariant { .. } => false,
        }
    }
}

/// Counts reported by a successful run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestionOutcome {
    pub record_count: usize,
    pub processed_count: usize,
    pub dropped_invalid: usize,
    pub dropped_duplicates: usize,
    pub recurring_detected: usize,
}

/// Runs the pipeline for one claimed statement: fetch, extract, normalize,
/// categorize, persist, then refresh the profile's derived data.
pub struct IngestionJob {
    repository: Arc<dyn LedgerRepository>,
    storage: Arc<dyn Storage>,
    extractor: Arc<dyn ExtractionProvider>,
    detector: RecurringChargeDetector,
    config: IngestionConfig,
}

impl IngestionJob {
    pub fn new(
        repository: Arc<dyn LedgerRepository>,
        storage: Arc<dyn Storage>,
        extractor: Arc<dyn ExtractionProvider>,
        config: IngestionConfig,
    ) -> Self {
        let detector = RecurringChargeDetector::new(
            repository.clone(),
            DetectionConfig {
                lookback_days: config.recurring_lookback_days,
                ..Default::default()
            },
        );

        Self {
            repository,
            storage,
            extractor,
            detector,
            config,
        }
    }

    /// Process a statement already claimed by the queue (stage EXTRACTING)
    /// and leave it in DONE or FAILED.
    #[tracing::instrument(
        skip_all,
        fields(statement_id = %statement.id, profile_id = %statement.profile_id)
    )]
    pub async fn process(&self, statement: Statement) -> Result<IngestionOutcome, IngestionError> {
        let start = Instant::now();
        tracing::info!(
            file_name = %statement.file_name,
            mime_type = %statement.mime_type,
            "Ingestion started"
        );

        let result = self.run(&statement).await;

        match &result {
            Ok(outcome) => {
                record_ingestion("completed", start.elapsed().as_secs_f64());
                tracing::info!(
                    record_count = outcome.record_count,
                    processed_count = outcome.processed_count,
                    dropped_invalid = outcome.dropped_invalid,
                    dropped_duplicates = outcome.dropped_duplicates,
                    recurring_detected = outcome.recurring_detected,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Ingestion completed"
                );
            }
            Err(e) => {
                record_ingestion("failed", start.elapsed().as_secs_f64());
                tracing::error!(error = %e, retriable = e.is_retriable(), "Ingestion failed");

                if let Err(update_err) = self
                    .repository
                    .fail_statement(statement.id, &e.to_string())
                    .await
                {
                    tracing::error!(
                        error = %update_err,
                        "Failed to record ingestion failure"
                    );
                }
            }
        }

        result
    }

    async fn run(&self, statement: &Statement) -> Result<IngestionOutcome, IngestionError> {
        let id = statement.id;

        // 1. Fetch and extract
        let bytes = self.storage.fetch_bytes(&statement.storage_path).await?;

        let extract_start = Instant::now();
        let candidates = tokio::time::timeout(
            self.config.extraction_timeout,
            self.extractor.extract(&bytes, &statement.mime_type),
        )
        .await
        .map_err(|_| IngestionError::ExtractionTimeout(self.config.extraction_timeout))??;
        record_extraction(self.extractor.name(), extract_start.elapsed().as_secs_f64());

        tracing::debug!(rows = candidates.len(), "Candidate rows extracted");

        // 2. Normalize
        self.repository
            .set_stage(id, ProcessingStage::Normalizing)
            .await?;

        let batch = Normalizer::new(statement.created_at.date_naive()).normalize(&candidates);
        record_dropped_rows("invalid", batch.dropped_invalid);
        record_dropped_rows("duplicate", batch.dropped_duplicates);

        if batch.nothing_parseable() {
            return Err(IngestionError::NoParseableTransactions {
                record_count: batch.record_count,
            });
        }

        // 3. Categorize
        self.repository
            .set_stage(id, ProcessingStage::Categorizing)
            .await?;

        let rules = self.repository.list_active_rules(statement.user_id).await?;
        let recurring = self
            .repository
            .list_recurring_charges(statement.profile_id)
            .await?;
        let categorizer = Categorizer::for_statement(statement, rules, &recurring);

        let record_count = batch.record_count;
        let dropped_invalid = batch.dropped_invalid;
        let dropped_duplicates = batch.dropped_duplicates;
        let transactions = categorizer.apply(statement, batch.transactions);

        // 4. Persist, replacing anything from an earlier run
        self.repository
            .set_stage(id, ProcessingStage::Persisting)
            .await?;

        let persisted = self
            .repository
            .replace_statement_transactions(id, &transactions, record_count as i32)
            .await? as usize;
        if persisted != transactions.len() {
            return Err(IngestionError::Invariant {
                expected: transactions.len(),
                persisted,
            });
        }

        // 5. Derived data
        let today = Utc::now().date_naive();
        let detected = self
            .detector
            .run(statement.user_id, statement.profile_id, today)
            .await?;

        let window = self.config.metrics_window_days;
        let history = self
            .repository
            .list_profile_transactions(
                statement.profile_id,
                today - ChronoDuration::days(window.max(1) - 1),
            )
            .await?;
        let metrics = compute_metrics(
            statement.user_id,
            statement.profile_id,
            &history,
            today,
            window,
        );
        self.repository.upsert_financial_metrics(&metrics).await?;

        // 6. Done
        self.repository.complete_statement(id).await?;

        Ok(IngestionOutcome {
            record_count,
            processed_count: persisted,
            dropped_invalid,
            dropped_duplicates,
            recurring_detected: detected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_user_facing() {
        let timeout = IngestionError::ExtractionTimeout(Duration::from_secs(90));
        assert_eq!(timeout.to_string(), "Extraction timed out after 90s");

        let empty = IngestionError::NoParseableTransactions { record_count: 4 };
        assert_eq!(
            empty.to_string(),
            "No parseable transactions in 4 extracted rows"
        );

        let storage: IngestionError = StorageError::NotFound("a.pdf".to_string()).into();
        assert!(storage.to_string().contains("a.pdf"));
        assert!(!storage.is_retriable());
    }

    #[test]
    fn test_transient_failures_are_retriable() {
        assert!(IngestionError::ExtractionTimeout(Duration::from_secs(1)).is_retriable());
        assert!(IngestionError::from(ExtractionError::RateLimited).is_retriable());
        assert!(!IngestionError::from(ExtractionError::MalformedResponse(
            "no rows".to_string()
        ))
        .is_retriable());
        assert!(!IngestionError::NoParseableTransactions { record_count: 2 }.is_retriable());
    }
}
