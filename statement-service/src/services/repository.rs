use crate::models::{
    FinancialMetrics, MerchantRule, ProcessingStage, RecurringCharge, Statement, Transaction,
};
use crate::services::recurring::DetectedPattern;
use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use uuid::Uuid;

/// Result of resetting a statement for another ingestion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Prior transactions were removed and the statement is queued again.
    Requeued { deleted_transactions: u64 },
    NotFound,
    /// A job currently owns the statement.
    InFlight,
}

/// Persistence seam for the ingestion pipeline.
///
/// Every status change writes `status` and `processing_stage` together, as
/// derived by [`ProcessingStage::status`].
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Statements

    async fn insert_statement(&self, statement: &Statement) -> Result<(), AppError>;

    async fn get_statement(&self, id: Uuid) -> Result<Option<Statement>, AppError>;

    /// Move an uploaded, failed or already queued statement to QUEUED.
    /// Returns false when the statement is unknown, in flight or done.
    async fn mark_queued(&self, id: Uuid) -> Result<bool, AppError>;

    /// Atomically delete the statement's transactions, clear counts and
    /// error, and move it back to QUEUED.
    async fn reset_for_requeue(&self, id: Uuid) -> Result<RequeueOutcome, AppError>;

    /// Claim up to `limit` queued statements, oldest first (ties by id), and
    /// move them to EXTRACTING. A statement is never handed out twice.
    async fn claim_queued(&self, limit: usize) -> Result<Vec<Statement>, AppError>;

    async fn count_queued(&self) -> Result<i64, AppError>;

    async fn set_stage(&self, id: Uuid, stage: ProcessingStage) -> Result<(), AppError>;

    async fn complete_statement(&self, id: Uuid) -> Result<(), AppError>;

    async fn fail_statement(&self, id: Uuid, error: &str) -> Result<(), AppError>;

    /// Fail every statement left in an in-flight stage, returning how many
    /// were touched. Used at startup.
    async fn fail_interrupted(&self, reason: &str) -> Result<u64, AppError>;

    // Transactions

    /// Replace the statement's transactions with `transactions` and record
    /// the counts, all or nothing. Returns the persisted count.
    async fn replace_statement_transactions(
        &self,
        statement_id: Uuid,
        transactions: &[Transaction],
        record_count: i32,
    ) -> Result<i32, AppError>;

    async fn list_statement_transactions(
        &self,
        statement_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError>;

    /// Transactions of a profile dated on or after `since`, oldest first.
    async fn list_profile_transactions(
        &self,
        profile_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError>;

    // Merchant rules

    async fn insert_merchant_rule(&self, rule: &MerchantRule) -> Result<(), AppError>;

    async fn list_active_rules(&self, user_id: Uuid) -> Result<Vec<MerchantRule>, AppError>;

    // Recurring charges

    async fn list_recurring_charges(&self, profile_id: Uuid)
        -> Result<Vec<RecurringCharge>, AppError>;

    /// Insert or refresh the charge identified by (profile, merchant key).
    /// An existing charge keeps its id, name, category and flags.
    async fn upsert_recurring_charge(
        &self,
        user_id: Uuid,
        profile_id: Uuid,
        pattern: &DetectedPattern,
    ) -> Result<RecurringCharge, AppError>;

    // Financial metrics

    async fn upsert_financial_metrics(&self, metrics: &FinancialMetrics) -> Result<(), AppError>;

    async fn get_financial_metrics(
        &self,
        profile_id: Uuid,
    ) -> Result<Option<FinancialMetrics>, AppError>;
}
