//! Database service for statement-service.

use crate::models::{
    CategorySource, DocumentKind, FinancialMetrics, Frequency, MatchType, MerchantRule,
    ProcessingStage, ProfileType, RecurringCharge, Statement, StatementStatus, Transaction,
    TransactionSource, TransactionType,
};
use crate::services::metrics::QueryTimer;
use crate::services::recurring::DetectedPattern;
use crate::services::repository::{LedgerRepository, RequeueOutcome};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Postgres allows 65535 bind parameters per statement.
const INSERT_CHUNK: usize = 1000;

const STATEMENT_COLUMNS: &str = "id, user_id, profile_id, profile_type, document_kind, file_name, file_size, mime_type, storage_path, status, processing_stage, record_count, processed_count, error_message, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, profile_id, statement_id, date, amount, description, merchant, category, transaction_type, source, categorized_by, reference, created_at";

const RECURRING_COLUMNS: &str = "id, user_id, profile_id, merchant_key, name, amount, frequency, category, next_due_date, last_paid_date, occurrences, is_active, is_paused, created_at, updated_at";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn in_flight_stages() -> Vec<String> {
    ProcessingStage::IN_FLIGHT
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, FromRow)]
struct StatementRow {
    id: Uuid,
    user_id: Uuid,
    profile_id: Uuid,
    profile_type: String,
    document_kind: String,
    file_name: String,
    file_size: i64,
    mime_type: String,
    storage_path: String,
    status: String,
    processing_stage: String,
    record_count: Option<i32>,
    processed_count: Option<i32>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<StatementRow> for Statement {
    fn from(row: StatementRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            profile_id: row.profile_id,
            profile_type: ProfileType::from_str(&row.profile_type),
            document_kind: DocumentKind::from_str(&row.document_kind),
            file_name: row.file_name,
            file_size: row.file_size,
            mime_type: row.mime_type,
            storage_path: row.storage_path,
            status: StatementStatus::from_str(&row.status),
            processing_stage: ProcessingStage::from_str(&row.processing_stage),
            record_count: row.record_count,
            processed_count: row.processed_count,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    profile_id: Uuid,
    statement_id: Option<Uuid>,
    date: NaiveDate,
    amount: Decimal,
    description: String,
    merchant: String,
    category: String,
    transaction_type: String,
    source: String,
    categorized_by: String,
    reference: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            profile_id: row.profile_id,
            statement_id: row.statement_id,
            date: row.date,
            amount: row.amount,
            description: row.description,
            merchant: row.merchant,
            category: row.category,
            transaction_type: TransactionType::from_str(&row.transaction_type),
            source: TransactionSource::from_str(&row.source),
            categorized_by: CategorySource::from_str(&row.categorized_by),
            reference: row.reference,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MerchantRuleRow {
    id: Uuid,
    user_id: Uuid,
    profile_type: Option<String>,
    pattern: String,
    match_type: String,
    category: String,
    priority: i32,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<MerchantRuleRow> for MerchantRule {
    fn from(row: MerchantRuleRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            profile_type: row.profile_type.as_deref().map(ProfileType::from_str),
            pattern: row.pattern,
            match_type: MatchType::from_str(&row.match_type),
            category: row.category,
            priority: row.priority,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct RecurringChargeRow {
    id: Uuid,
    user_id: Uuid,
    profile_id: Uuid,
    merchant_key: String,
    name: String,
    amount: Decimal,
    frequency: String,
    category: Option<String>,
    next_due_date: NaiveDate,
    last_paid_date: NaiveDate,
    occurrences: i32,
    is_active: bool,
    is_paused: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecurringChargeRow> for RecurringCharge {
    fn from(row: RecurringChargeRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            profile_id: row.profile_id,
            merchant_key: row.merchant_key,
            name: row.name,
            amount: row.amount,
            frequency: Frequency::from_str(&row.frequency),
            category: row.category,
            next_due_date: row.next_due_date,
            last_paid_date: row.last_paid_date,
            occurrences: row.occurrences,
            is_active: row.is_active,
            is_paused: row.is_paused,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct FinancialMetricsRow {
    profile_id: Uuid,
    user_id: Uuid,
    window_start: NaiveDate,
    window_end: NaiveDate,
    income: Decimal,
    expenses: Decimal,
    net_cash_flow: Decimal,
    transaction_count: i32,
    updated_at: DateTime<Utc>,
}

impl From<FinancialMetricsRow> for FinancialMetrics {
    fn from(row: FinancialMetricsRow) -> Self {
        Self {
            profile_id: row.profile_id,
            user_id: row.user_id,
            window_start: row.window_start,
            window_end: row.window_end,
            income: row.income,
            expenses: row.expenses,
            net_cash_flow: row.net_cash_flow,
            transaction_count: row.transaction_count,
            updated_at: row.updated_at,
        }
    }
}

// ============================================================================
// Database
// ============================================================================

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "statement-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        stage: ProcessingStage,
        error_message: Option<&str>,
        operation: &'static str,
    ) -> Result<(), AppError> {
        let timer = QueryTimer::start(operation);

        let result = sqlx::query(
            r#"
            UPDATE statements
            SET status = $2, processing_stage = $3, error_message = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(stage.status().as_str())
        .bind(stage.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update statement stage", e))?;

        timer.observe();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Statement {} not found",
                id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = QueryTimer::start("health_check");

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe();
        Ok(())
    }

    // =========================================================================
    // Statement Operations
    // =========================================================================

    #[instrument(skip(self, statement), fields(statement_id = %statement.id))]
    async fn insert_statement(&self, statement: &Statement) -> Result<(), AppError> {
        let timer = QueryTimer::start("insert_statement");

        sqlx::query(
            r#"
            INSERT INTO statements (id, user_id, profile_id, profile_type, document_kind, file_name, file_size, mime_type, storage_path, status, processing_stage, record_count, processed_count, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(statement.id)
        .bind(statement.user_id)
        .bind(statement.profile_id)
        .bind(statement.profile_type.as_str())
        .bind(statement.document_kind.as_str())
        .bind(&statement.file_name)
        .bind(statement.file_size)
        .bind(&statement.mime_type)
        .bind(&statement.storage_path)
        .bind(statement.processing_stage.status().as_str())
        .bind(statement.processing_stage.as_str())
        .bind(statement.record_count)
        .bind(statement.processed_count)
        .bind(&statement.error_message)
        .bind(statement.created_at)
        .bind(statement.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert statement", e))?;

        timer.observe();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_statement(&self, id: Uuid) -> Result<Option<Statement>, AppError> {
        let timer = QueryTimer::start("get_statement");

        let row = sqlx::query_as::<_, StatementRow>(&format!(
            "SELECT {} FROM statements WHERE id = $1",
            STATEMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get statement", e))?;

        timer.observe();
        Ok(row.map(Statement::from))
    }

    #[instrument(skip(self))]
    async fn mark_queued(&self, id: Uuid) -> Result<bool, AppError> {
        let timer = QueryTimer::start("mark_queued");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let stage: Option<String> =
            sqlx::query_scalar("SELECT processing_stage FROM statements WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to lock statement", e))?;

        let stage = match stage.map(|s| ProcessingStage::from_str(&s)) {
            Some(stage) if stage.is_enqueueable() => stage,
            _ => return Ok(false),
        };

        // A failed run may have committed rows before failing
        let failed = stage == ProcessingStage::Failed;
        if failed {
            sqlx::query("DELETE FROM transactions WHERE statement_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to delete statement transactions", e))?;
        }

        sqlx::query(
            r#"
            UPDATE statements
            SET status = $2, processing_stage = $3, error_message = NULL, updated_at = NOW(),
                record_count = CASE WHEN $4 THEN NULL ELSE record_count END,
                processed_count = CASE WHEN $4 THEN NULL ELSE processed_count END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(StatementStatus::Pending.as_str())
        .bind(ProcessingStage::Queued.as_str())
        .bind(failed)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to queue statement", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit enqueue", e))?;

        timer.observe();
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn reset_for_requeue(&self, id: Uuid) -> Result<RequeueOutcome, AppError> {
        let timer = QueryTimer::start("reset_for_requeue");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let stage: Option<String> =
            sqlx::query_scalar("SELECT processing_stage FROM statements WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to lock statement", e))?;

        let Some(stage) = stage else {
            return Ok(RequeueOutcome::NotFound);
        };
        if ProcessingStage::from_str(&stage).is_in_flight() {
            return Ok(RequeueOutcome::InFlight);
        }

        let deleted = sqlx::query("DELETE FROM transactions WHERE statement_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete statement transactions", e))?
            .rows_affected();

        sqlx::query(
            r#"
            UPDATE statements
            SET status = $2, processing_stage = $3, record_count = NULL, processed_count = NULL, error_message = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(StatementStatus::Pending.as_str())
        .bind(ProcessingStage::Queued.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to reset statement", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit requeue", e))?;

        timer.observe();
        info!(statement_id = %id, deleted_transactions = deleted, "Statement reset for requeue");

        Ok(RequeueOutcome::Requeued {
            deleted_transactions: deleted,
        })
    }

    #[instrument(skip(self))]
    async fn claim_queued(&self, limit: usize) -> Result<Vec<Statement>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let timer = QueryTimer::start("claim_queued");

        let rows = sqlx::query_as::<_, StatementRow>(&format!(
            r#"
            UPDATE statements
            SET status = $2, processing_stage = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM statements
                WHERE processing_stage = 'QUEUED'
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            STATEMENT_COLUMNS
        ))
        .bind(limit as i64)
        .bind(StatementStatus::Processing.as_str())
        .bind(ProcessingStage::Extracting.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to claim queued statements", e))?;

        timer.observe();

        // RETURNING does not preserve the subquery order
        let mut claimed: Vec<Statement> = rows.into_iter().map(Statement::from).collect();
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn count_queued(&self) -> Result<i64, AppError> {
        let timer = QueryTimer::start("count_queued");

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM statements WHERE processing_stage = 'QUEUED'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("Failed to count queued statements", e))?;

        timer.observe();
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn set_stage(&self, id: Uuid, stage: ProcessingStage) -> Result<(), AppError> {
        self.transition(id, stage, None, "set_stage").await
    }

    #[instrument(skip(self))]
    async fn complete_statement(&self, id: Uuid) -> Result<(), AppError> {
        self.transition(id, ProcessingStage::Done, None, "complete_statement")
            .await
    }

    #[instrument(skip(self))]
    async fn fail_statement(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        self.transition(id, ProcessingStage::Failed, Some(error), "fail_statement")
            .await
    }

    #[instrument(skip(self))]
    async fn fail_interrupted(&self, reason: &str) -> Result<u64, AppError> {
        let timer = QueryTimer::start("fail_interrupted");

        let result = sqlx::query(
            r#"
            UPDATE statements
            SET status = $2, processing_stage = $3, error_message = $4, updated_at = NOW()
            WHERE processing_stage = ANY($1)
            "#,
        )
        .bind(in_flight_stages())
        .bind(StatementStatus::Failed.as_str())
        .bind(ProcessingStage::Failed.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fail interrupted statements", e))?;

        timer.observe();
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    #[instrument(skip(self, transactions), fields(count = transactions.len()))]
    async fn replace_statement_transactions(
        &self,
        statement_id: Uuid,
        transactions: &[Transaction],
        record_count: i32,
    ) -> Result<i32, AppError> {
        let timer = QueryTimer::start("replace_statement_transactions");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query("DELETE FROM transactions WHERE statement_id = $1")
            .bind(statement_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete prior transactions", e))?;

        let mut persisted: u64 = 0;
        for chunk in transactions.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO transactions ({}) ",
                TRANSACTION_COLUMNS
            ));
            builder.push_values(chunk, |mut b, txn| {
                b.push_bind(txn.id)
                    .push_bind(txn.user_id)
                    .push_bind(txn.profile_id)
                    .push_bind(txn.statement_id)
                    .push_bind(txn.date)
                    .push_bind(txn.amount)
                    .push_bind(&txn.description)
                    .push_bind(&txn.merchant)
                    .push_bind(&txn.category)
                    .push_bind(txn.transaction_type.as_str())
                    .push_bind(txn.source.as_str())
                    .push_bind(txn.categorized_by.as_str())
                    .push_bind(&txn.reference)
                    .push_bind(txn.created_at);
            });
            persisted += builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to insert transactions", e))?
                .rows_affected();
        }

        let updated = sqlx::query(
            r#"
            UPDATE statements
            SET record_count = $2, processed_count = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(statement_id)
        .bind(record_count)
        .bind(persisted as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to record statement counts", e))?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Statement {} not found",
                statement_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transactions", e))?;

        timer.observe();
        info!(statement_id = %statement_id, persisted = persisted, "Statement transactions replaced");

        Ok(persisted as i32)
    }

    async fn list_statement_transactions(
        &self,
        statement_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = QueryTimer::start("list_statement_transactions");

        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE statement_id = $1 ORDER BY date, created_at",
            TRANSACTION_COLUMNS
        ))
        .bind(statement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list statement transactions", e))?;

        timer.observe();
        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_profile_transactions(
        &self,
        profile_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = QueryTimer::start("list_profile_transactions");

        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE profile_id = $1 AND date >= $2 ORDER BY date, created_at",
            TRANSACTION_COLUMNS
        ))
        .bind(profile_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list profile transactions", e))?;

        timer.observe();
        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    // =========================================================================
    // Merchant Rule Operations
    // =========================================================================

    async fn insert_merchant_rule(&self, rule: &MerchantRule) -> Result<(), AppError> {
        let timer = QueryTimer::start("insert_merchant_rule");

        sqlx::query(
            r#"
            INSERT INTO merchant_rules (id, user_id, profile_type, pattern, match_type, category, priority, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(rule.id)
        .bind(rule.user_id)
        .bind(rule.profile_type.map(|p| p.as_str()))
        .bind(&rule.pattern)
        .bind(rule.match_type.as_str())
        .bind(&rule.category)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert merchant rule", e))?;

        timer.observe();
        Ok(())
    }

    async fn list_active_rules(&self, user_id: Uuid) -> Result<Vec<MerchantRule>, AppError> {
        let timer = QueryTimer::start("list_active_rules");

        let rows = sqlx::query_as::<_, MerchantRuleRow>(
            r#"
            SELECT id, user_id, profile_type, pattern, match_type, category, priority, is_active, created_at
            FROM merchant_rules
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY priority DESC, created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list merchant rules", e))?;

        timer.observe();
        Ok(rows.into_iter().map(MerchantRule::from).collect())
    }

    // =========================================================================
    // Recurring Charge Operations
    // =========================================================================

    async fn list_recurring_charges(
        &self,
        profile_id: Uuid,
    ) -> Result<Vec<RecurringCharge>, AppError> {
        let timer = QueryTimer::start("list_recurring_charges");

        let rows = sqlx::query_as::<_, RecurringChargeRow>(&format!(
            "SELECT {} FROM recurring_charges WHERE profile_id = $1 ORDER BY merchant_key",
            RECURRING_COLUMNS
        ))
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list recurring charges", e))?;

        timer.observe();
        Ok(rows.into_iter().map(RecurringCharge::from).collect())
    }

    #[instrument(skip(self, pattern), fields(merchant_key = %pattern.merchant_key))]
    async fn upsert_recurring_charge(
        &self,
        user_id: Uuid,
        profile_id: Uuid,
        pattern: &DetectedPattern,
    ) -> Result<RecurringCharge, AppError> {
        let timer = QueryTimer::start("upsert_recurring_charge");

        let row = sqlx::query_as::<_, RecurringChargeRow>(&format!(
            r#"
            INSERT INTO recurring_charges (id, user_id, profile_id, merchant_key, name, amount, frequency, category, next_due_date, last_paid_date, occurrences, is_active, is_paused, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, TRUE, FALSE, NOW(), NOW())
            ON CONFLICT (profile_id, merchant_key) DO UPDATE
            SET amount = EXCLUDED.amount,
                frequency = EXCLUDED.frequency,
                next_due_date = EXCLUDED.next_due_date,
                last_paid_date = EXCLUDED.last_paid_date,
                occurrences = EXCLUDED.occurrences,
                updated_at = NOW()
            RETURNING {}
            "#,
            RECURRING_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(profile_id)
        .bind(&pattern.merchant_key)
        .bind(&pattern.name)
        .bind(pattern.amount)
        .bind(pattern.frequency.as_str())
        .bind(&pattern.category)
        .bind(pattern.next_due_date)
        .bind(pattern.last_paid_date)
        .bind(pattern.occurrences)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert recurring charge", e))?;

        timer.observe();
        Ok(row.into())
    }

    // =========================================================================
    // Financial Metrics Operations
    // =========================================================================

    #[instrument(skip(self, metrics), fields(profile_id = %metrics.profile_id))]
    async fn upsert_financial_metrics(&self, metrics: &FinancialMetrics) -> Result<(), AppError> {
        let timer = QueryTimer::start("upsert_financial_metrics");

        sqlx::query(
            r#"
            INSERT INTO financial_metrics (profile_id, user_id, window_start, window_end, income, expenses, net_cash_flow, transaction_count, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (profile_id) DO UPDATE
            SET window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                income = EXCLUDED.income,
                expenses = EXCLUDED.expenses,
                net_cash_flow = EXCLUDED.net_cash_flow,
                transaction_count = EXCLUDED.transaction_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(metrics.profile_id)
        .bind(metrics.user_id)
        .bind(metrics.window_start)
        .bind(metrics.window_end)
        .bind(metrics.income)
        .bind(metrics.expenses)
        .bind(metrics.net_cash_flow)
        .bind(metrics.transaction_count)
        .bind(metrics.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert financial metrics", e))?;

        timer.observe();
        Ok(())
    }

    async fn get_financial_metrics(
        &self,
        profile_id: Uuid,
    ) -> Result<Option<FinancialMetrics>, AppError> {
        let timer = QueryTimer::start("get_financial_metrics");

        let row = sqlx::query_as::<_, FinancialMetricsRow>(
            r#"
            SELECT profile_id, user_id, window_start, window_end, income, expenses, net_cash_flow, transaction_count, updated_at
            FROM financial_metrics
            WHERE profile_id = $1
            "#,
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get financial metrics", e))?;

        timer.observe();
        Ok(row.map(FinancialMetrics::from))
    }
}
