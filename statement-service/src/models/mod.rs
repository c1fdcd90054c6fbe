//! Domain models for statement-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Statement Models
// ============================================================================

/// Coarse lifecycle of a statement, as displayed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StatementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PENDING" => Self::Pending,
            "PROCESSING" => Self::Processing,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Fine-grained step of the ingestion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStage {
    Uploaded,
    Queued,
    Extracting,
    Normalizing,
    Categorizing,
    Persisting,
    Done,
    Failed,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "UPLOADED",
            Self::Queued => "QUEUED",
            Self::Extracting => "EXTRACTING",
            Self::Normalizing => "NORMALIZING",
            Self::Categorizing => "CATEGORIZING",
            Self::Persisting => "PERSISTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "UPLOADED" => Self::Uploaded,
            "QUEUED" => Self::Queued,
            "EXTRACTING" => Self::Extracting,
            "NORMALIZING" => Self::Normalizing,
            "CATEGORIZING" => Self::Categorizing,
            "PERSISTING" => Self::Persisting,
            "DONE" => Self::Done,
            "FAILED" => Self::Failed,
            _ => Self::Uploaded,
        }
    }

    /// The coarse status that always accompanies this stage.
    pub fn status(&self) -> StatementStatus {
        match self {
            Self::Uploaded | Self::Queued => StatementStatus::Pending,
            Self::Extracting | Self::Normalizing | Self::Categorizing | Self::Persisting => {
                StatementStatus::Processing
            }
            Self::Done => StatementStatus::Completed,
            Self::Failed => StatementStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Stages a plain enqueue accepts. DONE needs an explicit requeue.
    pub fn is_enqueueable(&self) -> bool {
        matches!(self, Self::Uploaded | Self::Queued | Self::Failed)
    }

    /// Stages during which an ingestion job owns the statement.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status(), StatementStatus::Processing)
    }

    pub const IN_FLIGHT: [ProcessingStage; 4] = [
        Self::Extracting,
        Self::Normalizing,
        Self::Categorizing,
        Self::Persisting,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileType {
    Personal,
    Business,
}

impl ProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "PERSONAL",
            Self::Business => "BUSINESS",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "BUSINESS" => Self::Business,
            _ => Self::Personal,
        }
    }
}

/// What kind of document was uploaded. Receipts enable the keyword
/// categorization fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    BankStatement,
    CreditCardStatement,
    Receipt,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BankStatement => "BANK_STATEMENT",
            Self::CreditCardStatement => "CREDIT_CARD_STATEMENT",
            Self::Receipt => "RECEIPT",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "CREDIT_CARD_STATEMENT" => Self::CreditCardStatement,
            "RECEIPT" => Self::Receipt,
            _ => Self::BankStatement,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    pub profile_type: ProfileType,
    pub document_kind: DocumentKind,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub storage_path: String,
    pub status: StatementStatus,
    pub processing_stage: ProcessingStage,
    pub record_count: Option<i32>,
    pub processed_count: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Statement {
    pub fn new(
        user_id: Uuid,
        profile_id: Uuid,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        file_size: i64,
        storage_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            profile_id,
            profile_type: ProfileType::Personal,
            document_kind: DocumentKind::BankStatement,
            file_name: file_name.into(),
            file_size,
            mime_type: mime_type.into(),
            storage_path: storage_path.into(),
            status: StatementStatus::Pending,
            processing_stage: ProcessingStage::Uploaded,
            record_count: None,
            processed_count: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_profile_type(mut self, profile_type: ProfileType) -> Self {
        self.profile_type = profile_type;
        self
    }

    pub fn with_document_kind(mut self, document_kind: DocumentKind) -> Self {
        self.document_kind = document_kind;
        self
    }
}

// ============================================================================
// Transaction Models
// ============================================================================

/// One raw row as returned by the extraction provider. Every field is kept
/// as text; validation happens during normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTransaction {
    pub date: String,
    pub description: String,
    pub amount: String,
    pub type_hint: Option<String>,
    pub reference: Option<String>,
    pub raw_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Income,
    Expense,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "INCOME",
            Self::Expense => "EXPENSE",
            Self::Transfer => "TRANSFER",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "INCOME" => Self::Income,
            "TRANSFER" => Self::Transfer,
            _ => Self::Expense,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionSource {
    StatementImport,
    Manual,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatementImport => "STATEMENT_IMPORT",
            Self::Manual => "MANUAL",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "MANUAL" => Self::Manual,
            _ => Self::StatementImport,
        }
    }
}

/// Which categorization strategy produced a transaction's category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CategorySource {
    Rule,
    Recurring,
    Keyword,
    Default,
}

impl CategorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "RULE",
            Self::Recurring => "RECURRING",
            Self::Keyword => "KEYWORD",
            Self::Default => "DEFAULT",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "RULE" => Self::Rule,
            "RECURRING" => Self::Recurring,
            "KEYWORD" => Self::Keyword,
            _ => Self::Default,
        }
    }
}

/// Canonical ledger entry. Income is positive, expenses negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    pub statement_id: Option<Uuid>,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub merchant: String,
    pub category: String,
    pub transaction_type: TransactionType,
    pub source: TransactionSource,
    pub categorized_by: CategorySource,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Merchant Rule Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Contains,
    StartsWith,
    Exact,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "CONTAINS",
            Self::StartsWith => "STARTS_WITH",
            Self::Exact => "EXACT",
            Self::Regex => "REGEX",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "STARTS_WITH" => Self::StartsWith,
            "EXACT" => Self::Exact,
            "REGEX" => Self::Regex,
            _ => Self::Contains,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantRule {
    pub id: Uuid,
    pub user_id: Uuid,
    /// `None` applies the rule to every profile of the user.
    pub profile_type: Option<ProfileType>,
    pub pattern: String,
    pub match_type: MatchType,
    pub category: String,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl MerchantRule {
    pub fn new(
        user_id: Uuid,
        pattern: impl Into<String>,
        category: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            profile_type: None,
            pattern: pattern.into(),
            match_type: MatchType::Contains,
            category: category.into(),
            priority,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Recurring Charge Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Bimonthly,
    Quarterly,
    Semiannually,
    Annually,
}

impl Frequency {
    pub const ALL: [Frequency; 8] = [
        Self::Daily,
        Self::Weekly,
        Self::Biweekly,
        Self::Monthly,
        Self::Bimonthly,
        Self::Quarterly,
        Self::Semiannually,
        Self::Annually,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Biweekly => "BIWEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Bimonthly => "BIMONTHLY",
            Self::Quarterly => "QUARTERLY",
            Self::Semiannually => "SEMIANNUALLY",
            Self::Annually => "ANNUALLY",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "DAILY" => Self::Daily,
            "WEEKLY" => Self::Weekly,
            "BIWEEKLY" => Self::Biweekly,
            "BIMONTHLY" => Self::Bimonthly,
            "QUARTERLY" => Self::Quarterly,
            "SEMIANNUALLY" => Self::Semiannually,
            "ANNUALLY" => Self::Annually,
            _ => Self::Monthly,
        }
    }

    /// Nominal period length in days.
    pub fn period_days(&self) -> i64 {
        match self {
            Self::Daily => 1,
            Self::Weekly => 7,
            Self::Biweekly => 14,
            Self::Monthly => 30,
            Self::Bimonthly => 60,
            Self::Quarterly => 90,
            Self::Semiannually => 182,
            Self::Annually => 365,
        }
    }

    /// Allowed deviation of an observed interval from the period.
    pub fn tolerance_days(&self) -> i64 {
        match self {
            Self::Daily => 0,
            Self::Weekly => 1,
            Self::Biweekly => 2,
            Self::Monthly => 3,
            Self::Bimonthly => 5,
            Self::Quarterly => 7,
            Self::Semiannually => 10,
            Self::Annually => 15,
        }
    }

    pub fn matches_interval(&self, days: i64) -> bool {
        (days - self.period_days()).abs() <= self.tolerance_days()
    }

    pub fn next_after(&self, date: NaiveDate) -> NaiveDate {
        date + Duration::days(self.period_days())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringCharge {
    pub id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    pub merchant_key: String,
    pub name: String,
    pub amount: Decimal,
    pub frequency: Frequency,
    pub category: Option<String>,
    pub next_due_date: NaiveDate,
    pub last_paid_date: NaiveDate,
    pub occurrences: i32,
    pub is_active: bool,
    pub is_paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Financial Metrics Models
// ============================================================================

/// Per-profile cash-flow rollup over a trailing window. Derived data, so
/// concurrent recomputations simply overwrite each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialMetrics {
    pub profile_id: Uuid,
    pub user_id: Uuid,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub income: Decimal,
    pub expenses: Decimal,
    pub net_cash_flow: Decimal,
    pub transaction_count: i32,
    pub updated_at: DateTime<Utc>,
}
