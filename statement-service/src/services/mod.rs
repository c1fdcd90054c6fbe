pub mod cash_flow;
pub mod categorizer;
pub mod database;
pub mod extraction;
pub mod memory;
pub mod metrics;
pub mod normalizer;
pub mod recurring;
pub mod repository;
pub mod storage;

pub use categorizer::{CategoryMatch, CategoryStrategy, Categorizer};
pub use database::Database;
pub use extraction::{ExtractionError, ExtractionProvider};
pub use memory::InMemoryRepository;
pub use normalizer::{NormalizedBatch, NormalizedTransaction, Normalizer, RowError};
pub use recurring::{DetectedPattern, DetectionConfig, RecurringChargeDetector};
pub use repository::{LedgerRepository, RequeueOutcome};
pub use storage::{LocalStorage, Storage, StorageError};
