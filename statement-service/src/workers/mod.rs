mod ingestion;
mod queue;

pub use ingestion::{IngestionConfig, IngestionError, IngestionJob, IngestionOutcome};
pub use queue::{QueueConfig, QueueManager, QueueStatus};
