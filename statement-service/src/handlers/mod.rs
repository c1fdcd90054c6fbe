pub mod health;
pub mod queue;

pub use health::{health_check, metrics_endpoint, readiness_check};
pub use queue::{enqueue_statement, queue_status, requeue_statement};
