//! Bounded-concurrency statement queue.
//!
//! Queue state lives in the database (stage QUEUED). A single supervisor
//! task claims queued statements oldest first, runs at most
//! `max_concurrent` ingestion jobs at once, and exits once the database
//! reports nothing left to do. Database errors never end the supervisor.
//! Enqueueing starts a supervisor if none is running or wakes the existing
//! one.

use crate::services::metrics::{record_enqueue_failure, set_queue_active};
use crate::services::repository::{LedgerRepository, RequeueOutcome};
use crate::workers::ingestion::IngestionJob;
use futures::FutureExt;
use serde::Serialize;
use service_core::error::AppError;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    /// Fallback re-check of the queue while jobs are running.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub active: usize,
    pub max: usize,
}

struct QueueInner {
    repository: Arc<dyn LedgerRepository>,
    job: Arc<IngestionJob>,
    config: QueueConfig,
    running: AtomicBool,
    active: AtomicUsize,
    wake: Notify,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

impl QueueManager {
    pub fn new(
        repository: Arc<dyn LedgerRepository>,
        job: Arc<IngestionJob>,
        config: QueueConfig,
    ) -> Self {
        let config = QueueConfig {
            max_concurrent: config.max_concurrent.max(1),
            ..config
        };

        Self {
            inner: Arc::new(QueueInner {
                repository,
                job,
                config,
                running: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Mark a statement QUEUED and make sure a supervisor will pick it up.
    ///
    /// Never fails the caller: a database error is logged and counted, and
    /// the statement stays where it was.
    #[tracing::instrument(skip(self))]
    pub async fn enqueue(&self, statement_id: Uuid) {
        match self.inner.repository.mark_queued(statement_id).await {
            Ok(true) => {
                tracing::info!("Statement queued");
                self.inner.ensure_running();
            }
            Ok(false) => {
                tracing::warn!("Statement not eligible for queueing");
            }
            Err(e) => {
                record_enqueue_failure();
                tracing::error!(error = %e, "Failed to queue statement");
            }
        }
    }

    /// Clear a finished or failed statement's transactions and queue it
    /// again.
    #[tracing::instrument(skip(self))]
    pub async fn requeue(&self, statement_id: Uuid) -> Result<QueueStatus, AppError> {
        match self.inner.repository.reset_for_requeue(statement_id).await? {
            RequeueOutcome::Requeued {
                deleted_transactions,
            } => {
                tracing::info!(deleted_transactions, "Statement requeued");
                self.inner.ensure_running();
                Ok(self.status())
            }
            RequeueOutcome::NotFound => Err(AppError::NotFound(anyhow::anyhow!(
                "Statement {} not found",
                statement_id
            ))),
            RequeueOutcome::InFlight => Err(AppError::Conflict(anyhow::anyhow!(
                "Statement {} is being processed",
                statement_id
            ))),
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            active: self.inner.active.load(Ordering::SeqCst),
            max: self.inner.config.max_concurrent,
        }
    }

    /// Start a supervisor for statements left QUEUED, e.g. after a restart.
    pub fn resume(&self) {
        self.inner.ensure_running();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop claiming new work and wait for running jobs to finish, up to
    /// `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("Initiating statement queue shutdown");
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();

        let deadline = tokio::time::Instant::now() + grace;
        while self.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.is_running() {
            tracing::warn!(
                active = self.inner.active.load(Ordering::SeqCst),
                "Queue shutdown grace period elapsed with jobs still running"
            );
        }
    }
}

impl QueueInner {
    fn ensure_running(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.supervise().await });
        } else {
            self.wake.notify_one();
        }
    }

    async fn supervise(self: Arc<Self>) {
        tracing::debug!("Queue supervisor started");
        let mut jobs: JoinSet<Uuid> = JoinSet::new();

        loop {
            let mut claim_failed = false;
            if !self.shutdown.is_cancelled() {
                if let Err(e) = self.admit(&mut jobs).await {
                    tracing::error!(error = %e, "Failed to claim queued statements");
                    claim_failed = true;
                }
            }

            if jobs.is_empty() {
                if self.shutdown.is_cancelled() {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
                // Work may still be QUEUED; stay up and retry the claim.
                if claim_failed {
                    self.back_off().await;
                    continue;
                }

                self.running.store(false, Ordering::SeqCst);

                // An enqueue may have landed after the last claim but before
                // the flag was cleared; it saw the flag set and only notified.
                let queued = self.repository.count_queued().await;
                let pending = match &queued {
                    Ok(count) => *count > 0,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to check queue before going idle");
                        true
                    }
                };
                if !pending
                    || self
                        .running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    break;
                }
                if queued.is_err() {
                    self.back_off().await;
                }
                continue;
            }

            tokio::select! {
                Some(done) = jobs.join_next() => self.release(done),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown.cancelled(), if !self.shutdown.is_cancelled() => {}
            }
        }

        tracing::debug!("Queue supervisor idle, exiting");
    }

    /// Wait out a database error, returning early on shutdown.
    async fn back_off(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Claim as many statements as there are free slots and spawn a job for
    /// each.
    async fn admit(&self, jobs: &mut JoinSet<Uuid>) -> Result<(), AppError> {
        let free = self.config.max_concurrent.saturating_sub(jobs.len());
        if free == 0 {
            return Ok(());
        }

        let claimed = self.repository.claim_queued(free).await?;
        for statement in claimed {
            let id = statement.id;
            let job = self.job.clone();
            let repository = self.repository.clone();

            self.active.fetch_add(1, Ordering::SeqCst);
            set_queue_active(self.active.load(Ordering::SeqCst));
            tracing::info!(statement_id = %id, "Dispatching ingestion job");

            jobs.spawn(async move {
                let outcome = AssertUnwindSafe(job.process(statement))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    tracing::error!(statement_id = %id, "Ingestion job panicked");
                    if let Err(e) = repository
                        .fail_statement(id, "Ingestion job panicked")
                        .await
                    {
                        tracing::error!(statement_id = %id, error = %e, "Failed to record panic");
                    }
                }
                id
            });
        }
        Ok(())
    }

    fn release(&self, done: Result<Uuid, tokio::task::JoinError>) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        set_queue_active(remaining);
        match done {
            Ok(id) => tracing::debug!(statement_id = %id, active = remaining, "Slot released"),
            Err(e) => tracing::error!(error = %e, "Ingestion task aborted"),
        }
    }
}
