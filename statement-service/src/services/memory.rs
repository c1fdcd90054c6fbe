//! In-process ledger repository.
//!
//! Mirrors the Postgres semantics closely enough to drive the queue and the
//! ingestion job in tests, and records stage transitions for assertions.

use crate::models::{
    FinancialMetrics, MerchantRule, ProcessingStage, RecurringCharge, Statement, Transaction,
};
use crate::services::recurring::DetectedPattern;
use crate::services::repository::{LedgerRepository, RequeueOutcome};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    statements: HashMap<Uuid, Statement>,
    transactions: Vec<Transaction>,
    rules: Vec<MerchantRule>,
    recurring: Vec<RecurringCharge>,
    metrics: HashMap<Uuid, FinancialMetrics>,
    stage_history: Vec<(Uuid, ProcessingStage)>,
    max_in_flight: usize,
}

impl State {
    fn transition(&mut self, id: Uuid, stage: ProcessingStage) -> Result<&mut Statement, AppError> {
        let statement = self
            .statements
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Statement {} not found", id)))?;
        statement.processing_stage = stage;
        statement.status = stage.status();
        statement.updated_at = Utc::now();
        self.stage_history.push((id, stage));

        let in_flight = self
            .statements
            .values()
            .filter(|s| s.processing_stage.is_in_flight())
            .count();
        self.max_in_flight = self.max_in_flight.max(in_flight);

        self.statements
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Statement {} not found", id)))
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
    /// When set, transaction replacement fails after staging this many rows.
    fail_persist_after: Mutex<Option<usize>>,
    unavailable: Mutex<bool>,
    fail_metrics: Mutex<bool>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), AppError> {
        if *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "database unavailable"
            )));
        }
        Ok(())
    }

    /// Make the next transaction replacements fail mid-batch.
    pub fn fail_persistence_after(&self, rows: Option<usize>) {
        *self.fail_persist_after.lock().unwrap_or_else(|e| e.into_inner()) = rows;
    }

    /// Make every call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = unavailable;
    }

    /// Make financial metrics upserts fail.
    pub fn fail_metrics_upsert(&self, fail: bool) {
        *self.fail_metrics.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Stages a statement passed through, in order.
    pub fn stage_history(&self, id: Uuid) -> Vec<ProcessingStage> {
        self.state()
            .stage_history
            .iter()
            .filter(|(sid, _)| *sid == id)
            .map(|(_, stage)| *stage)
            .collect()
    }

    /// Most statements ever observed in an in-flight stage at once.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn transaction_count(&self) -> usize {
        self.state().transactions.len()
    }

    pub fn insert_transaction(&self, txn: Transaction) {
        self.state().transactions.push(txn);
    }
}

#[async_trait]
impl LedgerRepository for InMemoryRepository {
    async fn health_check(&self) -> Result<(), AppError> {
        self.check_available()
    }

    async fn insert_statement(&self, statement: &Statement) -> Result<(), AppError> {
        self.check_available()?;
        self.state()
            .statements
            .insert(statement.id, statement.clone());
        Ok(())
    }

    async fn get_statement(&self, id: Uuid) -> Result<Option<Statement>, AppError> {
        self.check_available()?;
        Ok(self.state().statements.get(&id).cloned())
    }

    async fn mark_queued(&self, id: Uuid) -> Result<bool, AppError> {
        self.check_available()?;
        let mut state = self.state();
        let stage = match state.statements.get(&id) {
            Some(s) if s.processing_stage.is_enqueueable() => s.processing_stage,
            _ => return Ok(false),
        };

        // A failed run may have committed rows before failing
        if stage == ProcessingStage::Failed {
            state.transactions.retain(|t| t.statement_id != Some(id));
        }
        let statement = state.transition(id, ProcessingStage::Queued)?;
        if stage == ProcessingStage::Failed {
            statement.record_count = None;
            statement.processed_count = None;
        }
        statement.error_message = None;
        Ok(true)
    }

    async fn reset_for_requeue(&self, id: Uuid) -> Result<RequeueOutcome, AppError> {
        self.check_available()?;
        let mut state = self.state();
        match state.statements.get(&id) {
            None => return Ok(RequeueOutcome::NotFound),
            Some(s) if s.processing_stage.is_in_flight() => return Ok(RequeueOutcome::InFlight),
            Some(_) => {}
        }

        let before = state.transactions.len();
        state.transactions.retain(|t| t.statement_id != Some(id));
        let deleted = (before - state.transactions.len()) as u64;

        let statement = state.transition(id, ProcessingStage::Queued)?;
        statement.record_count = None;
        statement.processed_count = None;
        statement.error_message = None;

        Ok(RequeueOutcome::Requeued {
            deleted_transactions: deleted,
        })
    }

    async fn claim_queued(&self, limit: usize) -> Result<Vec<Statement>, AppError> {
        self.check_available()?;
        let mut state = self.state();
        let mut queued: Vec<(chrono::DateTime<Utc>, Uuid)> = state
            .statements
            .values()
            .filter(|s| s.processing_stage == ProcessingStage::Queued)
            .map(|s| (s.created_at, s.id))
            .collect();
        queued.sort();
        queued.truncate(limit);

        let mut claimed = Vec::with_capacity(queued.len());
        for (_, id) in queued {
            let statement = state.transition(id, ProcessingStage::Extracting)?;
            claimed.push(statement.clone());
        }
        Ok(claimed)
    }

    async fn count_queued(&self) -> Result<i64, AppError> {
        self.check_available()?;
        Ok(self
            .state()
            .statements
            .values()
            .filter(|s| s.processing_stage == ProcessingStage::Queued)
            .count() as i64)
    }

    async fn set_stage(&self, id: Uuid, stage: ProcessingStage) -> Result<(), AppError> {
        self.check_available()?;
        self.state().transition(id, stage)?;
        Ok(())
    }

    async fn complete_statement(&self, id: Uuid) -> Result<(), AppError> {
        self.check_available()?;
        let mut state = self.state();
        let statement = state.transition(id, ProcessingStage::Done)?;
        statement.error_message = None;
        Ok(())
    }

    async fn fail_statement(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        self.check_available()?;
        let mut state = self.state();
        let statement = state.transition(id, ProcessingStage::Failed)?;
        statement.error_message = Some(error.to_string());
        Ok(())
    }

    async fn fail_interrupted(&self, reason: &str) -> Result<u64, AppError> {
        self.check_available()?;
        let mut state = self.state();
        let stuck: Vec<Uuid> = state
            .statements
            .values()
            .filter(|s| s.processing_stage.is_in_flight())
            .map(|s| s.id)
            .collect();
        for id in &stuck {
            let statement = state.transition(*id, ProcessingStage::Failed)?;
            statement.error_message = Some(reason.to_string());
        }
        Ok(stuck.len() as u64)
    }

    async fn replace_statement_transactions(
        &self,
        statement_id: Uuid,
        transactions: &[Transaction],
        record_count: i32,
    ) -> Result<i32, AppError> {
        self.check_available()?;
        let fail_after = *self.fail_persist_after.lock().unwrap_or_else(|e| e.into_inner());

        // Stage everything first so a failure leaves the ledger untouched
        let mut staged = Vec::with_capacity(transactions.len());
        for txn in transactions {
            if fail_after.is_some_and(|n| staged.len() >= n) {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "insert failed after {} rows",
                    staged.len()
                )));
            }
            staged.push(txn.clone());
        }

        let mut state = self.state();
        let statement = state.statements.get_mut(&statement_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Statement {} not found", statement_id))
        })?;
        let persisted = staged.len() as i32;
        statement.record_count = Some(record_count);
        statement.processed_count = Some(persisted);
        statement.updated_at = Utc::now();

        state
            .transactions
            .retain(|t| t.statement_id != Some(statement_id));
        state.transactions.extend(staged);
        Ok(persisted)
    }

    async fn list_statement_transactions(
        &self,
        statement_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        self.check_available()?;
        let mut txns: Vec<Transaction> = self
            .state()
            .transactions
            .iter()
            .filter(|t| t.statement_id == Some(statement_id))
            .cloned()
            .collect();
        txns.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(txns)
    }

    async fn list_profile_transactions(
        &self,
        profile_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError> {
        self.check_available()?;
        let mut txns: Vec<Transaction> = self
            .state()
            .transactions
            .iter()
            .filter(|t| t.profile_id == profile_id && t.date >= since)
            .cloned()
            .collect();
        txns.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(txns)
    }

    async fn insert_merchant_rule(&self, rule: &MerchantRule) -> Result<(), AppError> {
        self.check_available()?;
        self.state().rules.push(rule.clone());
        Ok(())
    }

    async fn list_active_rules(&self, user_id: Uuid) -> Result<Vec<MerchantRule>, AppError> {
        self.check_available()?;
        Ok(self
            .state()
            .rules
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn list_recurring_charges(
        &self,
        profile_id: Uuid,
    ) -> Result<Vec<RecurringCharge>, AppError> {
        self.check_available()?;
        Ok(self
            .state()
            .recurring
            .iter()
            .filter(|c| c.profile_id == profile_id)
            .cloned()
            .collect())
    }

    async fn upsert_recurring_charge(
        &self,
        user_id: Uuid,
        profile_id: Uuid,
        pattern: &DetectedPattern,
    ) -> Result<RecurringCharge, AppError> {
        self.check_available()?;
        let mut state = self.state();
        let now = Utc::now();

        if let Some(existing) = state
            .recurring
            .iter_mut()
            .find(|c| c.profile_id == profile_id && c.merchant_key == pattern.merchant_key)
        {
            existing.amount = pattern.amount;
            existing.frequency = pattern.frequency;
            existing.last_paid_date = pattern.last_paid_date;
            existing.next_due_date = pattern.next_due_date;
            existing.occurrences = pattern.occurrences;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let charge = RecurringCharge {
            id: Uuid::new_v4(),
            user_id,
            profile_id,
            merchant_key: pattern.merchant_key.clone(),
            name: pattern.name.clone(),
            amount: pattern.amount,
            frequency: pattern.frequency,
            category: pattern.category.clone(),
            next_due_date: pattern.next_due_date,
            last_paid_date: pattern.last_paid_date,
            occurrences: pattern.occurrences,
            is_active: true,
            is_paused: false,
            created_at: now,
            updated_at: now,
        };
        state.recurring.push(charge.clone());
        Ok(charge)
    }

    async fn upsert_financial_metrics(&self, metrics: &FinancialMetrics) -> Result<(), AppError> {
        self.check_available()?;
        if *self.fail_metrics.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "financial metrics upsert failed"
            )));
        }
        self.state()
            .metrics
            .insert(metrics.profile_id, metrics.clone());
        Ok(())
    }

    async fn get_financial_metrics(
        &self,
        profile_id: Uuid,
    ) -> Result<Option<FinancialMetrics>, AppError> {
        self.check_available()?;
        Ok(self.state().metrics.get(&profile_id).cloned())
    }
}
