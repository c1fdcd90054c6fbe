//! Recurring charge detection over a profile's expense history.

use crate::models::{Frequency, Transaction, TransactionType};
use crate::services::normalizer::merchant_key;
use crate::services::repository::LedgerRepository;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Allowed deviation within an amount cluster, as a ratio of its
    /// smallest charge.
    pub amount_tolerance_ratio: Decimal,
    /// Floor for the amount deviation, so small charges can vary by cents.
    pub min_amount_tolerance: Decimal,
    pub min_occurrences: usize,
    pub lookback_days: i64,
    /// Share of intervals that must fit the cadence, counting skipped
    /// periods.
    pub min_interval_match_ratio: f64,
    /// Longest run of missed periods an interval may span and still fit.
    pub max_skipped_periods: i64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_ratio: Decimal::new(5, 2),
            min_amount_tolerance: Decimal::new(50, 2),
            min_occurrences: 2,
            lookback_days: 730,
            min_interval_match_ratio: 0.7,
            max_skipped_periods: 2,
        }
    }
}

impl DetectionConfig {
    fn amount_tolerance(&self, amount: Decimal) -> Decimal {
        (amount * self.amount_tolerance_ratio).max(self.min_amount_tolerance)
    }
}

/// A merchant whose charges repeat at a stable amount and cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPattern {
    pub merchant_key: String,
    /// Merchant name of the most recent charge.
    pub name: String,
    /// Most recent charge amount, as a positive magnitude.
    pub amount: Decimal,
    pub frequency: Frequency,
    pub last_paid_date: NaiveDate,
    pub next_due_date: NaiveDate,
    pub occurrences: i32,
    /// Category of the most recent charge.
    pub category: Option<String>,
}

/// Split one merchant's charges into runs of similar amounts. Each cluster
/// is anchored on its smallest charge and returned in date order.
fn amount_clusters<'a>(
    txns: &[&'a Transaction],
    config: &DetectionConfig,
) -> Vec<Vec<&'a Transaction>> {
    let mut by_amount = txns.to_vec();
    by_amount.sort_by(|a, b| a.amount.abs().cmp(&b.amount.abs()));

    let mut clusters: Vec<(Decimal, Vec<&Transaction>)> = Vec::new();
    for txn in by_amount {
        let amount = txn.amount.abs();
        let joins = clusters
            .last()
            .is_some_and(|(anchor, _)| amount - *anchor <= config.amount_tolerance(*anchor));
        match clusters.last_mut() {
            Some((_, members)) if joins => members.push(txn),
            _ => clusters.push((amount, vec![txn])),
        }
    }

    clusters
        .into_iter()
        .map(|(_, mut members)| {
            members.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.created_at.cmp(&b.created_at)));
            members
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct CadenceFit {
    frequency: Frequency,
    exact: usize,
    consistent: usize,
}

/// Pick the frequency that explains the intervals best. An interval spanning
/// a few missed periods counts as consistent but not exact; at least one
/// interval must match the period itself.
fn fit_cadence(intervals: &[i64], config: &DetectionConfig) -> Option<Frequency> {
    if intervals.is_empty() {
        return None;
    }

    let mut best: Option<CadenceFit> = None;
    for frequency in Frequency::ALL {
        let exact = intervals
            .iter()
            .filter(|days| frequency.matches_interval(**days))
            .count();
        let consistent = intervals
            .iter()
            .filter(|days| {
                (1..=config.max_skipped_periods + 1).any(|periods| {
                    let expected = frequency.period_days() * periods;
                    (**days - expected).abs() <= frequency.tolerance_days() * periods
                })
            })
            .count();

        let ratio = consistent as f64 / intervals.len() as f64;
        if exact == 0 || ratio < config.min_interval_match_ratio {
            continue;
        }
        let fit = CadenceFit {
            frequency,
            exact,
            consistent,
        };
        // Frequency::ALL runs shortest first, so ties keep the shorter period
        best = match best {
            Some(b) if (b.exact, b.consistent) >= (fit.exact, fit.consistent) => Some(b),
            _ => Some(fit),
        };
    }
    best.map(|fit| fit.frequency)
}

fn detect_cluster(
    key: &str,
    txns: &[&Transaction],
    config: &DetectionConfig,
) -> Option<DetectedPattern> {
    if txns.len() < config.min_occurrences.max(2) {
        return None;
    }

    let intervals: Vec<i64> = txns
        .windows(2)
        .map(|w| (w[1].date - w[0].date).num_days())
        .collect();
    let frequency = fit_cadence(&intervals, config)?;

    let latest = txns.last()?;
    Some(DetectedPattern {
        merchant_key: key.to_string(),
        name: latest.merchant.clone(),
        amount: latest.amount.abs(),
        frequency,
        last_paid_date: latest.date,
        next_due_date: frequency.next_after(latest.date),
        occurrences: txns.len() as i32,
        category: Some(latest.category.clone()),
    })
}

/// Group expenses by merchant key, split each group into amount clusters and
/// keep the clusters whose cadence is consistent enough to call recurring.
/// A merchant yields at most one pattern: the cluster with the most
/// occurrences, then the most recent charge.
pub fn detect_patterns(transactions: &[Transaction], config: &DetectionConfig) -> Vec<DetectedPattern> {
    let mut groups: HashMap<String, Vec<&Transaction>> = HashMap::new();
    for txn in transactions
        .iter()
        .filter(|t| t.transaction_type == TransactionType::Expense)
    {
        let key = merchant_key(&txn.merchant);
        if !key.is_empty() {
            groups.entry(key).or_default().push(txn);
        }
    }

    let mut patterns: Vec<DetectedPattern> = groups
        .into_iter()
        .filter_map(|(key, txns)| {
            amount_clusters(&txns, config)
                .iter()
                .filter_map(|cluster| detect_cluster(&key, cluster, config))
                .max_by(|a, b| {
                    a.occurrences
                        .cmp(&b.occurrences)
                        .then_with(|| a.last_paid_date.cmp(&b.last_paid_date))
                })
        })
        .collect();

    patterns.sort_by(|a, b| a.merchant_key.cmp(&b.merchant_key));
    patterns
}

/// Runs detection for a profile and upserts the results.
pub struct RecurringChargeDetector {
    repository: Arc<dyn LedgerRepository>,
    config: DetectionConfig,
}

impl RecurringChargeDetector {
    pub fn new(repository: Arc<dyn LedgerRepository>, config: DetectionConfig) -> Self {
        Self { repository, config }
    }

    /// Detect and upsert patterns, returning how many were found.
    #[tracing::instrument(skip(self))]
    pub async fn run(
        &self,
        user_id: Uuid,
        profile_id: Uuid,
        today: NaiveDate,
    ) -> Result<usize, AppError> {
        let since = today - Duration::days(self.config.lookback_days);
        let history = self
            .repository
            .list_profile_transactions(profile_id, since)
            .await?;

        let patterns = detect_patterns(&history, &self.config);
        for pattern in &patterns {
            self.repository
                .upsert_recurring_charge(user_id, profile_id, pattern)
                .await?;
        }

        tracing::debug!(
            scanned = history.len(),
            detected = patterns.len(),
            "Recurring charge detection complete"
        );

        Ok(patterns.len())
    }
}
