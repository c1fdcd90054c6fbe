//! Trailing-window cash-flow rollup for a profile.

use crate::models::{FinancialMetrics, Transaction, TransactionType};
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// First day of a `days`-long window ending on `window_end` (inclusive).
pub fn window_start(window_end: NaiveDate, days: i64) -> NaiveDate {
    window_end - Duration::days(days.max(1) - 1)
}

/// Sum income and expenses dated inside `[window_start, window_end]`.
/// Transfers move money between the user's own accounts and are skipped.
pub fn compute_metrics(
    user_id: Uuid,
    profile_id: Uuid,
    transactions: &[Transaction],
    window_end: NaiveDate,
    days: i64,
) -> FinancialMetrics {
    let start = window_start(window_end, days);
    let mut income = Decimal::ZERO;
    let mut expenses = Decimal::ZERO;
    let mut count = 0;

    for txn in transactions
        .iter()
        .filter(|t| t.profile_id == profile_id && t.date >= start && t.date <= window_end)
    {
        match txn.transaction_type {
            TransactionType::Income => income += txn.amount.abs(),
            TransactionType::Expense => expenses += txn.amount.abs(),
            TransactionType::Transfer => continue,
        }
        count += 1;
    }

    FinancialMetrics {
        profile_id,
        user_id,
        window_start: start,
        window_end,
        income,
        expenses,
        net_cash_flow: income - expenses,
        transaction_count: count,
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategorySource, TransactionSource};
    use std::str::FromStr;

    fn txn(profile_id: Uuid, date: NaiveDate, amount: &str, ty: TransactionType) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            profile_id,
            statement_id: None,
            date,
            amount: Decimal::from_str(amount).unwrap(),
            description: "X".to_string(),
            merchant: "X".to_string(),
            category: "Uncategorized".to_string(),
            transaction_type: ty,
            source: TransactionSource::StatementImport,
            categorized_by: CategorySource::Default,
            reference: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_window_bounds_inclusive() {
        let end = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        assert_eq!(window_start(end, 30), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(window_start(end, 1), end);
    }

    #[test]
    fn test_cash_flow_rollup() {
        let profile = Uuid::new_v4();
        let end = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let txns = vec![
            txn(profile, end, "2500.00", TransactionType::Income),
            txn(profile, end - Duration::days(3), "-15.49", TransactionType::Expense),
            txn(profile, end - Duration::days(29), "-100.00", TransactionType::Expense),
            txn(profile, end - Duration::days(30), "-999.00", TransactionType::Expense),
            txn(profile, end - Duration::days(1), "-500.00", TransactionType::Transfer),
            txn(Uuid::new_v4(), end, "-42.00", TransactionType::Expense),
        ];

        let m = compute_metrics(Uuid::nil(), profile, &txns, end, 30);
        assert_eq!(m.income, Decimal::from_str("2500.00").unwrap());
        assert_eq!(m.expenses, Decimal::from_str("115.49").unwrap());
        assert_eq!(m.net_cash_flow, Decimal::from_str("2384.51").unwrap());
        assert_eq!(m.transaction_count, 3);
    }
}
