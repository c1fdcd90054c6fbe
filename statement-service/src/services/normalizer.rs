//! Candidate row normalization.
//!
//! Turns raw extraction rows into canonical, typed, deduplicated
//! transactions. Rows that fail validation are dropped and counted; they
//! never fail the batch on their own.

use crate::models::{CandidateTransaction, TransactionType};
use chrono::{DateTime, Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

/// Leading tokens that card networks and banks prepend to merchant names.
const NOISE_PREFIXES: &[&str] = &[
    "POS",
    "ACH",
    "DEBIT",
    "CHECKCARD",
    "PURCHASE",
    "RECURRING",
    "CARD",
    "VISA",
];

const TEXT_DATE_FORMATS: &[&str] = &[
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%d-%b-%Y",
];

static REFERENCE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9\-]*\d[A-Z0-9\-]*$").expect("valid reference regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("unparseable date '{0}'")]
    InvalidDate(String),

    #[error("non-numeric amount '{0}'")]
    InvalidAmount(String),

    #[error("zero amount")]
    ZeroAmount,

    #[error("empty description")]
    EmptyDescription,
}

/// A validated row, ready for categorization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTransaction {
    pub date: NaiveDate,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub description: String,
    pub merchant: String,
    pub merchant_key: String,
    pub reference: Option<String>,
}

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub transactions: Vec<NormalizedTransaction>,
    /// Candidates received from extraction.
    pub record_count: usize,
    pub dropped_invalid: usize,
    pub dropped_duplicates: usize,
    /// `(row index, reason)` for every invalid row.
    pub errors: Vec<(usize, RowError)>,
}

impl NormalizedBatch {
    /// True when rows were extracted but every one failed validation.
    pub fn nothing_parseable(&self) -> bool {
        self.record_count > 0 && self.dropped_invalid == self.record_count
    }
}

pub struct Normalizer {
    reference_date: NaiveDate,
}

impl Normalizer {
    /// `reference_date` resolves year-less dates (`MM/DD`) to the most recent
    /// occurrence not after it; the statement's upload date is used.
    pub fn new(reference_date: NaiveDate) -> Self {
        Self { reference_date }
    }

    pub fn normalize(&self, candidates: &[CandidateTransaction]) -> NormalizedBatch {
        let mut batch = NormalizedBatch {
            record_count: candidates.len(),
            ..Default::default()
        };
        let mut seen: HashSet<(NaiveDate, Decimal, String)> = HashSet::new();

        for (index, candidate) in candidates.iter().enumerate() {
            match self.normalize_row(candidate) {
                Ok(txn) => {
                    let key = (txn.date, txn.amount, txn.description.clone());
                    if seen.insert(key) {
                        batch.transactions.push(txn);
                    } else {
                        batch.dropped_duplicates += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(row = index, reason = %e, "Dropping candidate row");
                    batch.dropped_invalid += 1;
                    batch.errors.push((index, e));
                }
            }
        }

        batch
    }

    pub fn normalize_row(
        &self,
        candidate: &CandidateTransaction,
    ) -> Result<NormalizedTransaction, RowError> {
        let date = parse_date(&candidate.date, self.reference_date)
            .ok_or_else(|| RowError::InvalidDate(candidate.date.clone()))?;

        let raw_amount = parse_amount(&candidate.amount)
            .ok_or_else(|| RowError::InvalidAmount(candidate.amount.clone()))?;
        if raw_amount.is_zero() {
            return Err(RowError::ZeroAmount);
        }

        let mut description = clean_description(&candidate.description);
        if description.is_empty() {
            description = candidate
                .raw_text
                .as_deref()
                .map(clean_description)
                .unwrap_or_default();
        }
        if description.is_empty() {
            return Err(RowError::EmptyDescription);
        }

        let (transaction_type, amount) = resolve_type(candidate.type_hint.as_deref(), raw_amount);
        let merchant = merchant_name(&description);
        let merchant_key = merchant_key(&merchant);

        Ok(NormalizedTransaction {
            date,
            amount,
            transaction_type,
            description,
            merchant,
            merchant_key,
            reference: candidate
                .reference
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        })
    }
}

/// Parse the date formats statement extractors commonly emit.
pub fn parse_date(raw: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    // ISO date-time without offset, e.g. "2024-01-05T00:00:00" or "2024-01-05 13:45"
    if raw.len() > 10 && raw.is_char_boundary(10) && matches!(raw.as_bytes()[10], b'T' | b' ') {
        if let Some(date) = parse_numeric_date(&raw[..10], reference) {
            return Some(date);
        }
    }

    if let Some(date) = parse_numeric_date(raw, reference) {
        return Some(date);
    }

    TEXT_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn parse_numeric_date(raw: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let parts: Vec<&str> = raw.split(['/', '-', '.']).collect();
    if parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    let nums: Vec<u32> = parts.iter().map(|p| p.parse().ok()).collect::<Option<_>>()?;

    match parts.len() {
        3 if parts[0].len() == 4 => NaiveDate::from_ymd_opt(nums[0] as i32, nums[1], nums[2]),
        3 => {
            let year = match parts[2].len() {
                4 => nums[2] as i32,
                2 => expand_two_digit_year(nums[2] as i32, reference),
                _ => return None,
            };
            // US order first; fall back to day-first when the month is impossible
            NaiveDate::from_ymd_opt(year, nums[0], nums[1])
                .or_else(|| NaiveDate::from_ymd_opt(year, nums[1], nums[0]))
        }
        2 => {
            let (month, day) = (nums[0], nums[1]);
            let this_year = NaiveDate::from_ymd_opt(reference.year(), month, day);
            match this_year {
                Some(date) if date <= reference => Some(date),
                _ => NaiveDate::from_ymd_opt(reference.year() - 1, month, day),
            }
        }
        _ => None,
    }
}

fn expand_two_digit_year(yy: i32, reference: NaiveDate) -> i32 {
    let candidate = 2000 + yy;
    if candidate > reference.year() + 1 {
        1900 + yy
    } else {
        candidate
    }
}

/// Parse a signed amount, tolerating currency symbols, thousands separators,
/// accounting parentheses, trailing minus and CR/DR suffixes. Rounded to
/// cents.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let mut s: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | ',' | '_') && !c.is_whitespace())
        .collect();
    let mut negative = false;

    if let Some(rest) = s.strip_suffix("CR") {
        s = rest.to_string();
    } else if let Some(rest) = s.strip_suffix("DR") {
        negative = true;
        s = rest.to_string();
    }

    // ISO currency code on either side, e.g. "USD12.00" or "12.00USD"
    if s.len() > 3 && s.as_bytes()[..3].iter().all(u8::is_ascii_alphabetic) {
        s = s[3..].to_string();
    }
    if s.len() > 3 && s.as_bytes()[s.len() - 3..].iter().all(u8::is_ascii_alphabetic) {
        s.truncate(s.len() - 3);
    }

    if s.starts_with('(') && s.ends_with(')') && s.len() > 2 {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    }
    if let Some(rest) = s.strip_suffix('-') {
        negative = true;
        s = rest.to_string();
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = true;
        s = rest.to_string();
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest.to_string();
    }

    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }

    let value = Decimal::from_str(&s)
        .ok()?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    Some(if negative { -value } else { value })
}

fn type_from_hint(hint: &str) -> Option<TransactionType> {
    match hint.trim().to_lowercase().as_str() {
        "income" | "credit" | "deposit" | "refund" | "cr" => Some(TransactionType::Income),
        "expense" | "debit" | "withdrawal" | "purchase" | "charge" | "fee" | "dr" => {
            Some(TransactionType::Expense)
        }
        "transfer" | "payment" => Some(TransactionType::Transfer),
        _ => None,
    }
}

/// Decide the transaction type and canonical sign. An explicit hint wins over
/// the sign of the amount; income is stored positive and expenses negative.
pub fn resolve_type(hint: Option<&str>, amount: Decimal) -> (TransactionType, Decimal) {
    let transaction_type = hint.and_then(type_from_hint).unwrap_or(if amount.is_sign_negative() {
        TransactionType::Expense
    } else {
        TransactionType::Income
    });

    let signed = match transaction_type {
        TransactionType::Income => amount.abs(),
        TransactionType::Expense => -amount.abs(),
        TransactionType::Transfer => amount,
    };
    (transaction_type, signed)
}

pub fn clean_description(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best-effort merchant name from a statement description:
/// `"SQ *BLUE BOTTLE #12"` → `"BLUE BOTTLE"`, `"AMAZON.COM*1A2B3"` →
/// `"AMAZON.COM"`.
pub fn merchant_name(description: &str) -> String {
    let mut segment = description;
    if let Some((head, tail)) = description.split_once('*') {
        // Short heads are payment processors (SQ, TST, PP)
        segment = if head.trim().len() <= 3 && !tail.trim().is_empty() {
            tail
        } else {
            head
        };
    }
    let segment = segment.split(['*', '#']).next().unwrap_or(segment);

    let mut tokens: Vec<&str> = segment.split_whitespace().collect();
    while tokens.len() > 1 && NOISE_PREFIXES.contains(&tokens[0].to_uppercase().as_str()) {
        tokens.remove(0);
    }
    while tokens.len() > 1
        && tokens
            .last()
            .is_some_and(|t| REFERENCE_TOKEN.is_match(&t.to_uppercase()))
    {
        tokens.pop();
    }

    let merchant = tokens.join(" ");
    if merchant.is_empty() {
        clean_description(description)
    } else {
        merchant
    }
}

/// Grouping key for a merchant: lowercase alphanumeric words, numeric-only
/// words removed.
pub fn merchant_key(merchant: &str) -> String {
    merchant
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !w.chars().all(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn candidate(date: &str, description: &str, amount: &str) -> CandidateTransaction {
        CandidateTransaction {
            date: date.to_string(),
            description: description.to_string(),
            amount: amount.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        for raw in [
            "2024-01-05",
            "2024/01/05",
            "01/05/2024",
            "1/5/2024",
            "01/05/24",
            "01-05-2024",
            "05 Jan 2024",
            "Jan 5, 2024",
            "January 5, 2024",
            "2024-01-05T10:00:00Z",
            "2024-01-05T10:00:00",
            "2024-01-05 10:00",
        ] {
            assert_eq!(parse_date(raw, reference()), Some(expected), "format {}", raw);
        }
    }

    #[test]
    fn test_parse_date_day_first_fallback() {
        assert_eq!(
            parse_date("25/01/2024", reference()),
            NaiveDate::from_ymd_opt(2024, 1, 25)
        );
    }

    #[test]
    fn test_yearless_dates_resolve_backwards() {
        assert_eq!(
            parse_date("03/01", reference()),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        // December is after the March reference date, so it belongs to last year
        assert_eq!(
            parse_date("12/20", reference()),
            NaiveDate::from_ymd_opt(2023, 12, 20)
        );
    }

    #[test]
    fn test_unparseable_dates() {
        for raw in ["", "yesterday", "13/45/2024", "2024-02-30", "2024"] {
            assert_eq!(parse_date(raw, reference()), None, "input {}", raw);
        }
    }

    #[test]
    fn test_parse_amount_variants() {
        assert_eq!(parse_amount("-15.49"), Some(dec("-15.49")));
        assert_eq!(parse_amount("$1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("-$40.00"), Some(dec("-40.00")));
        assert_eq!(parse_amount("(12.50)"), Some(dec("-12.50")));
        assert_eq!(parse_amount("$(12.50)"), Some(dec("-12.50")));
        assert_eq!(parse_amount("99.99-"), Some(dec("-99.99")));
        assert_eq!(parse_amount("250.00 CR"), Some(dec("250.00")));
        assert_eq!(parse_amount("75.10 DR"), Some(dec("-75.10")));
        assert_eq!(parse_amount("USD 10"), Some(dec("10")));
        assert_eq!(parse_amount("10.005"), Some(dec("10.01")));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("1.2.3"), None);
    }

    #[test]
    fn test_type_hint_overrides_sign() {
        assert_eq!(
            resolve_type(Some("debit"), dec("40.00")),
            (TransactionType::Expense, dec("-40.00"))
        );
        assert_eq!(
            resolve_type(Some("Credit"), dec("-5.00")),
            (TransactionType::Income, dec("5.00"))
        );
        assert_eq!(
            resolve_type(Some("transfer"), dec("-500")),
            (TransactionType::Transfer, dec("-500"))
        );
        assert_eq!(
            resolve_type(Some("mystery"), dec("-1")),
            (TransactionType::Expense, dec("-1"))
        );
        assert_eq!(
            resolve_type(None, dec("2500")),
            (TransactionType::Income, dec("2500"))
        );
    }

    #[test]
    fn test_merchant_extraction() {
        assert_eq!(merchant_name("AMAZON.COM*1A2B3"), "AMAZON.COM");
        assert_eq!(merchant_name("WALMART #1234"), "WALMART");
        assert_eq!(merchant_name("SQ *BLUE BOTTLE #12"), "BLUE BOTTLE");
        assert_eq!(merchant_name("POS DEBIT SHELL OIL 57442"), "SHELL OIL");
        assert_eq!(merchant_name("NETFLIX.COM"), "NETFLIX.COM");
        assert_eq!(merchant_key("AMAZON.COM"), "amazon com");
        assert_eq!(merchant_key("Trader Joe's 552"), "trader joe s");
    }

    #[test]
    fn test_batch_drops_and_counts() {
        let normalizer = Normalizer::new(reference());
        let rows = vec![
            candidate("2024-01-05", "  NETFLIX.COM   ", "-15.49"),
            candidate("2024-01-05", "NETFLIX.COM", "-15.49"),
            candidate("not a date", "COFFEE", "-3.00"),
            candidate("2024-01-06", "COFFEE", "three dollars"),
            candidate("2024-01-07", "ZERO", "0.00"),
            candidate("2024-01-08", "", "-1.00"),
            candidate("2024-01-09", "PAYROLL", "2500"),
        ];

        let batch = normalizer.normalize(&rows);
        assert_eq!(batch.record_count, 7);
        assert_eq!(batch.transactions.len(), 2);
        assert_eq!(batch.dropped_duplicates, 1);
        assert_eq!(batch.dropped_invalid, 4);
        assert_eq!(batch.transactions[0].description, "NETFLIX.COM");
        assert!(matches!(batch.errors[0], (2, RowError::InvalidDate(_))));
        assert!(matches!(batch.errors[1], (3, RowError::InvalidAmount(_))));
        assert_eq!(batch.errors[2], (4, RowError::ZeroAmount));
        assert_eq!(batch.errors[3], (5, RowError::EmptyDescription));
        assert!(!batch.nothing_parseable());
    }

    #[test]
    fn test_description_falls_back_to_raw_text() {
        let normalizer = Normalizer::new(reference());
        let mut row = candidate("2024-01-05", "", "-8.00");
        row.raw_text = Some("01/05 UBER   TRIP".to_string());
        let txn = normalizer.normalize_row(&row).unwrap();
        assert_eq!(txn.description, "01/05 UBER TRIP");
    }

    #[test]
    fn test_all_rows_invalid_is_flagged() {
        let normalizer = Normalizer::new(reference());
        let batch = normalizer.normalize(&[candidate("??", "X", "1"), candidate("", "", "")]);
        assert!(batch.nothing_parseable());
        assert!(!normalizer.normalize(&[]).nothing_parseable());
    }
}
