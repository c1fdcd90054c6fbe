//! Extraction provider abstractions and implementations.
//!
//! An extraction provider turns raw statement bytes into candidate
//! transaction rows. The production backend is an HTTP document-understanding
//! service; the mock backend is scripted for tests.

pub mod http;
pub mod mock;

use crate::models::CandidateTransaction;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

pub use http::{HttpExtractionConfig, HttpExtractionProvider};
pub use mock::MockExtractionProvider;

/// Error type for extraction calls. Every variant fails the whole job.
#[derive(Error, Debug, Clone)]
pub enum ExtractionError {
    #[error("Extraction provider not configured: {0}")]
    NotConfigured(String),

    #[error("Extraction network error: {0}")]
    Network(String),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Extraction provider rate limited")]
    RateLimited,

    #[error("Extraction API error: {0}")]
    Api(String),

    #[error("Malformed extraction response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Extract candidate rows from a document. An empty list is a valid
    /// answer for a statement without activity.
    async fn extract(
        &self,
        bytes: &[u8],
        declared_type: &str,
    ) -> Result<Vec<CandidateTransaction>, ExtractionError>;

    fn name(&self) -> &'static str;
}

const DATE_KEYS: &[&str] = &["date", "transaction_date", "posted_date", "posting_date"];
const DESCRIPTION_KEYS: &[&str] = &["description", "merchant", "name", "payee", "memo"];
const AMOUNT_KEYS: &[&str] = &["amount", "transaction_amount", "value"];
const TYPE_KEYS: &[&str] = &["type", "transaction_type", "direction"];
const REFERENCE_KEYS: &[&str] = &["reference", "reference_number", "ref"];
const RAW_KEYS: &[&str] = &["raw_text", "raw", "line"];

/// Parse a provider response body into candidate rows.
///
/// Accepts `{"transactions": [...]}`, `{"data": {"transactions": [...]}}`,
/// a bare array, a `{"text": "<json>"}` envelope, and any of these wrapped in
/// a Markdown code fence. Only a body with no recognizable transaction array
/// is an error; odd rows survive as candidates and are rejected later by the
/// normalizer.
pub fn parse_candidates(body: &str) -> Result<Vec<CandidateTransaction>, ExtractionError> {
    let value: Value = serde_json::from_str(strip_code_fence(body))
        .map_err(|e| ExtractionError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let rows = locate_rows(&value, 0).ok_or_else(|| {
        ExtractionError::MalformedResponse("response contains no transactions array".to_string())
    })?;

    Ok(rows.iter().map(candidate_from_value).collect())
}

fn strip_code_fence(body: &str) -> &str {
    let trimmed = body.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening line
    let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn locate_rows(value: &Value, depth: usize) -> Option<Vec<Value>> {
    match value {
        Value::Array(rows) => Some(rows.clone()),
        Value::Object(obj) => {
            if let Some(Value::Array(rows)) = obj.get("transactions") {
                return Some(rows.clone());
            }
            if let Some(data) = obj.get("data") {
                if let Some(rows) = locate_rows(data, depth + 1) {
                    return Some(rows);
                }
            }
            // Generative providers return the JSON document as a text part
            if depth == 0 {
                if let Some(Value::String(text)) = obj.get("text") {
                    let inner: Value = serde_json::from_str(strip_code_fence(text)).ok()?;
                    return locate_rows(&inner, depth + 1);
                }
            }
            None
        }
        _ => None,
    }
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn candidate_from_value(value: &Value) -> CandidateTransaction {
    let Value::Object(obj) = value else {
        return CandidateTransaction {
            raw_text: Some(value.to_string()),
            ..Default::default()
        };
    };

    let mut type_hint = first_text(obj, TYPE_KEYS);
    let amount = match first_text(obj, AMOUNT_KEYS) {
        Some(amount) => amount,
        None => {
            // Split debit/credit columns, common in bank CSV exports
            if let Some(credit) = first_text(obj, &["credit"]) {
                type_hint.get_or_insert_with(|| "credit".to_string());
                credit
            } else if let Some(debit) = first_text(obj, &["debit"]) {
                type_hint.get_or_insert_with(|| "debit".to_string());
                debit
            } else {
                String::new()
            }
        }
    };

    CandidateTransaction {
        date: first_text(obj, DATE_KEYS).unwrap_or_default(),
        description: first_text(obj, DESCRIPTION_KEYS).unwrap_or_default(),
        amount,
        type_hint,
        reference: first_text(obj, REFERENCE_KEYS),
        raw_text: first_text(obj, RAW_KEYS),
    }
}
