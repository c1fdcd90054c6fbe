//! HTTP document-understanding provider.
//!
//! Posts the raw document (base64) to a JSON endpoint and parses the
//! transaction rows out of whatever structure comes back.

use super::{parse_candidates, ExtractionError, ExtractionProvider};
use crate::models::CandidateTransaction;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use service_core::observability::outbound_headers;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Longest provider error body echoed into a statement's error field.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Clone)]
pub struct HttpExtractionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
}

pub struct HttpExtractionProvider {
    config: HttpExtractionConfig,
    client: Client,
}

#[derive(Serialize)]
struct ExtractionRequest<'a> {
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    content_base64: String,
}

impl HttpExtractionProvider {
    pub fn new(config: HttpExtractionConfig) -> Result<Self, ExtractionError> {
        if config.endpoint.trim().is_empty() {
            return Err(ExtractionError::NotConfigured(
                "EXTRACTION_ENDPOINT is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExtractionError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl ExtractionProvider for HttpExtractionProvider {
    async fn extract(
        &self,
        bytes: &[u8],
        declared_type: &str,
    ) -> Result<Vec<CandidateTransaction>, ExtractionError> {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let request = ExtractionRequest {
            mime_type: declared_type,
            model: self.config.model.as_deref(),
            content_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        };

        tracing::debug!(
            endpoint = %self.config.endpoint,
            request_id = %request_id,
            mime_type = %declared_type,
            size_bytes = bytes.len(),
            "Sending document to extraction provider"
        );

        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .headers(outbound_headers(Some(&request_id)))
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Timeout(self.config.timeout)
            } else {
                ExtractionError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExtractionError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Api(format!(
                "provider returned {}: {}",
                status,
                truncate(&error_text)
            )));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Timeout(self.config.timeout)
            } else {
                ExtractionError::Network(e.to_string())
            }
        })?;

        let candidates = parse_candidates(&body)?;

        tracing::info!(
            request_id = %request_id,
            rows = candidates.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Extraction provider responded"
        );

        Ok(candidates)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_endpoint_is_not_configured() {
        let result = HttpExtractionProvider::new(HttpExtractionConfig {
            endpoint: "  ".to_string(),
            api_key: None,
            model: None,
            timeout: Duration::from_secs(1),
        });
        assert!(matches!(result, Err(ExtractionError::NotConfigured(_))));
    }

    #[test]
    fn test_truncate_long_bodies() {
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        let short = truncate(&long);
        assert_eq!(short.len(), MAX_ERROR_BODY + 3);
        assert_eq!(truncate("ok"), "ok");
    }
}
