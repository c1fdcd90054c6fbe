//! Scripted extraction provider for tests and local runs.
//!
//! Responses are keyed by the exact document bytes, so each stored test file
//! can drive its own outcome. Unknown documents yield an empty statement.

use super::{ExtractionError, ExtractionProvider};
use crate::models::CandidateTransaction;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct Script {
    outcome: Result<Vec<CandidateTransaction>, ExtractionError>,
    delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            outcome: Ok(Vec::new()),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
pub struct MockExtractionProvider {
    scripts: Mutex<HashMap<Vec<u8>, Script>>,
    calls: Mutex<Vec<String>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight gauge even when the call is abandoned by a
/// timeout.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockExtractionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, document: &[u8], edit: impl FnOnce(&mut Script)) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        edit(scripts.entry(document.to_vec()).or_default());
    }

    pub fn with_rows(self, document: &[u8], rows: Vec<CandidateTransaction>) -> Self {
        self.script(document, |s| s.outcome = Ok(rows));
        self
    }

    pub fn with_error(self, document: &[u8], error: ExtractionError) -> Self {
        self.script(document, |s| s.outcome = Err(error));
        self
    }

    pub fn with_delay(self, document: &[u8], delay: Duration) -> Self {
        self.script(document, |s| s.delay = delay);
        self
    }

    /// Documents seen so far, in call order (lossy UTF-8).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Highest number of concurrent `extract` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionProvider for MockExtractionProvider {
    async fn extract(
        &self,
        bytes: &[u8],
        _declared_type: &str,
    ) -> Result<Vec<CandidateTransaction>, ExtractionError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(self.in_flight.clone());
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(String::from_utf8_lossy(bytes).into_owned());

        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bytes)
            .cloned()
            .unwrap_or_default();

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        script.outcome
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_rows_and_default() {
        let row = CandidateTransaction {
            date: "2024-01-01".to_string(),
            description: "COFFEE".to_string(),
            amount: "-3.50".to_string(),
            ..Default::default()
        };
        let provider = MockExtractionProvider::new().with_rows(b"a.csv", vec![row.clone()]);

        assert_eq!(provider.extract(b"a.csv", "text/csv").await.unwrap(), vec![row]);
        assert!(provider.extract(b"other", "text/csv").await.unwrap().is_empty());
        assert_eq!(provider.calls(), vec!["a.csv".to_string(), "other".to_string()]);
        assert_eq!(provider.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let provider =
            MockExtractionProvider::new().with_error(b"bad.pdf", ExtractionError::RateLimited);
        assert!(matches!(
            provider.extract(b"bad.pdf", "application/pdf").await,
            Err(ExtractionError::RateLimited)
        ));
    }
}
