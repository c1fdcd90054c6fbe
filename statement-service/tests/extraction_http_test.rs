//! HTTP extraction provider against an in-process fake provider.

mod common;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use serde_json::{json, Value};
use statement_service::services::extraction::{
    ExtractionError, ExtractionProvider, HttpExtractionConfig, HttpExtractionProvider,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct Seen {
    body: Option<Value>,
    authorization: Option<String>,
    request_id: Option<String>,
}

async fn spawn_fake_provider() -> (String, Arc<Mutex<Seen>>) {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let recorder = seen.clone();

    let app = Router::new()
        .route(
            "/ok",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let recorder = recorder.clone();
                async move {
                    let mut seen = recorder.lock().unwrap();
                    seen.body = Some(body);
                    seen.authorization = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    seen.request_id = headers
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Json(json!({
                        "transactions": [
                            {"date": "2024-03-01", "description": "NETFLIX.COM", "amount": -15.49},
                            {"posted_date": "03/02/2024", "merchant": "PAYROLL", "credit": "2500.00"}
                        ]
                    }))
                }
            }),
        )
        .route(
            "/error",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded") }),
        )
        .route(
            "/limited",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        )
        .route(
            "/garbage",
            post(|| async { "Sorry, I could not find any transactions." }),
        )
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"transactions": []}))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), seen)
}

fn provider(base: &str, path: &str, timeout: Duration) -> HttpExtractionProvider {
    HttpExtractionProvider::new(HttpExtractionConfig {
        endpoint: format!("{}{}", base, path),
        api_key: Some("secret-key".to_string()),
        model: Some("statement-v1".to_string()),
        timeout,
    })
    .unwrap()
}

#[tokio::test]
async fn test_extracts_rows_and_sends_document() {
    common::init_tracing();
    let (base, seen) = spawn_fake_provider().await;
    let provider = provider(&base, "/ok", Duration::from_secs(5));

    let rows = provider
        .extract(b"%PDF-1.7 fake", "application/pdf")
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].description, "NETFLIX.COM");
    assert_eq!(rows[0].amount, "-15.49");
    assert_eq!(rows[1].date, "03/02/2024");
    assert_eq!(rows[1].type_hint.as_deref(), Some("credit"));

    let seen = seen.lock().unwrap();
    let body = seen.body.as_ref().unwrap();
    assert_eq!(body["mime_type"], "application/pdf");
    assert_eq!(body["model"], "statement-v1");
    let content = base64::engine::general_purpose::STANDARD
        .decode(body["content_base64"].as_str().unwrap())
        .unwrap();
    assert_eq!(content, b"%PDF-1.7 fake");
    assert_eq!(seen.authorization.as_deref(), Some("Bearer secret-key"));
    assert!(seen.request_id.is_some());
}

#[tokio::test]
async fn test_server_error_is_api_error() {
    let (base, _) = spawn_fake_provider().await;
    let provider = provider(&base, "/error", Duration::from_secs(5));

    match provider.extract(b"doc", "application/pdf").await {
        Err(ExtractionError::Api(message)) => {
            assert!(message.contains("500"));
            assert!(message.contains("model overloaded"));
        }
        other => panic!("expected api error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_too_many_requests_is_rate_limited() {
    let (base, _) = spawn_fake_provider().await;
    let provider = provider(&base, "/limited", Duration::from_secs(5));

    let result = provider.extract(b"doc", "application/pdf").await;
    assert!(matches!(result, Err(ExtractionError::RateLimited)));
}

#[tokio::test]
async fn test_unstructured_reply_is_malformed() {
    let (base, _) = spawn_fake_provider().await;
    let provider = provider(&base, "/garbage", Duration::from_secs(5));

    let result = provider.extract(b"doc", "image/png").await;
    assert!(matches!(result, Err(ExtractionError::MalformedResponse(_))));
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let (base, _) = spawn_fake_provider().await;
    let provider = provider(&base, "/slow", Duration::from_millis(200));

    let result = provider.extract(b"doc", "application/pdf").await;
    assert!(matches!(result, Err(ExtractionError::Timeout(_))));
}

#[tokio::test]
async fn test_unreachable_provider_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let provider = provider(&format!("http://{}", addr), "/ok", Duration::from_secs(2));
    let result = provider.extract(b"doc", "application/pdf").await;
    assert!(matches!(result, Err(ExtractionError::Network(_))));
}
