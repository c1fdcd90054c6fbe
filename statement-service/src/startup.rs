use crate::config::StatementServiceConfig;
use crate::handlers;
use crate::services::extraction::{ExtractionProvider, HttpExtractionProvider};
use crate::services::{Database, LedgerRepository, LocalStorage, Storage};
use crate::workers::{IngestionJob, QueueManager};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Error recorded on statements a previous process left mid-pipeline.
pub const INTERRUPTED_REASON: &str = "interrupted by service restart";

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn LedgerRepository>,
    pub queue: QueueManager,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/queue/status", get(handlers::queue_status))
        .route("/statements/:id/enqueue", post(handlers::enqueue_statement))
        .route("/statements/:id/requeue", post(handlers::requeue_statement))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    pub async fn build(config: StatementServiceConfig) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            e
        })?;
        db.run_migrations().await?;

        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(&config.storage.local_path)
                .await
                .map_err(|e| {
                    tracing::error!(
                        "Failed to initialize local storage at {}: {}",
                        config.storage.local_path,
                        e
                    );
                    AppError::ConfigError(anyhow::anyhow!("Storage initialization: {}", e))
                })?,
        );

        let extractor: Arc<dyn ExtractionProvider> = Arc::new(
            HttpExtractionProvider::new(config.http_extraction())
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}", e)))?,
        );

        Self::build_with(&config, Arc::new(db), storage, extractor).await
    }

    /// Assemble the pipeline and HTTP server around the given backends.
    pub async fn build_with(
        config: &StatementServiceConfig,
        repository: Arc<dyn LedgerRepository>,
        storage: Arc<dyn Storage>,
        extractor: Arc<dyn ExtractionProvider>,
    ) -> Result<Self, AppError> {
        let interrupted = repository.fail_interrupted(INTERRUPTED_REASON).await?;
        if interrupted > 0 {
            tracing::warn!(
                count = interrupted,
                "Marked statements interrupted by a previous process as failed"
            );
        }

        let job = Arc::new(IngestionJob::new(
            repository.clone(),
            storage,
            extractor,
            config.ingestion(),
        ));
        let queue = QueueManager::new(repository.clone(), job, config.queue_config());
        queue.resume();

        let state = AppState { repository, queue };
        let app = router(state.clone());

        let addr = config.common.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn queue(&self) -> QueueManager {
        self.state.queue.clone()
    }

    pub fn repository(&self) -> Arc<dyn LedgerRepository> {
        self.state.repository.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}
