use crate::startup::AppState;
use crate::workers::QueueStatus;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.queue.status())
}

/// Queue an uploaded statement for ingestion. Responds with the queue load
/// so upload flows can tell the user how busy processing is.
#[tracing::instrument(skip(state))]
pub async fn enqueue_statement(
    State(state): State<AppState>,
    Path(statement_id): Path<Uuid>,
) -> Result<(StatusCode, Json<QueueStatus>), AppError> {
    let Some(statement) = state.repository.get_statement(statement_id).await? else {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Statement {} not found",
            statement_id
        )));
    };
    if !statement.processing_stage.is_enqueueable() {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Statement {} is {}; use POST /statements/{}/requeue to reprocess it",
            statement_id,
            statement.processing_stage.as_str(),
            statement_id
        )));
    }

    state.queue.enqueue(statement_id).await;
    Ok((StatusCode::ACCEPTED, Json(state.queue.status())))
}

#[tracing::instrument(skip(state))]
pub async fn requeue_statement(
    State(state): State<AppState>,
    Path(statement_id): Path<Uuid>,
) -> Result<(StatusCode, Json<QueueStatus>), AppError> {
    let status = state.queue.requeue(statement_id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}
