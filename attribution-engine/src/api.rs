use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::PipelineError;
use crate::event::RawEvent;
use crate::pipeline::{IngestOutcome, Pipeline};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("batch cannot be empty")]
    EmptyBatch,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::EmptyBatch | ApiError::Pipeline(PipelineError::BatchTooLarge { .. }) => {
                StatusCode::BAD_REQUEST
            }

            ApiError::Pipeline(PipelineError::ShuttingDown)
            | ApiError::Pipeline(PipelineError::Halted(_))
            | ApiError::Pipeline(PipelineError::PartitionUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub outcomes: Vec<IngestOutcome>,
}

fn status_of(outcome: &IngestOutcome) -> StatusCode {
    match outcome {
        IngestOutcome::Accepted => StatusCode::ACCEPTED,
        IngestOutcome::Rejected(_) => StatusCode::BAD_REQUEST,
        IngestOutcome::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// `POST /v1/events`: the status code mirrors the single outcome.
pub async fn ingest_event(
    State(pipeline): State<Arc<Pipeline>>,
    Json(event): Json<RawEvent>,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let outcome = pipeline.ingest(event).await?;
    debug!(outcome = ?outcome, "ingested event");

    Ok((status_of(&outcome), Json(outcome)))
}

/// `POST /v1/events/batch`: answers 202 with one outcome per event, in input order.
pub async fn ingest_batch(
    State(pipeline): State<Arc<Pipeline>>,
    Json(batch): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    if batch.events.is_empty() {
        return Err(ApiError::EmptyBatch);
    }
    let outcomes = pipeline.ingest_batch(batch.events).await?;

    Ok((StatusCode::ACCEPTED, Json(BatchResponse { outcomes })))
}
