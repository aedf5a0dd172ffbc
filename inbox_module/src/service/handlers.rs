use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::task;
use tracing::{error, warn};

use crate::ingest::{IngestError, WebhookAck, STATUS_IGNORED};

use super::state::GatewayState;

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET handshake; answered inline as plain text.
pub(super) async fn verify_webhook(
    State(state): State<Arc<GatewayState>>,
    Path(platform): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match state.ingest.answer_challenge(&platform, &query) {
        Ok(answer) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            answer,
        )
            .into_response(),
        Err(IngestError::UnknownPlatform(_)) => {
            (StatusCode::NOT_FOUND, "unknown_platform").into_response()
        }
        Err(IngestError::ChallengeRejected(reason)) => {
            (StatusCode::FORBIDDEN, reason).into_response()
        }
        Err(err) => {
            warn!("gateway challenge failed platform={}: {}", platform, err);
            (StatusCode::FORBIDDEN, "challenge_rejected").into_response()
        }
    }
}

pub(super) async fn ingest_webhook(
    State(state): State<Arc<GatewayState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ingest = state.ingest.clone();
    let name = platform.clone();
    let result = task::spawn_blocking(move || ingest.handle(&name, &headers, &body)).await;

    let result = match result {
        Ok(result) => result,
        Err(err) => {
            error!("gateway ingest task failed platform={}: {}", platform, err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookAck::new("error", "ingest task failed")),
            )
                .into_response();
        }
    };

    let (status, ack) = match result {
        Ok(ack) => (StatusCode::OK, ack),
        Err(IngestError::AuthenticationFailure(reason)) => {
            warn!("gateway rejected webhook platform={} reason={}", platform, reason);
            (StatusCode::UNAUTHORIZED, WebhookAck::new("unauthorized", reason))
        }
        Err(IngestError::UnknownPlatform(name)) => {
            warn!("gateway webhook for unknown platform={}", name);
            (StatusCode::OK, WebhookAck::new(STATUS_IGNORED, "unknown_platform"))
        }
        Err(err @ (IngestError::Unrecoverable(_) | IngestError::ChallengeRejected(_))) => {
            warn!("gateway ignored webhook platform={}: {}", platform, err);
            (StatusCode::OK, WebhookAck::new(STATUS_IGNORED, err.to_string()))
        }
        Err(err @ (IngestError::PersistenceConflict(_) | IngestError::Storage(_))) => {
            error!("gateway could not store webhook platform={}: {}", platform, err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                WebhookAck::new("retry_later", "storage busy, retry"),
            )
        }
    };
    (status, Json(ack)).into_response()
}
