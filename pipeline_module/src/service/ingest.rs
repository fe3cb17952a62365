use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use tracing::{error, info, warn};

use crate::html::strip_html;
use crate::notification::ChangeNotificationPayload;
use crate::task::EmailTask;

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct ValidationParams {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

/// Webhook endpoint for mailbox change notifications.
///
/// Handshake calls carry a `validationToken` query parameter and get it
/// echoed back as plain text. Notification batches are fetched entry by
/// entry and queued as reply tasks; the notification source retries the
/// whole call on a non-2xx response, so the first hard failure wins.
pub(super) async fn ingest_notifications(
    State(state): State<AppState>,
    Query(params): Query<ValidationParams>,
    body: Bytes,
) -> Response {
    if let Some(token) = params.validation_token {
        return (StatusCode::OK, token).into_response();
    }

    let payload: ChangeNotificationPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "bad_json"}))).into_response();
        }
    };
    if payload.value.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "empty_payload"})),
        )
            .into_response();
    }
    if let Err(reason) = verify_client_state(state.config.client_state.as_deref(), &payload) {
        warn!("rejecting notification batch: {}", reason);
        return (StatusCode::UNAUTHORIZED, Json(json!({"status": reason}))).into_response();
    }

    let mut published = 0usize;
    let mut not_found = 0usize;
    for entry in &payload.value {
        let Some(message_id) = entry.message_id() else {
            warn!("skipping notification entry without a message id");
            continue;
        };

        let fetched = {
            let directory = state.directory.clone();
            let id = message_id.to_string();
            match task::spawn_blocking(move || directory.fetch_message_by_id(&id)).await {
                Ok(result) => result,
                Err(err) => {
                    error!("message fetch task failed: {}", err);
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"status": "fetch_failed"})),
                    )
                        .into_response();
                }
            }
        };
        let message = match fetched {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("message {} not found in mailbox", message_id);
                not_found += 1;
                continue;
            }
            Err(err) => {
                error!("message fetch failed for {}: {}", message_id, err);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"status": "fetch_failed"})),
                )
                    .into_response();
            }
        };

        let email_task = EmailTask {
            email_id: message.id,
            subject: message.subject,
            body: message.body.as_deref().map(strip_html),
            sender: message.sender,
            recipient: message
                .to_recipient
                .filter(|address| !address.trim().is_empty())
                .or_else(|| Some(state.config.support_address.clone())),
        };

        let publish_result = {
            let queue = state.queue.clone();
            match task::spawn_blocking(move || queue.publish(&email_task)).await {
                Ok(result) => result,
                Err(err) => {
                    error!("publish task failed: {}", err);
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"status": "publish_failed"})),
                    )
                        .into_response();
                }
            }
        };
        match publish_result {
            Ok(()) => {
                info!("queued reply task for message {}", message_id);
                published += 1;
            }
            Err(err) => {
                error!("work queue publish failed for {}: {}", message_id, err);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"status": "publish_failed"})),
                )
                    .into_response();
            }
        }
    }

    if published > 0 {
        StatusCode::OK.into_response()
    } else if not_found > 0 {
        (StatusCode::NOT_FOUND, Json(json!({"status": "not_found"}))).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "no_message_ids"})),
        )
            .into_response()
    }
}

fn verify_client_state(
    expected: Option<&str>,
    payload: &ChangeNotificationPayload,
) -> Result<(), &'static str> {
    let Some(expected) = expected else {
        return Ok(());
    };
    for entry in &payload.value {
        if entry.client_state.as_deref() != Some(expected) {
            return Err("client_state_mismatch");
        }
    }
    Ok(())
}
