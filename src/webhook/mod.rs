//! Webhook ingestion gateway
//!
//! Plex posts `multipart/form-data` with the event JSON in a `payload` field;
//! test tools post plain JSON. Both encodings are normalized into one
//! `WebhookEvent` before anything else looks at them.
//!
//! Plex webhooks carry no signature, so the only gate is the account name.

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::AppState;
use crate::hub::StatePublisher;
use crate::state::{EventKind, MediaMetadata, PlaybackState, PlayerInfo, SharedStore, StoreError};

/// Webhook body as received, before decoding
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// JSON body: the event itself, or `{"payload": "<json>" | {...}}`
    Json(Bytes),
    /// Multipart form; `payload` is the field of that name if present
    Form { payload: Option<String> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub title: String,
    #[serde(default, deserialize_with = "crate::state::lenient::or_default")]
    pub thumb: String,
}

/// The fields of a Plex webhook the relay relies on
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(rename = "Account")]
    pub account: Account,
    #[serde(rename = "Metadata")]
    pub metadata: MediaMetadata,
    #[serde(rename = "Player")]
    pub player: PlayerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Well-formed but not applied (other account, unsupported event)
    Ignored(String),
    /// Malformed; nothing was applied
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("state store failed: {0}")]
    Store(#[from] StoreError),
}

/// Decode either encoding into a `WebhookEvent`; the error is a client-facing reason
pub fn decode_event(raw: RawEvent) -> Result<WebhookEvent, String> {
    let event = match raw {
        RawEvent::Form { payload: None } => {
            return Err("Missing payload in multipart data".to_string());
        }
        RawEvent::Form {
            payload: Some(payload),
        } => serde_json::from_str::<Value>(&payload)
            .map_err(|e| format!("Invalid payload JSON: {}", e))?,
        RawEvent::Json(body) => {
            let body: Value = serde_json::from_slice(&body)
                .map_err(|e| format!("Invalid JSON body: {}", e))?;
            match body.get("payload").cloned() {
                Some(Value::String(payload)) => serde_json::from_str(&payload)
                    .map_err(|e| format!("Invalid payload JSON: {}", e))?,
                Some(payload @ Value::Object(_)) => payload,
                Some(Value::Null) | None if body.get("event").is_some() => body,
                _ => return Err("Missing payload".to_string()),
            }
        }
    };

    serde_json::from_value(event).map_err(|e| format!("Invalid webhook payload: {}", e))
}

pub struct IngestGateway {
    store: SharedStore,
    publisher: Arc<dyn StatePublisher>,
    username: String,
}

impl IngestGateway {
    pub fn new(store: SharedStore, publisher: Arc<dyn StatePublisher>, username: impl Into<String>) -> Self {
        Self {
            store,
            publisher,
            username: username.into(),
        }
    }

    pub async fn handle(&self, raw: RawEvent) -> Result<WebhookOutcome, GatewayError> {
        let event = match decode_event(raw) {
            Ok(event) => event,
            Err(reason) => {
                warn!("Rejected webhook: {}", reason);
                return Ok(WebhookOutcome::Rejected(reason));
            }
        };

        if self.username.is_empty() || event.account.title != self.username {
            debug!(account = %event.account.title, event = %event.event, "Ignoring webhook from other user");
            return Ok(WebhookOutcome::Ignored("different user".to_string()));
        }

        let Some(kind) = EventKind::parse(&event.event) else {
            debug!(event = %event.event, "Ignoring unsupported webhook event");
            return Ok(WebhookOutcome::Ignored(format!("unsupported event {}", event.event)));
        };

        let state = PlaybackState::now(kind, event.metadata, event.player);
        info!(event = %kind, title = %state.metadata.title, player = %state.player.title, "Webhook processed");

        self.store.save(&state).await?;
        self.publisher.publish(state).await;

        if kind == EventKind::Stop {
            self.store.clear().await?;
        }

        Ok(WebhookOutcome::Processed)
    }
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

async fn read_payload_field(mut multipart: Multipart) -> Result<Option<String>, String> {
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        if field.name() == Some("payload") {
            return field.text().await.map(Some).map_err(|e| e.body_text());
        }
    }
    Ok(None)
}

fn rejected(reason: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": reason }))).into_response()
}

/// POST /api/webhook
pub async fn webhook_handler(State(state): State<AppState>, request: Request) -> Response {
    let raw = if is_multipart(&request) {
        let multipart = match Multipart::from_request(request, &state).await {
            Ok(m) => m,
            Err(rejection) => return rejected(rejection.body_text()),
        };
        match read_payload_field(multipart).await {
            Ok(payload) => RawEvent::Form { payload },
            Err(reason) => return rejected(reason),
        }
    } else {
        match Bytes::from_request(request, &state).await {
            Ok(body) => RawEvent::Json(body),
            Err(rejection) => return rejection.into_response(),
        }
    };

    match state.gateway.handle(raw).await {
        Ok(WebhookOutcome::Processed) => {
            Json(serde_json::json!({ "status": "processed" })).into_response()
        }
        Ok(WebhookOutcome::Ignored(reason)) => {
            Json(serde_json::json!({ "status": "ignored", "reason": reason })).into_response()
        }
        Ok(WebhookOutcome::Rejected(reason)) => rejected(reason),
        Err(e) => {
            error!("Webhook processing failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}
