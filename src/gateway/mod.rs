//! HTTP ingress for inbound messages.
//!
//! The upstream webhook receiver (out of scope here) normalizes provider
//! payloads and POSTs them to `/v1/messages/inbound`. The handler's job is
//! deliberately small: log the message, cancel pending follow-ups, feed the
//! debounce buffer, and return 202 before any AI work happens.

use crate::buffer::MessageBuffer;
use crate::config::Config;
use crate::followup;
use crate::store::{self, Direction};
use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

const MAX_BODY_SIZE: usize = 64 * 1024;
const REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    buffer: MessageBuffer,
}

pub async fn run_gateway(config: Arc<Config>, buffer: MessageBuffer) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid gateway address: {e}"))?;

    let state = AppState { config, buffer };
    let app = Router::new()
        .route("/healthz", get(handle_health))
        .route("/v1/messages/inbound", post(handle_inbound))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {addr}");
    crate::health::mark_component_ok("gateway");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(crate::health::snapshot_json()))
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    business_id: String,
    contact_phone: String,
    instance_id: String,
    /// Provider message id, used for read receipts.
    message_id: Option<String>,
    #[serde(default = "default_media_type")]
    media_type: String,
    content: String,
    /// Skip the debounce wait and dispatch immediately.
    #[serde(default)]
    flush: bool,
}

fn default_media_type() -> String {
    "text".into()
}

async fn handle_inbound(
    State(state): State<AppState>,
    Json(inbound): Json<InboundMessage>,
) -> impl IntoResponse {
    if inbound.business_id.is_empty()
        || inbound.contact_phone.is_empty()
        || inbound.content.trim().is_empty()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "business_id, contact_phone and content are required" })),
        );
    }

    if let Err(error) = ingest(&state, &inbound).await {
        tracing::error!(
            business = inbound.business_id,
            contact = inbound.contact_phone,
            "Failed to ingest inbound message: {error:#}"
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "failed to accept message" })),
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    )
}

async fn ingest(state: &AppState, inbound: &InboundMessage) -> Result<()> {
    store::messages::append_message(
        &state.config,
        &inbound.business_id,
        &inbound.contact_phone,
        Direction::Inbound,
        &inbound.media_type,
        &inbound.content,
    )?;

    // The contact spoke: whatever nudge was pending is now moot.
    followup::cancel_pending_follow_ups(
        &state.config,
        &inbound.business_id,
        &inbound.contact_phone,
    )?;

    state.buffer.add_fragment(
        &inbound.business_id,
        &inbound.contact_phone,
        &inbound.instance_id,
        inbound.message_id.as_deref(),
        &inbound.content,
    )?;

    if inbound.flush {
        state
            .buffer
            .force_flush(&inbound.business_id, &inbound.contact_phone)
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{seed_business, seed_instance, test_config};
    use crate::store::{ReminderKind, ReminderStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn state(tmp: &TempDir) -> AppState {
        let mut config = test_config(tmp);
        config.dispatch.debounce_ms = 60_000;
        seed_business(&config, "biz-1");
        seed_instance(&config, "biz-1", "inst-1");
        AppState {
            buffer: MessageBuffer::new(config.clone()),
            config: Arc::new(config),
        }
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            business_id: "biz-1".into(),
            contact_phone: "+51999000111".into(),
            instance_id: "inst-1".into(),
            message_id: Some("wamid.1".into()),
            media_type: "text".into(),
            content: content.into(),
            flush: false,
        }
    }

    #[tokio::test]
    async fn ingest_logs_buffers_and_cancels_followups() {
        let tmp = TempDir::new().unwrap();
        let state = state(&tmp);

        let pending = store::reminders::insert_reminder(
            &state.config,
            "biz-1",
            "+51999000111",
            "cfg-1",
            ReminderKind::Auto,
            1,
            Utc::now() + chrono::Duration::hours(1),
            None,
        )
        .unwrap();

        ingest(&state, &inbound("hola, sigo interesado")).await.unwrap();

        // Reply cancelled the pending follow-up.
        let row = store::reminders::get_reminder(&state.config, &pending.id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReminderStatus::CancelledUserReplied);

        // Message is logged and buffered.
        let history =
            store::messages::recent_messages(&state.config, "biz-1", "+51999000111", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::Inbound);

        let due = store::buffers::list_pending_due(
            &state.config,
            Utc::now() + chrono::Duration::hours(1),
        )
        .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fragments, vec!["hola, sigo interesado"]);
        assert_eq!(due[0].last_message_id.as_deref(), Some("wamid.1"));
    }

    #[tokio::test]
    async fn blank_content_is_rejected_with_400() {
        let tmp = TempDir::new().unwrap();
        let state = state(&tmp);

        let response = handle_inbound(State(state.clone()), Json(inbound("   ")))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let history =
            store::messages::recent_messages(&state.config, "biz-1", "+51999000111", 10).unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn valid_payload_returns_202() {
        let tmp = TempDir::new().unwrap();
        let state = state(&tmp);

        let response = handle_inbound(State(state), Json(inbound("hola")))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
