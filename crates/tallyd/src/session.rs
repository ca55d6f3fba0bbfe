//! Streaming session manager.
//!
//! One WebSocket per client. The loop is sequential: frame N+1 is not
//! read until frame N's response has been sent, preserving per-client
//! ordering. A bad frame gets a structured `{error}` reply and the
//! session stays open; only disconnect or an explicit close ends it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tally_core::EventType;
use thiserror::Error;

use crate::http::AppState;
use crate::pipeline::run_frame;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("image payload is not valid base64")]
    Base64,
    #[error("image payload is not a well-formed image")]
    NotAnImage,
}

/// Inbound frame: a data-URL image plus the requested event kind.
#[derive(Deserialize)]
struct FramePayload {
    image: String,
    entry_type: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session_loop(socket, state))
}

async fn session_loop(mut socket: WebSocket, state: AppState) {
    tracing::info!("streaming session open");
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                let reply = handle_frame(&state, &text).await;
                if socket.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; axum answers
            // pings itself.
            _ => {}
        }
    }
    tracing::info!("streaming session closed");
}

/// Process one inbound frame; always produces exactly one reply.
/// Every failure is reported on the channel, never by dropping it.
async fn handle_frame(state: &AppState, text: &str) -> serde_json::Value {
    let payload: FramePayload = match serde_json::from_str(text) {
        Ok(payload) => payload,
        Err(e) => return json!({ "error": format!("malformed frame: {e}") }),
    };

    let event_type: EventType = match payload.entry_type.parse() {
        Ok(event_type) => event_type,
        Err(_) => return json!({ "error": "entry_type must be \"entry\" or \"exit\"" }),
    };

    let image = match decode_image_payload(&payload.image) {
        Ok(image) => image,
        Err(e) => return json!({ "error": e.to_string() }),
    };

    match run_frame(
        state.provider.as_ref(),
        &state.gallery,
        &state.dedup,
        state.threshold,
        &image,
        event_type,
        chrono::Utc::now(),
    )
    .await
    {
        Ok(outcome) => outcome.to_json(),
        Err(e) => {
            tracing::warn!(error = %e, "frame processing failed");
            json!({ "error": e.to_string() })
        }
    }
}

/// Decode a `data:image/...;base64,` payload (bare base64 is also
/// accepted) and check the bytes carry a known image magic before
/// anything reaches the provider.
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>, PayloadError> {
    let encoded = match payload.split_once(',') {
        Some((header, rest)) if header.starts_with("data:") => rest,
        _ => payload,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| PayloadError::Base64)?;
    sniff_image(&bytes)?;
    Ok(bytes)
}

/// Cheap format check on magic bytes; no pixel decoding.
pub fn sniff_image(bytes: &[u8]) -> Result<(), PayloadError> {
    image::guess_format(bytes)
        .map(|_| ())
        .map_err(|_| PayloadError::NotAnImage)
}
