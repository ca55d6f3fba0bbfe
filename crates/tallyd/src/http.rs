//! HTTP surface: single-shot capture, diagnostics, registry routes,
//! and the WebSocket upgrade.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tally_core::{best_match, rank_all, CoreError, EventType, Gallery, Identity};
use tally_store::{Store, StoreError};

use crate::dedup::Deduplicator;
use crate::pipeline::{run_frame, PipelineError};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::session::{self, PayloadError};

#[derive(Clone)]
pub struct AppState {
    pub gallery: Arc<Gallery>,
    pub store: Store,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub dedup: Arc<Deduplicator<Store>>,
    pub threshold: f32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ws", get(session::ws_handler))
        .route("/attendance/mark", post(mark))
        .route("/attendance", get(list_events))
        .route("/attendance/:id", delete(delete_event))
        .route("/recognize/debug", post(diagnose))
        .route("/users", post(register_user).get(list_users))
        .route("/users/:id", delete(delete_user))
        .with_state(state)
}

pub enum ApiError {
    BadRequest(String),
    Pipeline(PipelineError),
    Store(StoreError),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError::Pipeline(e)
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        ApiError::Pipeline(PipelineError::Provider(e))
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Pipeline(PipelineError::Core(e))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<PayloadError> for ApiError {
    fn from(e: PayloadError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Pipeline(e) => {
                let status = match e {
                    PipelineError::Provider(ProviderError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
                    PipelineError::Provider(ProviderError::Unavailable(_)) => {
                        StatusCode::BAD_GATEWAY
                    }
                    PipelineError::Provider(_) | PipelineError::Core(_) => StatusCode::BAD_REQUEST,
                    PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Collected multipart fields; routes pick what they need.
#[derive(Default)]
struct Fields {
    image: Option<Vec<u8>>,
    entry_type: Option<String>,
    threshold: Option<String>,
    user_id: Option<String>,
    name: Option<String>,
}

async fn collect_fields(mut multipart: Multipart) -> Result<Fields, ApiError> {
    let mut fields = Fields::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable image field: {e}")))?;
                fields.image = Some(bytes.to_vec());
            }
            "entry_type" | "threshold" | "user_id" | "name" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable {name} field: {e}")))?;
                match name.as_str() {
                    "entry_type" => fields.entry_type = Some(value),
                    "threshold" => fields.threshold = Some(value),
                    "user_id" => fields.user_id = Some(value),
                    _ => fields.name = Some(value),
                }
            }
            _ => {}
        }
    }
    Ok(fields)
}

impl Fields {
    fn image(&self) -> Result<&[u8], ApiError> {
        let image = self
            .image
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("missing image field".into()))?;
        session::sniff_image(image)?;
        Ok(image)
    }

    fn event_type(&self) -> Result<EventType, ApiError> {
        self.entry_type
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("missing entry_type field".into()))?
            .parse()
            .map_err(|_| ApiError::BadRequest("entry_type must be \"entry\" or \"exit\"".into()))
    }
}

/// Single-shot capture: same pipeline and response shapes as the
/// streaming channel, without a session.
async fn mark(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let fields = collect_fields(multipart).await?;
    let image = fields.image()?;
    let event_type = fields.event_type()?;

    let outcome = run_frame(
        state.provider.as_ref(),
        &state.gallery,
        &state.dedup,
        state.threshold,
        image,
        event_type,
        Utc::now(),
    )
    .await?;
    Ok(Json(outcome.to_json()))
}

/// Diagnostic surface: full ranked similarity list for the first
/// detected face, no dedup, no persistence.
async fn diagnose(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let fields = collect_fields(multipart).await?;
    let image = fields.image()?;
    let threshold = match fields.threshold.as_deref() {
        Some(raw) => raw
            .parse::<f32>()
            .map_err(|_| ApiError::BadRequest("threshold must be a number".into()))?,
        None => state.threshold,
    };

    let faces = match state.provider.extract(image).await {
        Ok(faces) => faces,
        Err(ProviderError::NoFaceDetected) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let Some(face) = faces.first() else {
        return Ok(Json(json!({ "error": "no face detected" })));
    };

    let snapshot = state.gallery.snapshot();
    let outcome = best_match(&face.embedding, &snapshot, threshold)?;
    let rows = rank_all(&face.embedding, &snapshot, threshold)?;

    let match_found = outcome.accepted();
    let best = if match_found {
        json!({
            "user_id": outcome.id,
            "name": outcome.name,
            "similarity": outcome.similarity,
        })
    } else {
        serde_json::Value::Null
    };

    Ok(Json(json!({
        "match_found": match_found,
        "best_match": best,
        "threshold": threshold,
        "all_similarities": rows
            .iter()
            .map(|row| json!({
                "user_id": row.id,
                "name": row.name,
                "similarity": row.similarity,
            }))
            .collect::<Vec<_>>(),
    })))
}

/// Register an identity: the image must contain exactly one face.
/// The gallery publishes only after the row is durable.
async fn register_user(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let fields = collect_fields(multipart).await?;
    let image = fields.image()?;
    let user_id = fields
        .user_id
        .clone()
        .ok_or_else(|| ApiError::BadRequest("missing user_id field".into()))?;
    let name = fields
        .name
        .clone()
        .ok_or_else(|| ApiError::BadRequest("missing name field".into()))?;

    let faces = match state.provider.extract(image).await {
        Ok(faces) => faces,
        Err(ProviderError::NoFaceDetected) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let face = match faces.len() {
        0 => {
            return Err(ApiError::BadRequest(
                "no face detected in registration image".into(),
            ))
        }
        1 => &faces[0],
        n => {
            return Err(ApiError::BadRequest(format!(
                "registration image must contain exactly one face, found {n}"
            )))
        }
    };

    let identity = Identity {
        id: user_id,
        name,
        embedding: face.embedding.clone(),
        registered_at: Utc::now(),
    };

    // Validate + publish, then persist; roll the gallery back if the
    // durable write fails.
    state.gallery.upsert(identity.clone())?;
    if let Err(e) = state.store.upsert_identity(&identity).await {
        state.gallery.remove(&identity.id);
        return Err(e.into());
    }

    tracing::info!(user_id = %identity.id, name = %identity.name, "identity registered");
    Ok(Json(json!({
        "message": "user registered",
        "user_id": identity.id,
        "name": identity.name,
    })))
}

async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let users: Vec<_> = state
        .store
        .list_identities()
        .await?
        .into_iter()
        .map(|identity| {
            json!({
                "user_id": identity.id,
                "name": identity.name,
                "registered_at": identity.registered_at,
            })
        })
        .collect();
    Ok(Json(json!({ "users": users })))
}

async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.gallery.remove(&id);
    let deleted = state.store.delete_identity(&id).await?;
    if deleted {
        tracing::info!(user_id = %id, "identity deleted");
    }
    // Historical attendance events are kept: deletion does not cascade.
    Ok(Json(json!({ "deleted": deleted })))
}

async fn list_events(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events: Vec<_> = state
        .store
        .list_events()
        .await?
        .into_iter()
        .map(|event| {
            json!({
                "event_id": event.event_id,
                "user_id": event.identity_id,
                "event_type": event.event_type,
                "timestamp": event.occurred_at,
                "similarity": event.confidence,
            })
        })
        .collect();
    Ok(Json(json!({ "events": events })))
}

async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.store.delete_event(id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}
