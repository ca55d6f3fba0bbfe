//! The per-frame recognition pipeline shared by the streaming session,
//! the single-shot mark endpoint and (minus dedup) diagnostics:
//! provider → frame processor → deduplicator → tagged outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tally_core::{process_frame, EventType, Gallery, MatchOutcome};
use tally_store::StoreError;
use thiserror::Error;

use crate::dedup::{Deduplicator, EventSink};
use crate::provider::{EmbeddingProvider, ProviderError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("matching failed: {0}")]
    Core(#[from] tally_core::CoreError),
    #[error("attendance could not be recorded: {0}")]
    Store(#[from] StoreError),
}

/// Per-face outcome, shaped for the client.
#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    pub message: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub similarity: f32,
}

/// One response per inbound frame, resolved before serialization.
#[derive(Debug)]
pub enum FrameOutcome {
    NoFace,
    Single(FaceReport),
    Multiple(Vec<FaceReport>),
}

impl FrameOutcome {
    /// Wire shape: the legacy single-identity object, the multi-user
    /// envelope, or the distinct no-face condition.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FrameOutcome::NoFace => json!({ "error": "no face detected" }),
            FrameOutcome::Single(report) => json!(report),
            FrameOutcome::Multiple(reports) => json!({
                "multiple_users": true,
                "users": reports,
            }),
        }
    }
}

/// Run one frame end to end. `now` is passed in so cooldown decisions
/// are deterministic under test.
pub async fn run_frame<S: EventSink>(
    provider: &dyn EmbeddingProvider,
    gallery: &Gallery,
    dedup: &Deduplicator<S>,
    threshold: f32,
    image: &[u8],
    event_type: EventType,
    now: DateTime<Utc>,
) -> Result<FrameOutcome, PipelineError> {
    let faces = match provider.extract(image).await {
        Ok(faces) => faces,
        Err(ProviderError::NoFaceDetected) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    if faces.is_empty() {
        return Ok(FrameOutcome::NoFace);
    }

    let queries: Vec<_> = faces.into_iter().map(|face| face.embedding).collect();
    let snapshot = gallery.snapshot();
    let outcomes = process_frame(&queries, &snapshot, threshold)?;

    let mut reports = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        reports.push(resolve(dedup, outcome, event_type, now).await?);
    }

    if reports.len() == 1 {
        Ok(FrameOutcome::Single(reports.remove(0)))
    } else {
        Ok(FrameOutcome::Multiple(reports))
    }
}

async fn resolve<S: EventSink>(
    dedup: &Deduplicator<S>,
    outcome: MatchOutcome,
    event_type: EventType,
    now: DateTime<Utc>,
) -> Result<FaceReport, PipelineError> {
    if !outcome.accepted() {
        return Ok(FaceReport {
            message: "face not recognized".to_string(),
            user_id: None,
            name: None,
            timestamp: None,
            similarity: outcome.similarity,
        });
    }

    // accepted() guarantees id/name are present.
    let id = outcome.id.unwrap_or_default();
    let name = outcome.name.unwrap_or_default();

    let decision = dedup.decide(&id, event_type, outcome.similarity, now).await?;
    let message = if decision.accepted {
        format!("{event_type} marked")
    } else {
        "already marked".to_string()
    };

    Ok(FaceReport {
        message,
        user_id: Some(id),
        name: Some(name),
        timestamp: Some(decision.marked_at),
        similarity: outcome.similarity,
    })
}
