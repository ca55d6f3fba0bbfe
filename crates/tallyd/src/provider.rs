//! External embedding provider client.
//!
//! The provider is a black box: raw image bytes in, zero or more
//! detected faces (embedding vector + bounding box) out. Face
//! detection and embedding extraction never happen in this process.

use async_trait::async_trait;
use serde::Deserialize;
use tally_core::Embedding;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("image payload is not a well-formed image")]
    Decode,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("embedding provider timed out")]
    Timeout,
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
}

/// Face bounding box as reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One detected face: its embedding and where it sits in the frame.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub embedding: Embedding,
    /// Reserved for overlay rendering; recognition ignores placement.
    #[allow(dead_code)]
    pub bounding_box: BoundingBox,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Extract all face embeddings from one image.
    ///
    /// An empty vec and `Err(NoFaceDetected)` are equivalent; callers
    /// treat both as the "no face detected" condition.
    async fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError>;
}

#[derive(Deserialize)]
struct WireFace {
    embedding: Vec<f32>,
    #[serde(rename = "box")]
    bounding_box: BoundingBox,
}

#[derive(Deserialize)]
struct WireResponse {
    faces: Vec<WireFace>,
}

/// HTTP client for the provider endpoint.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpEmbeddingProvider {
    /// Build a client with a hard per-call timeout; expiry surfaces as
    /// `ProviderError::Timeout`, never a crash.
    pub fn new(url: String, timeout: std::time::Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Unavailable(e.to_string())
                }
            })?;

        match response.status() {
            reqwest::StatusCode::BAD_REQUEST => return Err(ProviderError::Decode),
            reqwest::StatusCode::UNPROCESSABLE_ENTITY => return Err(ProviderError::NoFaceDetected),
            status if !status.is_success() => {
                return Err(ProviderError::Unavailable(format!(
                    "provider returned {status}"
                )));
            }
            _ => {}
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("bad provider response: {e}")))?;

        tracing::debug!(faces = wire.faces.len(), "embedding provider responded");

        Ok(wire
            .faces
            .into_iter()
            .map(|face| DetectedFace {
                embedding: Embedding::new(face.embedding),
                bounding_box: face.bounding_box,
            })
            .collect())
    }
}
