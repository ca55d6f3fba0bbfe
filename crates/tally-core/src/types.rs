use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("embedding has {got} dimensions, gallery expects {expected}")]
    InvalidEmbedding { expected: usize, got: usize },
    #[error("embedding has zero norm")]
    ZeroNormEmbedding,
    #[error("invalid identity: {0}")]
    InvalidIdentity(&'static str),
}

/// Face embedding vector (typically 512-dimensional, fixed by the provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions; returns 0.0 if either norm is zero.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// A registered person. Immutable once created; re-registration
/// replaces the whole record by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub embedding: Embedding,
    pub registered_at: DateTime<Utc>,
}

/// The two attendance event kinds. Tracked with independent cooldowns;
/// no ordering between them is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Entry,
    Exit,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Entry => "entry",
            EventType::Exit => "exit",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(EventType::Entry),
            "exit" => Ok(EventType::Exit),
            _ => Err(CoreError::InvalidIdentity("entry_type must be entry or exit")),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a query did or did not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Matched,
    BelowThreshold,
    AmbiguousMatch,
    EmptyGallery,
}

/// Result of matching one query vector against a gallery snapshot.
/// Transient — never persisted.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Best cosine similarity observed, 0.0 for an empty gallery.
    pub similarity: f32,
    pub decision: MatchDecision,
}

impl MatchOutcome {
    pub fn accepted(&self) -> bool {
        self.decision == MatchDecision::Matched
    }

    pub(crate) fn no_match(similarity: f32, decision: MatchDecision) -> Self {
        Self {
            id: None,
            name: None,
            similarity,
            decision,
        }
    }
}

/// One row of the diagnostic full-ranking output.
#[derive(Debug, Clone, Serialize)]
pub struct RankedMatch {
    pub id: String,
    pub name: String,
    pub similarity: f32,
    pub above_threshold: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn similarity_symmetric() {
        let a = Embedding::new(vec![0.3, -0.7, 0.2]);
        let b = Embedding::new(vec![0.9, 0.1, -0.4]);
        assert!((a.similarity(&b) - b.similarity(&a)).abs() < 1e-6);
    }

    #[test]
    fn event_type_round_trip() {
        assert_eq!("entry".parse::<EventType>().unwrap(), EventType::Entry);
        assert_eq!("exit".parse::<EventType>().unwrap(), EventType::Exit);
        assert!("lunch".parse::<EventType>().is_err());
        assert_eq!(EventType::Entry.as_str(), "entry");
    }
}
