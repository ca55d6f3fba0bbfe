//! Cosine similarity matching against a gallery snapshot.
//!
//! Read-only and side-effect free: any number of matching calls can
//! fan out over the same snapshot concurrently.

use crate::gallery::GallerySnapshot;
use crate::types::{CoreError, Embedding, MatchDecision, MatchOutcome, RankedMatch};

/// Match one query vector against every identity in the snapshot.
///
/// Always traverses the full gallery. A tie at the maximum similarity
/// is reported as ambiguous rather than picking an arbitrary identity.
pub fn best_match(
    query: &Embedding,
    snapshot: &GallerySnapshot,
    threshold: f32,
) -> Result<MatchOutcome, CoreError> {
    if query.norm() == 0.0 {
        return Err(CoreError::ZeroNormEmbedding);
    }
    if snapshot.is_empty() {
        return Ok(MatchOutcome::no_match(0.0, MatchDecision::EmptyGallery));
    }

    let mut best_sim = f32::NEG_INFINITY;
    let mut best_idx = 0usize;
    let mut tied = 0usize;

    for (i, identity) in snapshot.iter().enumerate() {
        if identity.embedding.dim() != query.dim() {
            return Err(CoreError::InvalidEmbedding {
                expected: identity.embedding.dim(),
                got: query.dim(),
            });
        }
        let sim = query.similarity(&identity.embedding);
        if sim > best_sim {
            best_sim = sim;
            best_idx = i;
            tied = 1;
        } else if sim == best_sim {
            tied += 1;
        }
    }

    if best_sim < threshold {
        return Ok(MatchOutcome::no_match(best_sim, MatchDecision::BelowThreshold));
    }
    if tied > 1 {
        tracing::debug!(tied, similarity = best_sim, "ambiguous match at maximum");
        return Ok(MatchOutcome::no_match(best_sim, MatchDecision::AmbiguousMatch));
    }

    let winner = &snapshot[best_idx];
    Ok(MatchOutcome {
        id: Some(winner.id.clone()),
        name: Some(winner.name.clone()),
        similarity: best_sim,
        decision: MatchDecision::Matched,
    })
}

/// Diagnostic variant: full ranked similarity list against every
/// identity. Flags each row against the threshold but makes no
/// acceptance decision.
pub fn rank_all(
    query: &Embedding,
    snapshot: &GallerySnapshot,
    threshold: f32,
) -> Result<Vec<RankedMatch>, CoreError> {
    if query.norm() == 0.0 {
        return Err(CoreError::ZeroNormEmbedding);
    }

    let mut rows: Vec<RankedMatch> = snapshot
        .iter()
        .map(|identity| {
            let similarity = query.similarity(&identity.embedding);
            RankedMatch {
                id: identity.id.clone(),
                name: identity.name.clone(),
                similarity,
                above_threshold: similarity >= threshold,
            }
        })
        .collect();
    rows.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    Ok(rows)
}
