//! Per-frame fan-out over the matcher.

use crate::gallery::GallerySnapshot;
use crate::matcher::best_match;
use crate::types::{CoreError, Embedding, MatchOutcome};

/// Match every query vector extracted from one frame, preserving input
/// order. Performs no deduplication and no persistence; each call is
/// independent and read-only against the same snapshot.
///
/// Zero queries yield an empty vec — the caller is responsible for
/// surfacing "no face detected" distinctly from an empty success.
pub fn process_frame(
    queries: &[Embedding],
    snapshot: &GallerySnapshot,
    threshold: f32,
) -> Result<Vec<MatchOutcome>, CoreError> {
    queries
        .iter()
        .map(|query| best_match(query, snapshot, threshold))
        .collect()
}
