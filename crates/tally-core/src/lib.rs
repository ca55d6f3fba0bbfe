//! tally-core — Attendance matching engine.
//!
//! Holds the embedding gallery, the cosine similarity matcher and the
//! per-frame fan-out. Embedding extraction itself happens in an
//! external provider; this crate only works with fixed-length vectors.

pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod types;

pub use frame::process_frame;
pub use gallery::{Gallery, GallerySnapshot};
pub use matcher::{best_match, rank_all};
pub use types::{
    CoreError, Embedding, EventType, Identity, MatchDecision, MatchOutcome, RankedMatch,
};
