//! Copy-on-write embedding gallery.
//!
//! Mutations build a fresh identity list and atomically swap the shared
//! `Arc`. Readers clone the `Arc` once per operation and match against
//! that snapshot; a matching call never observes a half-applied
//! registration or deletion.

use std::ops::Deref;
use std::sync::{Arc, RwLock};

use crate::types::{CoreError, Identity};

/// Immutable point-in-time view of the gallery.
#[derive(Debug, Clone)]
pub struct GallerySnapshot {
    identities: Arc<Vec<Identity>>,
}

impl Deref for GallerySnapshot {
    type Target = [Identity];

    fn deref(&self) -> &[Identity] {
        &self.identities
    }
}

/// All registered identities, keyed by `Identity::id`.
///
/// The recognition path only ever calls [`Gallery::snapshot`];
/// registration and deletion collaborators own the mutations.
pub struct Gallery {
    dim: usize,
    current: RwLock<Arc<Vec<Identity>>>,
}

impl Gallery {
    /// Create an empty gallery for embeddings of `dim` dimensions.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            current: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.current.read().expect("gallery lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace the identity keyed by its `id`.
    pub fn upsert(&self, identity: Identity) -> Result<(), CoreError> {
        if identity.id.trim().is_empty() {
            return Err(CoreError::InvalidIdentity("identity_id must not be empty"));
        }
        if identity.name.trim().is_empty() {
            return Err(CoreError::InvalidIdentity("display_name must not be empty"));
        }
        if identity.embedding.dim() != self.dim {
            return Err(CoreError::InvalidEmbedding {
                expected: self.dim,
                got: identity.embedding.dim(),
            });
        }
        if identity.embedding.norm() == 0.0 {
            return Err(CoreError::ZeroNormEmbedding);
        }

        let mut guard = self.current.write().expect("gallery lock poisoned");
        let mut next: Vec<Identity> = guard
            .iter()
            .filter(|existing| existing.id != identity.id)
            .cloned()
            .collect();
        next.push(identity);
        tracing::debug!(identities = next.len(), "gallery snapshot published");
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove an identity. Idempotent; returns whether anything was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.current.write().expect("gallery lock poisoned");
        if !guard.iter().any(|existing| existing.id == id) {
            return false;
        }
        let next: Vec<Identity> = guard
            .iter()
            .filter(|existing| existing.id != id)
            .cloned()
            .collect();
        tracing::debug!(identities = next.len(), "gallery snapshot published");
        *guard = Arc::new(next);
        true
    }

    /// Take a consistent snapshot. O(1): clones the current `Arc`.
    /// Subsequent mutations are visible only from the next snapshot.
    pub fn snapshot(&self) -> GallerySnapshot {
        GallerySnapshot {
            identities: Arc::clone(&self.current.read().expect("gallery lock poisoned")),
        }
    }
}
