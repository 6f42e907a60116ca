//! Injected embedding provider.
//!
//! MNEMONIC never trains or hosts an encoder; `embed()` is a capability
//! supplied by the collaborator. [`IdentityEmbedder`] is a pass-through
//! acceptable for testing — it is deterministic but carries no semantic
//! information and must not be used to back real recall.

/// Produces an embedding vector of a fixed dimension from text.
pub trait EmbeddingProvider: Send + Sync {
    /// Embedding dimension this provider produces.
    fn dim(&self) -> usize;

    /// Embed `text` into a vector of length `self.dim()`.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// A deterministic, semantically-empty embedder: hashes `text` into a
/// pseudo-random unit vector of the configured dimension. Same input always
/// yields the same output; unrelated inputs do not cluster meaningfully.
pub struct IdentityEmbedder {
    dim: usize,
}

impl IdentityEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl EmbeddingProvider for IdentityEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        for i in 0..self.dim {
            let h = xxhash_rust::xxh3::xxh3_64_with_seed(text.as_bytes(), i as u64);
            // Map to [-1, 1] so downstream cosine/Euclidean distance behaves sanely.
            let v = (h as f64 / u64::MAX as f64) * 2.0 - 1.0;
            out.push(v as f32);
        }
        out
    }
}
