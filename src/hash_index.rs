//! C2 — HashBucketIndex: random-hyperplane LSH over embeddings.
//!
//! The hyperplanes themselves never change after construction, so they live
//! outside any lock. The bucket contents are the only mutable state, and sit
//! behind a single reader-writer lock over the whole table array rather than
//! one lock per table — a writer touches every table on each `add`/`remove`
//! anyway, so splitting the lock per table would only add overhead without
//! letting writers actually run concurrently with each other.

use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_chacha::ChaCha8Rng;

use crate::record::RecordId;

/// One table's random hyperplanes, normalized, immutable after construction.
struct Table {
    /// `hyperplanes[h]` is a unit vector of length `dim`.
    hyperplanes: Vec<Vec<f32>>,
}

impl Table {
    fn new(dim: usize, hyperplane_count: usize, rng: &mut ChaCha8Rng) -> Self {
        let hyperplanes = (0..hyperplane_count)
            .map(|_| {
                let mut v: Vec<f32> = (0..dim)
                    .map(|_| StandardNormal.sample(rng))
                    .collect();
                let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt();
                if norm > 0.0 {
                    v.iter_mut().for_each(|x| *x /= norm);
                }
                v
            })
            .collect();
        Self { hyperplanes }
    }

    fn signature(&self, vec: &[f32]) -> u64 {
        let mut sig: u64 = 0;
        for (i, plane) in self.hyperplanes.iter().enumerate() {
            let dot: f32 = plane.iter().zip(vec.iter()).map(|(a, b)| a * b).sum();
            if dot >= 0.0 {
                sig |= 1u64 << i;
            }
        }
        sig
    }
}

/// Approximate nearest-neighbour candidate generator using `T` independent
/// random-hyperplane hash tables.
pub struct HashBucketIndex {
    dim: usize,
    tables: Vec<Table>,
    /// `buckets[t]` is table `t`'s signature-to-ids map.
    buckets: RwLock<Vec<HashMap<u64, Vec<RecordId>>>>,
}

impl HashBucketIndex {
    pub fn new(dim: usize, table_count: usize, hyperplanes_per_table: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let tables: Vec<Table> = (0..table_count)
            .map(|_| Table::new(dim, hyperplanes_per_table, &mut rng))
            .collect();
        let buckets = RwLock::new((0..tables.len()).map(|_| HashMap::new()).collect());
        Self { dim, tables, buckets }
    }

    /// Insert `id` keyed by `vec`. No-op if `vec.len() != D`.
    pub fn add(&self, id: &RecordId, vec: &[f32]) {
        if vec.len() != self.dim {
            return;
        }
        let mut buckets = self.buckets.write();
        for (table, bucket_map) in self.tables.iter().zip(buckets.iter_mut()) {
            let sig = table.signature(vec);
            bucket_map.entry(sig).or_default().push(id.clone());
        }
    }

    /// Remove `id` (keyed by its original `vec`, needed to recompute which
    /// buckets it lives in). No-op if `vec.len() != D`.
    pub fn remove(&self, id: &RecordId, vec: &[f32]) {
        if vec.len() != self.dim {
            return;
        }
        let mut buckets = self.buckets.write();
        for (table, bucket_map) in self.tables.iter().zip(buckets.iter_mut()) {
            let sig = table.signature(vec);
            if let Some(bucket) = bucket_map.get_mut(&sig) {
                bucket.retain(|existing| existing != id);
                if bucket.is_empty() {
                    bucket_map.remove(&sig);
                }
            }
        }
    }

    /// Candidates ranked by collision count descending, ties broken by id
    /// ascending for determinism.
    pub fn query(&self, vec: &[f32], max_candidates: usize) -> Vec<RecordId> {
        self.query_with_scores(vec, max_candidates).into_iter().map(|(id, _)| id).collect()
    }

    /// As [`Self::query`] but keeps each candidate's collision count, so
    /// callers can break ties on a secondary key of their own (the
    /// retriever uses fitness as that secondary key).
    pub fn query_with_scores(&self, vec: &[f32], max_candidates: usize) -> Vec<(RecordId, usize)> {
        if vec.len() != self.dim || max_candidates == 0 {
            return Vec::new();
        }
        let mut collisions: HashMap<RecordId, usize> = HashMap::new();
        let buckets = self.buckets.read();
        for (table, bucket_map) in self.tables.iter().zip(buckets.iter()) {
            let sig = table.signature(vec);
            if let Some(bucket) = bucket_map.get(&sig) {
                for id in bucket {
                    *collisions.entry(id.clone()).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(RecordId, usize)> = collisions.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_candidates);
        ranked
    }
}
