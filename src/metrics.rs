//! C7 — Metrics: thread-safe counters and a latency histogram.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::record::RetrievalPath;

/// Fixed bucket boundaries (nanoseconds), chosen for the
/// sub-millisecond-to-second range MNEMONIC's cascade operates in. A
/// fixed-bucket histogram rather than a sketch, since percentile reads
/// are never on the retrieve hot path.
const BUCKET_BOUNDS_NS: &[u64] = &[
    1_000,       // 1us
    10_000,      // 10us
    50_000,      // 50us
    100_000,     // 100us
    500_000,     // 500us
    1_000_000,   // 1ms
    5_000_000,   // 5ms
    10_000_000,  // 10ms
    50_000_000,  // 50ms
    100_000_000, // 100ms
    500_000_000, // 500ms
    1_000_000_000, // 1s
    u64::MAX,
];

struct LatencyHistogram {
    buckets: Vec<AtomicU64>,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: (0..BUCKET_BOUNDS_NS.len()).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn record(&self, latency_ns: u64) {
        let idx = BUCKET_BOUNDS_NS
            .iter()
            .position(|&bound| latency_ns <= bound)
            .unwrap_or(BUCKET_BOUNDS_NS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, p: f64) -> u64 {
        let counts: Vec<u64> = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * p).ceil() as u64;
        let mut seen = 0u64;
        for (idx, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                return BUCKET_BOUNDS_NS[idx];
            }
        }
        BUCKET_BOUNDS_NS[BUCKET_BOUNDS_NS.len() - 1]
    }
}

/// Point-in-time snapshot of [`Metrics`], safe to serialize/return to a
/// collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub experiences_stored_total: u64,
    pub experiences_per_agent: HashMap<String, u64>,
    pub experiences_per_tier: HashMap<u8, u64>,
    pub retrievals_total: u64,
    pub retrievals_exact: u64,
    pub retrievals_hash: u64,
    pub retrievals_graph: u64,
    pub retrievals_empty: u64,
    pub cache_hit_rate: f64,
    pub latency_p50_ns: u64,
    pub latency_p95_ns: u64,
    pub latency_p99_ns: u64,
}

/// Thread-safe counters and latency histogram for MNEMONIC.
pub struct Metrics {
    experiences_stored_total: AtomicU64,
    experiences_per_agent: RwLock<HashMap<String, u64>>,
    experiences_per_tier: RwLock<HashMap<u8, u64>>,
    retrievals_total: AtomicU64,
    retrievals_exact: AtomicU64,
    retrievals_hash: AtomicU64,
    retrievals_graph: AtomicU64,
    retrievals_empty: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            experiences_stored_total: AtomicU64::new(0),
            experiences_per_agent: RwLock::new(HashMap::new()),
            experiences_per_tier: RwLock::new(HashMap::new()),
            retrievals_total: AtomicU64::new(0),
            retrievals_exact: AtomicU64::new(0),
            retrievals_hash: AtomicU64::new(0),
            retrievals_graph: AtomicU64::new(0),
            retrievals_empty: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    pub fn record_store(&self, agent_id: &str, tier: u8) {
        self.experiences_stored_total.fetch_add(1, Ordering::Relaxed);
        *self.experiences_per_agent.write().entry(agent_id.to_string()).or_insert(0) += 1;
        *self.experiences_per_tier.write().entry(tier).or_insert(0) += 1;
    }

    pub fn record_supersede(&self, old_agent_id: &str, old_tier: u8) {
        self.experiences_stored_total.fetch_sub(1, Ordering::Relaxed);
        if let Some(count) = self.experiences_per_agent.write().get_mut(old_agent_id) {
            *count = count.saturating_sub(1);
        }
        if let Some(count) = self.experiences_per_tier.write().get_mut(&old_tier) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn record_remove(&self, agent_id: &str, tier: u8) {
        self.record_supersede(agent_id, tier);
    }

    pub fn record_retrieval(&self, path: RetrievalPath, latency_ns: u64) {
        self.retrievals_total.fetch_add(1, Ordering::Relaxed);
        match path {
            RetrievalPath::Exact => self.retrievals_exact.fetch_add(1, Ordering::Relaxed),
            RetrievalPath::Hash => self.retrievals_hash.fetch_add(1, Ordering::Relaxed),
            RetrievalPath::Graph => self.retrievals_graph.fetch_add(1, Ordering::Relaxed),
            RetrievalPath::Empty => self.retrievals_empty.fetch_add(1, Ordering::Relaxed),
        };
        self.latency.record(latency_ns);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let retrievals_total = self.retrievals_total.load(Ordering::Relaxed);
        let retrievals_exact = self.retrievals_exact.load(Ordering::Relaxed);
        let cache_hit_rate = if retrievals_total == 0 {
            0.0
        } else {
            retrievals_exact as f64 / retrievals_total as f64
        };
        MetricsSnapshot {
            experiences_stored_total: self.experiences_stored_total.load(Ordering::Relaxed),
            experiences_per_agent: self.experiences_per_agent.read().clone(),
            experiences_per_tier: self.experiences_per_tier.read().clone(),
            retrievals_total,
            retrievals_exact,
            retrievals_hash: self.retrievals_hash.load(Ordering::Relaxed),
            retrievals_graph: self.retrievals_graph.load(Ordering::Relaxed),
            retrievals_empty: self.retrievals_empty.load(Ordering::Relaxed),
            cache_hit_rate,
            latency_p50_ns: self.latency.percentile(0.50),
            latency_p95_ns: self.latency.percentile(0.95),
            latency_p99_ns: self.latency.percentile(0.99),
        }
    }
}
