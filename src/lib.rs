//! # mnemonic-core — in-process experience-memory engine
//!
//! MNEMONIC stores per-agent learning traces as high-dimensional vectors
//! and retrieves them under strict sub-linear latency bounds via a tiered
//! cascade: a probabilistic membership test, a random-hyperplane hash
//! index, and a hierarchical proximity graph.
//!
//! ## Design principles
//!
//! 1. **Cascade-first**: cheapest check (C1) before approximate (C2) before
//!    semantic (C3); every stage is a plain no-I/O lookup.
//! 2. **Injected dependencies**: [`Clock`] and [`EmbeddingProvider`] keep the
//!    core deterministic and free of direct `SystemTime`/ML calls.
//! 3. **Deterministic reconstruction**: all randomness (hyperplanes, graph
//!    levels) derives from two seeds carried in [`MnemonicConfig`].
//! 4. **No async runtime**: the retrieve path suspends only at lock
//!    acquisition; the background evolve pass is a plain OS thread.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mnemonic_core::{Mnemonic, Query, Record};
//!
//! # fn example() -> mnemonic_core::Result<()> {
//! let mnemonic = Mnemonic::in_memory()?;
//! let embedding = mnemonic.embed("how do I retry a flaky network call");
//!
//! mnemonic.store(Record {
//!     id: "exp-1".into(),
//!     agent_id: "APEX".into(),
//!     tier: 1,
//!     fingerprint: "retry-flaky-network".into(),
//!     input: "retry a flaky network call".into(),
//!     output: "exponential backoff with jitter".into(),
//!     strategy: "backoff".into(),
//!     embedding,
//!     fitness: 0.6,
//!     created_at: 0,
//!     last_access_at: 0,
//!     usage_count: 0,
//!     generation: 0,
//! })?;
//!
//! let mut query = Query::new("APEX", 1);
//! query.embedding = Some(mnemonic.embed("flaky network call retry"));
//! let result = mnemonic.retrieve(&query)?;
//! assert!(!result.records.is_empty());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod clock;
pub mod config;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod graph;
pub mod hash_index;
pub mod metrics;
pub mod record;
pub mod reflect;
pub mod retriever;
pub mod store;

// ============================================================================
// Re-exports
// ============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MnemonicConfig;
pub use embedding::{EmbeddingProvider, IdentityEmbedder};
pub use error::{MnemonicError, Result};
pub use metrics::MetricsSnapshot;
pub use record::{
    AgentId, Outcome, Query, Record, RecordId, ReflectOutcome, RemoveOutcome, RetrievalPath, RetrievalResult,
    StoreOutcome, COLLECTIVE_AGENT,
};

use std::sync::Arc;

use tracing::info;

use filter::MembershipFilter;
use graph::ProximityGraph;
use hash_index::HashBucketIndex;
use metrics::Metrics;
use reflect::ReflectLoop;
use retriever::Retriever;
use store::ExperienceStore;

/// The primary entry point. Wraps the full C1–C7 cascade behind a small
/// store/remove/retrieve/reflect API.
pub struct Mnemonic {
    retriever: Retriever,
    reflect_loop: Arc<ReflectLoop>,
    embedder: Arc<dyn EmbeddingProvider>,
    metrics: Arc<Metrics>,
    dim: usize,
}

impl Mnemonic {
    /// Build a new instance from `config`, an injected embedding provider
    /// and clock. Starts the background evolve thread immediately.
    pub fn new(config: MnemonicConfig, embedder: Arc<dyn EmbeddingProvider>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ExperienceStore::new());
        let filter = Arc::new(MembershipFilter::new(config.expected_n, config.p_false_positive));
        let hash_index = Arc::new(HashBucketIndex::new(
            config.dim,
            config.hash_tables,
            config.hyperplanes,
            config.hyperplane_seed,
        ));
        let graph = Arc::new(ProximityGraph::new(
            config.dim,
            config.graph_degree,
            config.ef_construction,
            config.ef_search,
            config.level_seed,
        ));
        let metrics = Arc::new(Metrics::new());

        let retriever = Retriever::new(
            config.dim,
            Arc::clone(&store),
            Arc::clone(&filter),
            Arc::clone(&hash_index),
            Arc::clone(&graph),
            Arc::clone(&metrics),
            Arc::clone(&clock),
        );

        let reflect_loop = Arc::new(ReflectLoop::new(
            store,
            filter,
            hash_index,
            graph,
            Arc::clone(&metrics),
            clock,
            config.alpha,
            config.tau_promote,
            config.max_per_agent,
            config.evolve_interval,
        ));
        reflect_loop.start();

        info!(dim = config.dim, max_per_agent = config.max_per_agent, "mnemonic core constructed");

        Ok(Self {
            retriever,
            reflect_loop,
            embedder,
            metrics,
            dim: config.dim,
        })
    }

    /// Default configuration, an [`IdentityEmbedder`] and a [`SystemClock`]
    /// — useful for smoke tests and standalone embedding.
    pub fn in_memory() -> Result<Self> {
        let config = MnemonicConfig::default();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(IdentityEmbedder::new(config.dim));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        Self::new(config, embedder, clock)
    }

    /// Embedding dimension this instance was configured with.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `embed(text) → vector of length D` via the injected provider.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        self.embedder.embed(text)
    }

    /// Insert or fingerprint-supersede a record.
    pub fn store(&self, record: Record) -> Result<StoreOutcome> {
        self.retriever.store(record)
    }

    /// Remove a record from C4/C2/C3.
    pub fn remove(&self, id: &RecordId) -> RemoveOutcome {
        self.retriever.remove(id)
    }

    /// Run the C1→C2→C3 cascade.
    pub fn retrieve(&self, query: &Query) -> Result<RetrievalResult> {
        self.retriever.retrieve(query)
    }

    /// As [`Self::retrieve`], polling `should_continue` between cascade
    /// stages and C3 beam expansions for cooperative cancellation.
    pub fn retrieve_cancellable(&self, query: &Query, should_continue: &dyn Fn() -> bool) -> Result<RetrievalResult> {
        self.retriever.retrieve_cancellable(query, should_continue)
    }

    /// Update a record's fitness by the outcome EMA.
    pub fn reflect(&self, record_id: &RecordId, outcome: Outcome) -> Result<ReflectOutcome> {
        self.reflect_loop.reflect(record_id, outcome)
    }

    /// Mirror breakthrough records into the collective pool immediately,
    /// outside the scheduled `evolve()` cadence.
    pub fn promote_breakthroughs(&self) -> usize {
        self.reflect_loop.promote_breakthroughs()
    }

    /// Run one maintenance pass immediately, outside the scheduled cadence.
    pub fn evolve(&self) {
        self.reflect_loop.evolve();
    }

    /// Thread-safe counters and latency histogram.
    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the background evolve thread and join it. Also runs on drop.
    pub fn shutdown(&self) {
        self.reflect_loop.shutdown();
    }
}
