//! C5 — Retriever: orchestrates the C1→C2→C3 cascade, applies the filter
//! predicate, and keeps access statistics current.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::clock::Clock;
use crate::error::{MnemonicError, Result};
use crate::filter::MembershipFilter;
use crate::graph::ProximityGraph;
use crate::hash_index::HashBucketIndex;
use crate::metrics::Metrics;
use crate::record::{Query, Record, RecordId, RemoveOutcome, RetrievalPath, RetrievalResult, StoreOutcome};
use crate::store::ExperienceStore;

pub struct Retriever {
    dim: usize,
    store: Arc<ExperienceStore>,
    filter: Arc<MembershipFilter>,
    hash_index: Arc<HashBucketIndex>,
    graph: Arc<ProximityGraph>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl Retriever {
    pub fn new(
        dim: usize,
        store: Arc<ExperienceStore>,
        filter: Arc<MembershipFilter>,
        hash_index: Arc<HashBucketIndex>,
        graph: Arc<ProximityGraph>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { dim, store, filter, hash_index, graph, metrics, clock }
    }

    /// Insert `record` and fan the write out to C1/C2/C3.
    pub fn store(&self, record: Record) -> Result<StoreOutcome> {
        if record.id.is_empty() {
            return Err(MnemonicError::invalid("record id must not be empty"));
        }
        if record.fingerprint.is_empty() {
            return Err(MnemonicError::invalid("record fingerprint must not be empty"));
        }
        if record.has_embedding() && record.embedding.len() != self.dim {
            return Err(MnemonicError::invalid("embedding length does not match configured dimension"));
        }

        let existing = self.store.by_fingerprint(&record.fingerprint);
        let outcome = self.store.put(record.clone())?;

        if let StoreOutcome::Superseded(old_id) = &outcome {
            if let Some(old) = existing.filter(|r| &r.id == old_id) {
                if old.has_embedding() {
                    self.hash_index.remove(&old.id, &old.embedding);
                    self.graph.remove(&old.id);
                }
                self.metrics.record_supersede(&old.agent_id, old.tier);
            }
        }

        self.filter.add(&record.fingerprint);
        if record.has_embedding() {
            self.hash_index.add(&record.id, &record.embedding);
            self.graph.add(record.id.clone(), record.embedding.clone());
        }
        self.metrics.record_store(&record.agent_id, record.tier);
        info!(id = %record.id, agent_id = %record.agent_id, superseded = ?outcome, "record stored");
        Ok(outcome)
    }

    /// Remove `id` from C4, C2 and C3. C1 is never decremented — a Bloom
    /// filter can't drop a single bit without risking a false negative for
    /// some other fingerprint hashed into the same position.
    pub fn remove(&self, id: &RecordId) -> RemoveOutcome {
        let Some(existing) = self.store.get(id) else { return RemoveOutcome::NotFound };
        let outcome = self.store.remove(id);
        if matches!(outcome, RemoveOutcome::Ok) {
            if existing.has_embedding() {
                self.hash_index.remove(id, &existing.embedding);
                self.graph.remove(id);
            }
            self.metrics.record_remove(&existing.agent_id, existing.tier);
            info!(id = %id, agent_id = %existing.agent_id, "record removed");
        }
        outcome
    }

    pub fn retrieve(&self, query: &Query) -> Result<RetrievalResult> {
        self.retrieve_cancellable(query, &|| true)
    }

    /// As [`Self::retrieve`] but polls `should_continue` between cascade
    /// stages and before each C3 beam expansion, for cooperative
    /// cancellation.
    pub fn retrieve_cancellable(&self, query: &Query, should_continue: &dyn Fn() -> bool) -> Result<RetrievalResult> {
        if query.k < 1 {
            return Err(MnemonicError::invalid("k must be >= 1"));
        }

        let start = self.clock.now_ns();
        let elapsed = |clock: &Arc<dyn Clock>| clock.now_ns().saturating_sub(start);

        if !should_continue() {
            return Ok(RetrievalResult::cancelled(elapsed(&self.clock)));
        }

        // Exact path: C1 short-circuit via C4's fingerprint index.
        trace!(agent_id = %query.agent_id, "attempting exact-match path");
        if let Some(fp) = &query.fingerprint {
            if self.filter.contains(fp) {
                if let Some(record) = self.store.by_fingerprint(fp) {
                    if self.passes(&record, query) {
                        self.touch(&record.id);
                        let latency = elapsed(&self.clock);
                        self.metrics.record_retrieval(RetrievalPath::Exact, latency);
                        debug!(agent_id = %query.agent_id, id = %record.id, latency_ns = latency, "exact retrieval succeeded");
                        return Ok(RetrievalResult {
                            records: vec![record],
                            path: RetrievalPath::Exact,
                            candidates_examined: 1,
                            latency_ns: latency,
                            cancelled: false,
                        });
                    }
                }
            }
        }

        if !should_continue() {
            return Ok(RetrievalResult::cancelled(elapsed(&self.clock)));
        }

        // Hash path: C2 approximate candidates, ranked by collision count
        // then fitness.
        trace!(agent_id = %query.agent_id, "attempting hash path");
        if let Some(embedding) = &query.embedding {
            if embedding.len() == self.dim {
                let scored = self.hash_index.query_with_scores(embedding, 3 * query.k);
                let mut examined = 0usize;
                let mut collected: Vec<(Record, usize)> = Vec::new();
                for (id, count) in &scored {
                    examined += 1;
                    if let Some(r) = self.store.get(id) {
                        if self.passes(&r, query) {
                            collected.push((r, *count));
                            if collected.len() == query.k {
                                break;
                            }
                        }
                    }
                }
                if !collected.is_empty() {
                    collected.sort_by(|a, b| {
                        b.1.cmp(&a.1)
                            .then_with(|| b.0.fitness.partial_cmp(&a.0.fitness).unwrap_or(Ordering::Equal))
                    });
                    let records: Vec<Record> = collected.into_iter().map(|(r, _)| r).collect();
                    for r in &records {
                        self.touch(&r.id);
                    }
                    let latency = elapsed(&self.clock);
                    self.metrics.record_retrieval(RetrievalPath::Hash, latency);
                    debug!(agent_id = %query.agent_id, count = records.len(), latency_ns = latency, "hash retrieval succeeded");
                    return Ok(RetrievalResult {
                        records,
                        path: RetrievalPath::Hash,
                        candidates_examined: examined,
                        latency_ns: latency,
                        cancelled: false,
                    });
                }
            }
        }

        if !should_continue() {
            return Ok(RetrievalResult::cancelled(elapsed(&self.clock)));
        }

        // Graph path: C3 semantic search, already distance-ordered.
        trace!(agent_id = %query.agent_id, "attempting graph path");
        if let Some(embedding) = &query.embedding {
            if embedding.len() == self.dim {
                let candidate_ids = self.graph.search_cancellable(embedding, 3 * query.k, should_continue);
                let mut examined = 0usize;
                let mut collected: Vec<Record> = Vec::new();
                for id in &candidate_ids {
                    examined += 1;
                    if let Some(r) = self.store.get(id) {
                        if self.passes(&r, query) {
                            collected.push(r);
                            if collected.len() == query.k {
                                break;
                            }
                        }
                    }
                }
                if !collected.is_empty() {
                    for r in &collected {
                        self.touch(&r.id);
                    }
                    let latency = elapsed(&self.clock);
                    self.metrics.record_retrieval(RetrievalPath::Graph, latency);
                    debug!(agent_id = %query.agent_id, count = collected.len(), latency_ns = latency, "graph retrieval succeeded");
                    return Ok(RetrievalResult {
                        records: collected,
                        path: RetrievalPath::Graph,
                        candidates_examined: examined,
                        latency_ns: latency,
                        cancelled: false,
                    });
                }
            }
        }

        let latency = elapsed(&self.clock);
        self.metrics.record_retrieval(RetrievalPath::Empty, latency);
        Ok(RetrievalResult::empty(RetrievalPath::Empty, latency))
    }

    /// Filter predicate: fitness floor, age ceiling, and scope match.
    fn passes(&self, r: &Record, q: &Query) -> bool {
        if r.fitness < q.min_fitness {
            return false;
        }
        if let Some(max_age) = q.max_age_ns {
            let now = self.clock.now_ns();
            if now.saturating_sub(r.created_at) > max_age {
                return false;
            }
        }
        r.agent_id == q.agent_id || (q.include_tier && r.tier == q.tier) || (q.include_collective && r.is_collective())
    }

    fn touch(&self, id: &RecordId) {
        self.store.touch(id, self.clock.now_ns());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn sample(id: &str, agent: &str, tier: u8, fp: &str, embedding: Vec<f32>, fitness: f64) -> Record {
        Record {
            id: id.to_string(),
            agent_id: agent.to_string(),
            tier,
            fingerprint: fp.to_string(),
            input: String::new(),
            output: String::new(),
            strategy: String::new(),
            embedding,
            fitness,
            created_at: 0,
            last_access_at: 0,
            usage_count: 0,
            generation: 0,
        }
    }

    fn build(dim: usize) -> Retriever {
        let store = Arc::new(ExperienceStore::new());
        let filter = Arc::new(MembershipFilter::new(1000, 0.01));
        let hash_index = Arc::new(HashBucketIndex::new(dim, 6, 8, 1));
        let graph = Arc::new(ProximityGraph::new(dim, 16, 200, 100, 2));
        let metrics = Arc::new(Metrics::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        Retriever::new(dim, store, filter, hash_index, graph, metrics, clock)
    }

    #[test]
    fn exact_match_short_circuits() {
        let r = build(4);
        r.store(sample("a", "APEX", 1, "fp1", vec![1.0, 0.0, 0.0, 0.0], 0.5)).unwrap();
        let mut q = Query::new("APEX", 1);
        q.fingerprint = Some("fp1".to_string());
        q.k = 5;
        let result = r.retrieve(&q).unwrap();
        assert_eq!(result.path, RetrievalPath::Exact);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].id, "a");
        assert_eq!(result.candidates_examined, 1);
    }

    #[test]
    fn hash_path_recalls_similar_vectors() {
        let r = build(4);
        r.store(sample("a", "X", 1, "fp-a", vec![1.0, 0.0, 0.0, 0.0], 0.7)).unwrap();
        r.store(sample("b", "X", 1, "fp-b", vec![0.99, 0.01, 0.0, 0.0], 0.8)).unwrap();
        r.store(sample("c", "X", 1, "fp-c", vec![0.0, 0.0, 0.0, 1.0], 0.9)).unwrap();

        let mut q = Query::new("X", 1);
        q.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        q.k = 2;
        let result = r.retrieve(&q).unwrap();
        assert!(matches!(result.path, RetrievalPath::Hash | RetrievalPath::Graph));
        let ids: Vec<&str> = result.records.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"a"));
    }

    #[test]
    fn min_fitness_filters_out_low_scorers() {
        let r = build(4);
        r.store(sample("a", "X", 1, "fp-a", vec![1.0, 0.0, 0.0, 0.0], 0.2)).unwrap();
        let mut q = Query::new("X", 1);
        q.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        q.min_fitness = 0.9;
        q.k = 3;
        let result = r.retrieve(&q).unwrap();
        assert!(result.records.is_empty());
    }

    #[test]
    fn tier_broadening_includes_other_agents() {
        let r = build(4);
        r.store(sample("a", "APEX", 1, "fp-a", vec![1.0, 0.0, 0.0, 0.0], 0.6)).unwrap();
        r.store(sample("b", "CIPHER", 1, "fp-b", vec![1.0, 0.0, 0.0, 0.0], 0.6)).unwrap();
        let mut q = Query::new("APEX", 1);
        q.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        q.include_tier = true;
        q.k = 5;
        let result = r.retrieve(&q).unwrap();
        let ids: Vec<&str> = result.records.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"b"));
    }

    #[test]
    fn empty_store_returns_empty_path() {
        let r = build(4);
        let mut q = Query::new("APEX", 1);
        q.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        let result = r.retrieve(&q).unwrap();
        assert_eq!(result.path, RetrievalPath::Empty);
        assert!(result.records.is_empty());
    }

    #[test]
    fn zero_k_is_invalid_argument() {
        let r = build(4);
        let mut q = Query::new("APEX", 1);
        q.k = 0;
        assert!(r.retrieve(&q).is_err());
    }

    #[test]
    fn supersede_by_fingerprint_removes_old_record() {
        let r = build(4);
        r.store(sample("x", "APEX", 1, "F", vec![1.0, 0.0, 0.0, 0.0], 0.5)).unwrap();
        let outcome = r.store(sample("y", "APEX", 1, "F", vec![0.0, 1.0, 0.0, 0.0], 0.6)).unwrap();
        assert_eq!(outcome, StoreOutcome::Superseded("x".to_string()));
        assert_eq!(r.store.get(&"x".to_string()), None);
        assert_eq!(r.store.by_fingerprint("F").unwrap().id, "y");
    }
}
