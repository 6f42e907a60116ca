//! Property tests for the quantified invariants in the retrieval cascade
//! (no-false-negatives membership, bounded result size, monotone access
//! stats).

use std::sync::Arc;

use mnemonic_core::{Clock, EmbeddingProvider, ManualClock, Mnemonic, MnemonicConfig, Query, Record};
use proptest::prelude::*;

struct NullEmbedder(usize);
impl EmbeddingProvider for NullEmbedder {
    fn dim(&self) -> usize {
        self.0
    }
    fn embed(&self, _text: &str) -> Vec<f32> {
        vec![0.0; self.0]
    }
}

fn build(dim: usize) -> Mnemonic {
    let mut config = MnemonicConfig::default();
    config.dim = dim;
    config.expected_n = 1000;
    config.hash_tables = 4;
    config.hyperplanes = 6;
    config.graph_degree = 8;
    config.ef_construction = 64;
    config.ef_search = 32;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(NullEmbedder(dim));
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    Mnemonic::new(config, embedder, clock).unwrap()
}

fn record(id: String, fp: String, embedding: Vec<f32>, fitness: f64) -> Record {
    Record {
        id,
        agent_id: "APEX".to_string(),
        tier: 1,
        fingerprint: fp,
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

proptest! {
    /// Every fingerprint inserted and never removed stays visible to C1.
    #[test]
    fn no_false_negatives_across_random_fingerprints(fps in prop::collection::vec("[a-z]{1,12}", 1..40)) {
        let m = build(4);
        for (i, fp) in fps.iter().enumerate() {
            m.store(record(format!("id-{i}"), fp.clone(), vec![], 0.5)).unwrap();
        }
        for fp in &fps {
            let mut q = Query::new("APEX", 1);
            q.fingerprint = Some(fp.clone());
            let result = m.retrieve(&q).unwrap();
            prop_assert_eq!(result.path, mnemonic_core::RetrievalPath::Exact);
        }
        m.shutdown();
    }

    /// A retrieve never returns more than `k` records, regardless of how
    /// many candidates exist or collide.
    #[test]
    fn result_size_never_exceeds_k(
        count in 1usize..30,
        k in 1usize..10,
    ) {
        let m = build(4);
        for i in 0..count {
            let v = vec![(i % 7) as f32, 0.0, 0.0, 0.0];
            m.store(record(format!("id-{i}"), format!("fp-{i}"), v, 0.5)).unwrap();
        }
        let mut q = Query::new("APEX", 1);
        q.embedding = Some(vec![0.0, 0.0, 0.0, 0.0]);
        q.k = k;
        let result = m.retrieve(&q).unwrap();
        prop_assert!(result.records.len() <= k);
        m.shutdown();
    }

    /// Repeated retrieves never decrease a record's `usage_count`.
    #[test]
    fn usage_count_is_non_decreasing(hits in 1usize..8) {
        let m = build(4);
        m.store(record("a".to_string(), "fp-a".to_string(), vec![], 0.5)).unwrap();

        let mut previous = 0u64;
        for _ in 0..hits {
            let mut q = Query::new("APEX", 1);
            q.fingerprint = Some("fp-a".to_string());
            let result = m.retrieve(&q).unwrap();
            let current = result.records[0].usage_count;
            prop_assert!(current >= previous);
            previous = current;
        }
        m.shutdown();
    }
}
