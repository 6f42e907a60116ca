//! C4 — ExperienceStore: the primary record table plus secondary indices
//! by agent, tier and fingerprint.
//!
//! Access-stat fields (`usage_count`, `last_access_at`) and `fitness` live as
//! atomics inside [`Entry`] so the hot retrieve path only ever needs a read
//! lock on the primary map. The by-agent and by-tier indices are sharded one
//! set-with-its-own-lock per key, behind a read-mostly directory map, so
//! inserts for distinct agents (or tiers) never block each other on the same
//! lock. Locks are always acquired in a single order — primary, then
//! agent shard, then tier shard, then the global fingerprint map — to rule
//! out deadlock between concurrent `put`/`remove` calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use crate::error::{MnemonicError, Result};
use crate::record::{AgentId, Record, RecordId, RemoveOutcome, StoreOutcome};

/// A secondary index keyed by `K`, sharded per key: each key gets its own
/// `RwLock<HashSet<RecordId>>`, and a directory map (also an `RwLock`) hands
/// out `Arc` clones of those per-key locks. Writers for distinct keys only
/// ever take the directory's read lock plus their own shard's write lock, so
/// they don't contend with each other.
struct ShardedIndex<K: Eq + std::hash::Hash + Clone> {
    directory: RwLock<HashMap<K, Arc<RwLock<HashSet<RecordId>>>>>,
}

impl<K: Eq + std::hash::Hash + Clone> ShardedIndex<K> {
    fn new() -> Self {
        Self { directory: RwLock::new(HashMap::new()) }
    }

    fn shard(&self, key: &K) -> Arc<RwLock<HashSet<RecordId>>> {
        if let Some(existing) = self.directory.read().get(key) {
            return Arc::clone(existing);
        }
        Arc::clone(self.directory.write().entry(key.clone()).or_insert_with(|| Arc::new(RwLock::new(HashSet::new()))))
    }

    fn insert(&self, key: &K, id: RecordId) {
        self.shard(key).write().insert(id);
    }

    fn remove(&self, key: &K, id: &RecordId) {
        if let Some(shard) = self.directory.read().get(key) {
            shard.write().remove(id);
        }
    }

    fn get(&self, key: &K) -> Vec<RecordId> {
        match self.directory.read().get(key) {
            Some(shard) => shard.read().iter().cloned().collect(),
            None => Vec::new(),
        }
    }
}

struct Entry {
    agent_id: AgentId,
    tier: u8,
    fingerprint: String,
    input: String,
    output: String,
    strategy: String,
    embedding: Vec<f32>,
    fitness_bits: AtomicU64,
    created_at: u64,
    last_access_at: AtomicU64,
    usage_count: AtomicU64,
    generation: AtomicU64,
}

impl Entry {
    fn from_record(r: &Record) -> Self {
        Self {
            agent_id: r.agent_id.clone(),
            tier: r.tier,
            fingerprint: r.fingerprint.clone(),
            input: r.input.clone(),
            output: r.output.clone(),
            strategy: r.strategy.clone(),
            embedding: r.embedding.clone(),
            fitness_bits: AtomicU64::new(r.fitness.to_bits()),
            created_at: r.created_at,
            last_access_at: AtomicU64::new(r.last_access_at),
            usage_count: AtomicU64::new(r.usage_count),
            generation: AtomicU64::new(r.generation),
        }
    }

    fn to_record(&self, id: &RecordId) -> Record {
        Record {
            id: id.clone(),
            agent_id: self.agent_id.clone(),
            tier: self.tier,
            fingerprint: self.fingerprint.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            strategy: self.strategy.clone(),
            embedding: self.embedding.clone(),
            fitness: f64::from_bits(self.fitness_bits.load(Ordering::Relaxed)),
            created_at: self.created_at,
            last_access_at: self.last_access_at.load(Ordering::Relaxed),
            usage_count: self.usage_count.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Relaxed),
        }
    }
}

/// The record table plus its secondary indices.
pub struct ExperienceStore {
    primary: RwLock<HashMap<RecordId, Entry>>,
    by_agent: ShardedIndex<AgentId>,
    by_tier: ShardedIndex<u8>,
    by_fingerprint: RwLock<HashMap<String, RecordId>>,
}

impl Default for ExperienceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperienceStore {
    pub fn new() -> Self {
        Self {
            primary: RwLock::new(HashMap::new()),
            by_agent: ShardedIndex::new(),
            by_tier: ShardedIndex::new(),
            by_fingerprint: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or fingerprint-supersede `record`. Returns the id of the
    /// record it replaced, if any.
    pub fn put(&self, record: Record) -> Result<StoreOutcome> {
        if record.id.is_empty() {
            return Err(MnemonicError::invalid("record id must not be empty"));
        }
        if record.fingerprint.is_empty() {
            return Err(MnemonicError::invalid("record fingerprint must not be empty"));
        }

        let mut primary = self.primary.write();
        let mut fp_idx = self.by_fingerprint.write();

        let superseded = fp_idx.get(&record.fingerprint).cloned().filter(|old| *old != record.id);
        if let Some(old_id) = &superseded {
            if let Some(old_entry) = primary.remove(old_id) {
                self.by_agent.remove(&old_entry.agent_id, old_id);
                self.by_tier.remove(&old_entry.tier, old_id);
            }
        }

        self.by_agent.insert(&record.agent_id, record.id.clone());
        self.by_tier.insert(&record.tier, record.id.clone());
        fp_idx.insert(record.fingerprint.clone(), record.id.clone());
        primary.insert(record.id.clone(), Entry::from_record(&record));

        Ok(match superseded {
            Some(old_id) => StoreOutcome::Superseded(old_id),
            None => StoreOutcome::Ok,
        })
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.primary.read().get(id).map(|e| e.to_record(id))
    }

    pub fn remove(&self, id: &RecordId) -> RemoveOutcome {
        let mut primary = self.primary.write();
        let Some(entry) = primary.remove(id) else { return RemoveOutcome::NotFound };
        self.by_agent.remove(&entry.agent_id, id);
        self.by_tier.remove(&entry.tier, id);
        let mut fp_idx = self.by_fingerprint.write();
        if fp_idx.get(&entry.fingerprint) == Some(id) {
            fp_idx.remove(&entry.fingerprint);
        }
        RemoveOutcome::Ok
    }

    pub fn by_agent(&self, agent_id: &str) -> Vec<Record> {
        let primary = self.primary.read();
        let ids = self.by_agent.get(&agent_id.to_string());
        ids.iter().filter_map(|id| primary.get(id).map(|e| e.to_record(id))).collect()
    }

    pub fn by_tier(&self, tier: u8) -> Vec<Record> {
        let primary = self.primary.read();
        let ids = self.by_tier.get(&tier);
        ids.iter().filter_map(|id| primary.get(id).map(|e| e.to_record(id))).collect()
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<Record> {
        let id = self.by_fingerprint.read().get(fingerprint).cloned()?;
        self.get(&id)
    }

    /// Bump `usage_count` and set `last_access_at` without taking a write
    /// lock on the primary map.
    pub fn touch(&self, id: &RecordId, now_ns: u64) {
        if let Some(entry) = self.primary.read().get(id) {
            entry.usage_count.fetch_add(1, Ordering::Relaxed);
            entry.last_access_at.store(now_ns, Ordering::Relaxed);
        }
    }

    /// Overwrite `fitness` in place.
    pub fn set_fitness(&self, id: &RecordId, fitness: f64) -> Result<()> {
        match self.primary.read().get(id) {
            Some(entry) => {
                entry.fitness_bits.store(fitness.to_bits(), Ordering::Relaxed);
                Ok(())
            }
            None => Err(MnemonicError::not_found(id)),
        }
    }

    /// Increment `generation` in place.
    pub fn bump_generation(&self, id: &RecordId) {
        if let Some(entry) = self.primary.read().get(id) {
            entry.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of every live record. Used by the reflect loop's `evolve()`
    /// pass and by collective promotion, which must scan the whole store.
    pub fn all(&self) -> Vec<Record> {
        self.primary.read().iter().map(|(id, e)| e.to_record(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.primary.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All fingerprints currently live, for [`crate::filter::MembershipFilter::rebuild_from`].
    pub fn all_fingerprints(&self) -> Vec<String> {
        self.by_fingerprint.read().keys().cloned().collect()
    }

    /// Evict records for `agent_id` down to `max_per_agent`, returning the
    /// evicted ids.
    ///
    /// Eviction targets the least-recently-used record among those below
    /// the agent's median fitness first, not simply the lowest-fitness
    /// record overall: a record can be heavily used and still have middling
    /// fitness, and a record nobody has touched in a long time is a better
    /// eviction candidate than one that's merely not the best performer. If
    /// the below-median subset isn't large enough to reach `max_per_agent`
    /// on its own, the remaining slots are taken from the rest, ordered by
    /// fitness then recency as a fallback.
    pub fn enforce_capacity(&self, agent_id: &str, max_per_agent: usize) -> Vec<RecordId> {
        let records = self.by_agent(agent_id);
        if records.len() <= max_per_agent {
            return Vec::new();
        }
        let evict_count = records.len() - max_per_agent;

        let mut fitnesses: Vec<f64> = records.iter().map(|r| r.fitness).collect();
        fitnesses.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = fitnesses.len() / 2;
        let median = if fitnesses.len() % 2 == 0 { (fitnesses[mid - 1] + fitnesses[mid]) / 2.0 } else { fitnesses[mid] };

        let (mut below_median, mut rest): (Vec<Record>, Vec<Record>) = records.into_iter().partition(|r| r.fitness < median);
        below_median.sort_by(|a, b| a.last_access_at.cmp(&b.last_access_at).then_with(|| a.id.cmp(&b.id)));
        rest.sort_by(|a, b| {
            a.fitness
                .partial_cmp(&b.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.last_access_at.cmp(&b.last_access_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let evicted: Vec<RecordId> = below_median.into_iter().chain(rest).take(evict_count).map(|r| r.id).collect();
        for id in &evicted {
            self.remove(id);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, agent: &str, tier: u8, fp: &str, fitness: f64) -> Record {
        Record {
            id: id.to_string(),
            agent_id: agent.to_string(),
            tier,
            fingerprint: fp.to_string(),
            input: "in".to_string(),
            output: "out".to_string(),
            strategy: "strat".to_string(),
            embedding: Vec::new(),
            fitness,
            created_at: 0,
            last_access_at: 0,
            usage_count: 0,
            generation: 0,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = ExperienceStore::new();
        store.put(sample("r1", "APEX", 1, "fp1", 0.5)).unwrap();
        let got = store.get(&"r1".to_string()).unwrap();
        assert_eq!(got.agent_id, "APEX");
        assert_eq!(got.fingerprint, "fp1");
    }

    #[test]
    fn empty_id_is_rejected() {
        let store = ExperienceStore::new();
        let err = store.put(sample("", "APEX", 1, "fp1", 0.5)).unwrap_err();
        assert!(matches!(err, MnemonicError::InvalidArgument(_)));
    }

    #[test]
    fn fingerprint_collision_supersedes_old_record() {
        let store = ExperienceStore::new();
        store.put(sample("r1", "APEX", 1, "shared-fp", 0.5)).unwrap();
        let outcome = store.put(sample("r2", "APEX", 1, "shared-fp", 0.9)).unwrap();
        assert_eq!(outcome, StoreOutcome::Superseded("r1".to_string()));
        assert!(store.get(&"r1".to_string()).is_none());
        assert_eq!(store.get(&"r2".to_string()).unwrap().fitness, 0.9);
    }

    #[test]
    fn remove_clears_all_indices() {
        let store = ExperienceStore::new();
        store.put(sample("r1", "APEX", 1, "fp1", 0.5)).unwrap();
        assert_eq!(store.remove(&"r1".to_string()), RemoveOutcome::Ok);
        assert!(store.get(&"r1".to_string()).is_none());
        assert!(store.by_agent("APEX").is_empty());
        assert!(store.by_tier(1).is_empty());
        assert!(store.by_fingerprint("fp1").is_none());
    }

    #[test]
    fn remove_missing_is_not_found() {
        let store = ExperienceStore::new();
        assert_eq!(store.remove(&"nope".to_string()), RemoveOutcome::NotFound);
    }

    #[test]
    fn touch_updates_access_stats() {
        let store = ExperienceStore::new();
        store.put(sample("r1", "APEX", 1, "fp1", 0.5)).unwrap();
        store.touch(&"r1".to_string(), 42);
        let got = store.get(&"r1".to_string()).unwrap();
        assert_eq!(got.usage_count, 1);
        assert_eq!(got.last_access_at, 42);
    }

    #[test]
    fn set_fitness_does_not_touch_generation() {
        let store = ExperienceStore::new();
        store.put(sample("r1", "APEX", 1, "fp1", 0.5)).unwrap();
        store.set_fitness(&"r1".to_string(), 0.8).unwrap();
        let got = store.get(&"r1".to_string()).unwrap();
        assert_eq!(got.fitness, 0.8);
        assert_eq!(got.generation, 0);
    }

    #[test]
    fn bump_generation_increments_in_place() {
        let store = ExperienceStore::new();
        store.put(sample("r1", "APEX", 1, "fp1", 0.5)).unwrap();
        store.bump_generation(&"r1".to_string());
        store.bump_generation(&"r1".to_string());
        assert_eq!(store.get(&"r1".to_string()).unwrap().generation, 2);
    }

    #[test]
    fn all_returns_every_live_record() {
        let store = ExperienceStore::new();
        store.put(sample("r1", "APEX", 1, "fp1", 0.5)).unwrap();
        store.put(sample("r2", "CIPHER", 2, "fp2", 0.6)).unwrap();
        let ids: std::collections::HashSet<String> = store.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["r1".to_string(), "r2".to_string()].into_iter().collect());
    }

    #[test]
    fn enforce_capacity_evicts_lowest_fitness_first() {
        let store = ExperienceStore::new();
        store.put(sample("low", "APEX", 1, "fp-low", 0.1)).unwrap();
        store.put(sample("mid", "APEX", 1, "fp-mid", 0.5)).unwrap();
        store.put(sample("high", "APEX", 1, "fp-high", 0.9)).unwrap();
        let evicted = store.enforce_capacity("APEX", 2);
        assert_eq!(evicted, vec!["low".to_string()]);
        assert_eq!(store.by_agent("APEX").len(), 2);
    }

    fn sample_la(id: &str, agent: &str, fp: &str, fitness: f64, last_access_at: u64) -> Record {
        let mut r = sample(id, agent, 1, fp, fitness);
        r.last_access_at = last_access_at;
        r
    }

    #[test]
    fn enforce_capacity_evicts_lru_among_below_median_not_just_lowest_fitness() {
        let store = ExperienceStore::new();
        store.put(sample_la("r1", "APEX", "fp1", 0.9, 100)).unwrap();
        store.put(sample_la("r2", "APEX", "fp2", 0.2, 400)).unwrap();
        store.put(sample_la("r3", "APEX", "fp3", 0.3, 300)).unwrap();
        store.put(sample_la("r4", "APEX", "fp4", 0.8, 500)).unwrap();
        // median fitness is (0.3 + 0.8) / 2 = 0.55, so the below-median
        // subset is {r2, r3}; r3 is less recently accessed (300 < 400) and
        // must go first even though r2 has strictly lower fitness.
        let evicted = store.enforce_capacity("APEX", 3);
        assert_eq!(evicted, vec!["r3".to_string()]);
        let remaining: std::collections::HashSet<String> = store.by_agent("APEX").into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, ["r1".to_string(), "r2".to_string(), "r4".to_string()].into_iter().collect());
    }

    #[test]
    fn by_agent_shards_are_independent_across_agents() {
        let store = ExperienceStore::new();
        store.put(sample("a1", "APEX", 1, "fp-a1", 0.5)).unwrap();
        store.put(sample("b1", "CIPHER", 1, "fp-b1", 0.5)).unwrap();
        assert_eq!(store.by_agent("APEX").len(), 1);
        assert_eq!(store.by_agent("CIPHER").len(), 1);
        store.remove(&"a1".to_string());
        assert!(store.by_agent("APEX").is_empty());
        assert_eq!(store.by_agent("CIPHER").len(), 1);
    }
}
