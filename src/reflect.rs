//! C6 — ReflectLoop: closes the learning loop.
//!
//! `evolve()` runs on a single dedicated background thread rather than an
//! async task: the retrieve path is the only place with suspension-point
//! discipline to maintain, and a plain OS thread parked on a condition
//! variable gives cancellable, deadline-free scheduling without pulling an
//! async runtime into the core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashSet;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::filter::MembershipFilter;
use crate::graph::ProximityGraph;
use crate::hash_index::HashBucketIndex;
use crate::metrics::Metrics;
use crate::record::{Outcome, RecordId, ReflectOutcome, Record, COLLECTIVE_AGENT};
use crate::store::ExperienceStore;

/// Fraction of set bits past which [`ReflectLoop::evolve`] rebuilds the
/// membership filter from the live fingerprint set. A Bloom filter can't
/// report how many of its set bits are stale, so this stands in as the
/// nearest observable proxy: ask the filter to rebuild once it is
/// noticeably fuller than its sizing target implies it should be.
const REBUILD_FILL_THRESHOLD: f64 = 0.5;

struct Shared {
    store: Arc<ExperienceStore>,
    filter: Arc<MembershipFilter>,
    hash_index: Arc<HashBucketIndex>,
    graph: Arc<ProximityGraph>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    alpha: f64,
    tau_promote: f64,
    max_per_agent: usize,
}

/// Evaluates outcomes, updates fitness, promotes breakthroughs, and runs
/// the periodic capacity/filter/generation maintenance pass.
pub struct ReflectLoop {
    shared: Arc<Shared>,
    evolve_interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Arc<(Mutex<()>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[allow(clippy::too_many_arguments)]
impl ReflectLoop {
    pub fn new(
        store: Arc<ExperienceStore>,
        filter: Arc<MembershipFilter>,
        hash_index: Arc<HashBucketIndex>,
        graph: Arc<ProximityGraph>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        alpha: f64,
        tau_promote: f64,
        max_per_agent: usize,
        evolve_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                filter,
                hash_index,
                graph,
                metrics,
                clock,
                alpha,
                tau_promote,
                max_per_agent,
            }),
            evolve_interval,
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(()), Condvar::new())),
            handle: Mutex::new(None),
        }
    }

    /// `f' = (1-α)·f + α·reward`, clamped to `[0,1]`.
    pub fn reflect(&self, record_id: &RecordId, outcome: Outcome) -> Result<ReflectOutcome> {
        let Some(existing) = self.shared.store.get(record_id) else {
            return Ok(ReflectOutcome::NotFound);
        };
        let reward = outcome.reward.clamp(0.0, 1.0);
        let new_fitness = ((1.0 - self.shared.alpha) * existing.fitness + self.shared.alpha * reward).clamp(0.0, 1.0);
        self.shared.store.set_fitness(record_id, new_fitness)?;
        info!(id = %record_id, new_fitness, "reflected outcome onto record fitness");
        Ok(ReflectOutcome::Ok { new_fitness })
    }

    /// Mirror every non-collective record whose fitness has crossed
    /// `τ_promote` into a shared `COLLECTIVE`-tagged record. Returns the
    /// number of new mirrors created.
    pub fn promote_breakthroughs(&self) -> usize {
        let mut promoted = 0;
        for r in self.shared.store.all() {
            if r.is_collective() || r.fitness < self.shared.tau_promote {
                continue;
            }
            let mirror_id = format!("collective::{}", r.id);
            if self.shared.store.get(&mirror_id).is_some() {
                continue;
            }
            let mirror = Record {
                id: mirror_id,
                agent_id: COLLECTIVE_AGENT.to_string(),
                tier: r.tier,
                fingerprint: format!("{}::collective", r.fingerprint),
                input: r.input.clone(),
                output: r.output.clone(),
                strategy: r.strategy.clone(),
                embedding: r.embedding.clone(),
                fitness: r.fitness,
                created_at: self.shared.clock.now_ns(),
                last_access_at: self.shared.clock.now_ns(),
                usage_count: 0,
                generation: 0,
            };
            if self.shared.store.put(mirror.clone()).is_ok() {
                self.shared.filter.add(&mirror.fingerprint);
                if mirror.has_embedding() {
                    self.shared.hash_index.add(&mirror.id, &mirror.embedding);
                    self.shared.graph.add(mirror.id.clone(), mirror.embedding.clone());
                }
                self.shared.metrics.record_store(&mirror.agent_id, mirror.tier);
                info!(source_id = %r.id, mirror_id = %mirror.id, fitness = r.fitness, "promoted breakthrough to collective pool");
                promoted += 1;
            }
        }
        promoted
    }

    /// One maintenance pass: per-agent capacity enforcement, conditional
    /// filter rebuild, generation increment. Yields between agent shards
    /// and bails out early if `stop` is signalled.
    pub fn evolve(&self) {
        Self::run_evolve_pass(&self.shared, &self.stop);
    }

    fn run_evolve_pass(shared: &Shared, stop: &AtomicBool) {
        let agents: HashSet<String> = shared.store.all().into_iter().map(|r| r.agent_id).collect();
        for agent in agents {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let evicted = shared.store.enforce_capacity(&agent, shared.max_per_agent);
            if !evicted.is_empty() {
                warn!(agent_id = %agent, count = evicted.len(), max_per_agent = shared.max_per_agent, "evicted lowest-fitness records to stay under capacity");
            }
            std::thread::yield_now();
        }

        if stop.load(Ordering::Relaxed) {
            return;
        }
        if shared.filter.fill_ratio() > REBUILD_FILL_THRESHOLD {
            warn!(fill_ratio = shared.filter.fill_ratio(), "membership filter past rebuild threshold, rebuilding from live fingerprints");
            let live = shared.store.all_fingerprints();
            shared.filter.rebuild_from(live.iter().map(|s| s.as_str()));
        }

        for r in shared.store.all() {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            shared.store.bump_generation(&r.id);
        }
    }

    /// Spawn the background maintenance thread. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let wake = Arc::clone(&self.wake);
        let interval = self.evolve_interval;
        *handle = Some(std::thread::spawn(move || {
            let (lock, cvar) = &*wake;
            loop {
                let guard = lock.lock().unwrap();
                let (_guard, timeout) = cvar.wait_timeout(guard, interval).unwrap();
                drop(timeout);
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                Self::run_evolve_pass(&shared, &stop);
            }
        }));
    }

    /// Signal the background thread to stop and join it. Safe to call more
    /// than once; a no-op if the loop was never started.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let (_lock, cvar) = &*self.wake;
        cvar.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReflectLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
