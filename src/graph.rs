//! C3 — ProximityGraph: a hierarchical navigable small-world graph for
//! O(log n) expected approximate nearest-neighbour search.
//!
//! The graph is cyclic by nature (neighbour lists reference each other).
//! We avoid an ownership cycle by using an arena (`nodes: HashMap<RecordId,
//! Node>`) keyed by stable id; neighbour lists store ids, never pointers.
//! The whole aggregate — nodes, entry point, current max level — sits
//! behind one `RwLock` rather than spreading these invariants across
//! multiple locks.

use std::cmp::Ordering;

use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::record::RecordId;

struct Node {
    vector: Vec<f32>,
    /// `neighbours[layer]` for `layer` in `0..=level`.
    neighbours: Vec<Vec<RecordId>>,
}

struct Inner {
    nodes: HashMap<RecordId, Node>,
    entry_point: Option<RecordId>,
    current_max_level: usize,
    rng: ChaCha8Rng,
}

/// A candidate found during beam search: distance plus id, ordered so that
/// ties are broken by the smaller id.
#[derive(Debug, Clone)]
struct Scored {
    dist: f32,
    id: RecordId,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.id == other.id
    }
}
impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    /// Ascending "goodness": closer distance first, smaller id first on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

fn sample_level(rng: &mut ChaCha8Rng, m: usize) -> usize {
    let u: f64 = rng.gen::<f64>().clamp(1e-12, 1.0 - 1e-12);
    let m = (m as f64).max(1.0 + 1e-9);
    (-u.ln() * (1.0 / m.ln())).floor().max(0.0) as usize
}

fn prune_to_nearest(nodes: &HashMap<RecordId, Node>, center: &[f32], ids: &mut Vec<RecordId>, cap: usize) {
    if ids.len() <= cap {
        return;
    }
    ids.sort_by(|a, b| {
        let da = euclidean(center, &nodes[a].vector);
        let db = euclidean(center, &nodes[b].vector);
        da.partial_cmp(&db).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b))
    });
    ids.truncate(cap);
}

/// A hierarchical navigable small-world graph over embedding vectors.
pub struct ProximityGraph {
    dim: usize,
    m: usize,
    ef_construction: usize,
    ef_search_default: usize,
    inner: RwLock<Inner>,
}

impl ProximityGraph {
    pub fn new(dim: usize, m: usize, ef_construction: usize, ef_search_default: usize, seed: u64) -> Self {
        Self {
            dim,
            m: m.max(1),
            ef_construction: ef_construction.max(1),
            ef_search_default: ef_search_default.max(1),
            inner: RwLock::new(Inner {
                nodes: HashMap::new(),
                entry_point: None,
                current_max_level: 0,
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
        }
    }

    /// Greedy single-candidate descent at a fixed layer: width 1, used both
    /// by insertion (descending to the insert layer) and search (descending
    /// through the upper layers before the final beam search).
    fn greedy_descend(inner: &Inner, from: &RecordId, query: &[f32], layer: usize) -> RecordId {
        let mut current = from.clone();
        let mut current_dist = euclidean(&inner.nodes[&current].vector, query);
        loop {
            let mut moved = false;
            if let Some(node) = inner.nodes.get(&current) {
                if let Some(neighbours) = node.neighbours.get(layer) {
                    for nb in neighbours {
                        let Some(nb_node) = inner.nodes.get(nb) else { continue };
                        let d = euclidean(&nb_node.vector, query);
                        if d < current_dist || (d == current_dist && *nb < current) {
                            current_dist = d;
                            current = nb.clone();
                            moved = true;
                        }
                    }
                }
            }
            if !moved {
                break;
            }
        }
        current
    }

    /// Beam search at a fixed layer starting from `entry_points`, width `ef`.
    /// `should_continue` is polled before each expansion so callers can
    /// implement cooperative cancellation.
    fn search_layer(
        inner: &Inner,
        entry_points: &[RecordId],
        query: &[f32],
        ef: usize,
        layer: usize,
        should_continue: &dyn Fn() -> bool,
    ) -> Vec<Scored> {
        use std::collections::BinaryHeap;
        use std::cmp::Reverse;

        let mut visited: hashbrown::HashSet<RecordId> = entry_points.iter().cloned().collect();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for ep in entry_points {
            let Some(node) = inner.nodes.get(ep) else { continue };
            let dist = euclidean(&node.vector, query);
            let scored = Scored { dist, id: ep.clone() };
            candidates.push(Reverse(scored.clone()));
            results.push(scored);
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if !should_continue() {
                break;
            }
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.dist > worst.dist {
                    break;
                }
            }
            let Some(node) = inner.nodes.get(&current.id) else { continue };
            let Some(neighbours) = node.neighbours.get(layer) else { continue };
            for nb in neighbours {
                if visited.contains(nb) {
                    continue;
                }
                visited.insert(nb.clone());
                let Some(nb_node) = inner.nodes.get(nb) else { continue };
                let d = euclidean(&nb_node.vector, query);
                let worst_dist = results.peek().map(|w| w.dist);
                if results.len() < ef || worst_dist.is_none_or(|w| d < w) {
                    let scored = Scored { dist: d, id: nb.clone() };
                    candidates.push(Reverse(scored.clone()));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_vec();
        out.sort();
        out
    }

    /// Insert `id` with embedding `vec`. No-op if `vec.len() != D`.
    pub fn add(&self, id: RecordId, vec: Vec<f32>) {
        if vec.len() != self.dim {
            return;
        }
        let mut inner = self.inner.write();
        let level = sample_level(&mut inner.rng, self.m);

        let Some(entry) = inner.entry_point.clone() else {
            inner.nodes.insert(id.clone(), Node { vector: vec, neighbours: vec![Vec::new(); level + 1] });
            inner.entry_point = Some(id);
            inner.current_max_level = level;
            return;
        };

        let mut ep = entry;
        let mut layer = inner.current_max_level;
        while layer > level {
            ep = Self::greedy_descend(&inner, &ep, &vec, layer);
            if layer == 0 {
                break;
            }
            layer -= 1;
        }

        let start_layer = level.min(inner.current_max_level);
        let mut entry_points = vec![ep];
        let mut edges_per_layer: Vec<(usize, Vec<RecordId>)> = Vec::new();
        let always_true = || true;
        for l in (0..=start_layer).rev() {
            let cap = if l == 0 { 2 * self.m } else { self.m };
            let beam = Self::search_layer(&inner, &entry_points, &vec, self.ef_construction.max(cap), l, &always_true);
            let selected: Vec<RecordId> = beam.iter().take(cap).map(|s| s.id.clone()).collect();
            entry_points = beam.into_iter().map(|s| s.id).collect();
            edges_per_layer.push((l, selected));
        }

        inner.nodes.insert(id.clone(), Node { vector: vec, neighbours: vec![Vec::new(); level + 1] });

        for (layer, selected) in edges_per_layer {
            if let Some(node) = inner.nodes.get_mut(&id) {
                node.neighbours[layer] = selected.clone();
            }
            let cap = if layer == 0 { 2 * self.m } else { self.m };
            for nb_id in &selected {
                let nb_vector = match inner.nodes.get(nb_id) {
                    Some(nb) if layer < nb.neighbours.len() => nb.vector.clone(),
                    _ => continue,
                };
                if let Some(nb) = inner.nodes.get_mut(nb_id) {
                    nb.neighbours[layer].push(id.clone());
                }
                let mut list = inner.nodes[nb_id].neighbours[layer].clone();
                prune_to_nearest(&inner.nodes, &nb_vector, &mut list, cap);
                if let Some(nb) = inner.nodes.get_mut(nb_id) {
                    nb.neighbours[layer] = list;
                }
            }
        }

        if level > inner.current_max_level {
            inner.entry_point = Some(id);
            inner.current_max_level = level;
        }
    }

    /// Remove `id` from the graph, excising it from ex-neighbours' lists
    /// and reassigning the entry point if necessary.
    pub fn remove(&self, id: &RecordId) {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.remove(id) else { return };
        for (layer, neighbour_ids) in node.neighbours.iter().enumerate() {
            for nb_id in neighbour_ids {
                if let Some(nb) = inner.nodes.get_mut(nb_id) {
                    if layer < nb.neighbours.len() {
                        nb.neighbours[layer].retain(|x| x != id);
                    }
                }
            }
        }
        if inner.entry_point.as_deref() == Some(id.as_str()) {
            let new_entry = inner
                .nodes
                .iter()
                .max_by_key(|(_, n)| n.neighbours.len())
                .map(|(nid, _)| nid.clone());
            match new_entry {
                Some(nid) => {
                    inner.current_max_level = inner.nodes[&nid].neighbours.len() - 1;
                    inner.entry_point = Some(nid);
                }
                None => {
                    inner.current_max_level = 0;
                    inner.entry_point = None;
                }
            }
        }
    }

    /// Search for the `k` nearest neighbours of `query`, ordered by
    /// increasing distance.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<RecordId> {
        self.search_cancellable(query, k, &|| true)
    }

    /// As [`Self::search`] but polls `should_continue` between beam
    /// expansions, returning whatever was found so far if it turns false.
    pub fn search_cancellable(&self, query: &[f32], k: usize, should_continue: &dyn Fn() -> bool) -> Vec<RecordId> {
        if query.len() != self.dim || k == 0 {
            return Vec::new();
        }
        let inner = self.inner.read();
        let Some(entry) = inner.entry_point.clone() else { return Vec::new() };

        let mut ep = entry;
        let mut layer = inner.current_max_level;
        while layer >= 1 {
            if !should_continue() {
                return Vec::new();
            }
            ep = Self::greedy_descend(&inner, &ep, query, layer);
            layer -= 1;
        }

        let ef = self.ef_search_default.max(k);
        let beam = Self::search_layer(&inner, &[ep], query, ef, 0, should_continue);
        beam.into_iter().take(k).map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(vals: &[f32]) -> Vec<f32> {
        vals.to_vec()
    }

    #[test]
    fn empty_graph_returns_empty() {
        let g = ProximityGraph::new(4, 16, 200, 100, 1);
        assert!(g.search(&v(&[1.0, 0.0, 0.0, 0.0]), 5).is_empty());
    }

    #[test]
    fn single_node_graph_returns_it() {
        let g = ProximityGraph::new(4, 16, 200, 100, 1);
        g.add("a".into(), v(&[1.0, 0.0, 0.0, 0.0]));
        let results = g.search(&v(&[1.0, 0.0, 0.0, 0.0]), 5);
        assert_eq!(results, vec!["a".to_string()]);
    }

    #[test]
    fn nearest_neighbour_is_found_among_many() {
        let g = ProximityGraph::new(2, 8, 100, 50, 7);
        for i in 0..50 {
            let x = i as f32;
            g.add(format!("n{i}"), v(&[x, 0.0]));
        }
        let results = g.search(&v(&[25.1, 0.0]), 3);
        assert!(!results.is_empty());
        assert!(results.contains(&"n25".to_string()) || results.contains(&"n24".to_string()) || results.contains(&"n26".to_string()));
    }

    #[test]
    fn k_larger_than_graph_size_returns_all() {
        let g = ProximityGraph::new(2, 8, 100, 50, 3);
        for i in 0..4 {
            g.add(format!("n{i}"), v(&[i as f32, 0.0]));
        }
        let results = g.search(&v(&[0.0, 0.0]), 100);
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn remove_excludes_from_future_search() {
        let g = ProximityGraph::new(2, 8, 100, 50, 5);
        for i in 0..10 {
            g.add(format!("n{i}"), v(&[i as f32, 0.0]));
        }
        g.remove(&"n5".to_string());
        let results = g.search(&v(&[5.0, 0.0]), 10);
        assert!(!results.contains(&"n5".to_string()));
        assert_eq!(g.len(), 9);
    }

    #[test]
    fn remove_reassigns_entry_point_when_needed() {
        let g = ProximityGraph::new(2, 8, 100, 50, 5);
        g.add("only".into(), v(&[1.0, 1.0]));
        g.remove(&"only".to_string());
        assert!(g.is_empty());
        assert!(g.search(&v(&[1.0, 1.0]), 1).is_empty());
        g.add("next".into(), v(&[2.0, 2.0]));
        assert_eq!(g.search(&v(&[2.0, 2.0]), 1), vec!["next".to_string()]);
    }

    #[test]
    fn deterministic_given_same_seed() {
        let g1 = ProximityGraph::new(2, 8, 100, 50, 123);
        let g2 = ProximityGraph::new(2, 8, 100, 50, 123);
        for i in 0..20 {
            g1.add(format!("n{i}"), v(&[i as f32, 0.0]));
            g2.add(format!("n{i}"), v(&[i as f32, 0.0]));
        }
        assert_eq!(g1.search(&v(&[10.0, 0.0]), 5), g2.search(&v(&[10.0, 0.0]), 5));
    }
}
