//! Combinatorial estimate of distinct valid realisations of an assembly.
//!
//! `I = O × s_total × Ac × C_sym`, where
//! - `s_total = Π_u (1 + k_u)` and `k_u` counts the open slots of `u` that
//!   could still take a compatible neighbour;
//! - `Ac = n! / Π_t count_t!` over polygon-type multiplicities;
//! - `C_sym = Π_e 1 / order_e` over attachment joint symmetry orders;
//! - `O` is read from the topology cache for the assembly's canonical hash,
//!   otherwise cascaded over the decomposition tree with component-level
//!   cache lookups and memoised under the hash.
//!
//! The three product factors are kept as running logarithms updated by the
//! mutation hooks, so only the units and attachments touched by a mutation
//! are revisited.
//!
//! `O` is recomputed at most once per graph revision and topology-cache
//! generation. From [`INCREMENTAL_MIN_UNITS`] units upwards the estimator
//! keeps the WL labels and hash of every connected component and re-hashes
//! only the components holding a unit the mutation hooks marked dirty; the
//! whole-assembly hash is combined from the cached labels. Smaller
//! assemblies are hashed and cascaded from scratch.

use crate::arena::{AttachmentId, UnitId};
use crate::decomposition::{DecompositionTree, NodeKind};
use crate::fingerprint::{combine_labels, subassembly_hash, topology_hash, wl_labels, HashValue};
use crate::liaison::{AttachmentEdge, LiaisonGraph, RemovedUnit};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Snapshot of the combinatorial factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub i: f64,
    pub o: f64,
    pub s_total: f64,
    pub ac: f64,
    pub c_sym: f64,
}

/// Known `O` values keyed by canonical topology hash.
///
/// Shareable between assemblies.
#[derive(Debug, Default)]
pub struct TopologyCache {
    entries: RwLock<FxHashMap<HashValue, f64>>,
    generation: AtomicU64,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `o` for `hash`, replacing any previous value.
    pub fn seed(&self, hash: HashValue, o: f64) {
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, o);
        if previous != Some(o) {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Bumped whenever a seed changes the cache contents.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn get(&self, hash: &HashValue) -> Option<f64> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Below this many units `O` is recomputed from scratch.
pub const INCREMENTAL_MIN_UNITS: usize = 16;

/// Cached topology of one connected component.
#[derive(Debug, Clone)]
struct Component {
    units: Vec<UnitId>,
    labels: Vec<HashValue>,
    hash: HashValue,
}

#[derive(Debug, Clone, Default)]
pub struct Estimator {
    ln_s_total: f64,
    ln_ac: f64,
    ln_c_sym: f64,
    freedom: FxHashMap<UnitId, usize>,
    types: FxHashMap<UnitId, u8>,
    type_counts: BTreeMap<u8, usize>,
    orders: FxHashMap<AttachmentId, u32>,
    revision: u64,
    /// `(graph revision, topology generation, O)`.
    o_memo: Option<(u64, u64, f64)>,
    /// Keyed by the component's smallest unit id.
    components: BTreeMap<UnitId, Component>,
    member: FxHashMap<UnitId, UnitId>,
    dirty: BTreeSet<UnitId>,
    component_hashes: usize,
    wl_rounds: usize,
    epsilon: f64,
}

fn connected_units(graph: &LiaisonGraph, start: UnitId) -> BTreeSet<UnitId> {
    let mut seen = BTreeSet::from([start]);
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        for next in graph.neighbors(id).unwrap_or_default() {
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    seen
}

fn freedom_of(graph: &LiaisonGraph, id: UnitId) -> usize {
    graph.unit(id).map_or(0, |unit| {
        if unit.compatible().is_empty() {
            0
        } else {
            unit.open_count()
        }
    })
}

impl Estimator {
    pub fn new(wl_rounds: usize, epsilon: f64) -> Self {
        Self {
            wl_rounds,
            epsilon,
            ..Self::default()
        }
    }

    /// Estimator state for `graph` computed from scratch.
    pub fn rebuild(graph: &LiaisonGraph, wl_rounds: usize, epsilon: f64) -> Self {
        let mut estimator = Self::new(wl_rounds, epsilon);
        for id in graph.unit_ids() {
            estimator.track_unit(graph, id);
        }
        for (id, edge) in graph.attachments() {
            estimator.track_attachment(id, edge.fold.symmetry_order);
        }
        estimator.dirty = graph.unit_ids().into_iter().collect();
        estimator.revision = graph.revision();
        estimator
    }

    pub fn on_unit_added(&mut self, graph: &LiaisonGraph, id: UnitId) {
        self.track_unit(graph, id);
        self.dirty.insert(id);
        self.revision = graph.revision();
    }

    pub fn on_attached(&mut self, graph: &LiaisonGraph, id: AttachmentId) {
        if let Some(edge) = graph.attachment(id) {
            self.track_attachment(id, edge.fold.symmetry_order);
            self.refresh_unit(graph, edge.source.unit);
            self.refresh_unit(graph, edge.target.unit);
            self.dirty.extend([edge.source.unit, edge.target.unit]);
        }
        self.revision = graph.revision();
    }

    pub fn on_detached(&mut self, graph: &LiaisonGraph, edge: &AttachmentEdge) {
        self.untrack_attachment(edge.id);
        self.refresh_unit(graph, edge.source.unit);
        self.refresh_unit(graph, edge.target.unit);
        self.dirty.extend([edge.source.unit, edge.target.unit]);
        self.revision = graph.revision();
    }

    pub fn on_unit_removed(&mut self, graph: &LiaisonGraph, removed: &RemovedUnit) {
        for edge in &removed.detached {
            self.untrack_attachment(edge.id);
            if let Some(other) = edge.other(removed.id) {
                self.refresh_unit(graph, other.unit);
                self.dirty.insert(other.unit);
            }
        }
        self.dirty.insert(removed.id);
        if let Some(k) = self.freedom.remove(&removed.id) {
            self.ln_s_total -= (1.0 + k as f64).ln();
        }
        if let Some(t) = self.types.remove(&removed.id) {
            let n = self.types.len() + 1;
            let count = self.type_counts.get(&t).copied().unwrap_or(1);
            self.ln_ac -= (n as f64).ln() - (count as f64).ln();
            match count {
                0 | 1 => {
                    self.type_counts.remove(&t);
                }
                _ => {
                    self.type_counts.insert(t, count - 1);
                }
            }
        }
        self.revision = graph.revision();
    }

    /// Re-reads the freedom of one unit after its slots or compatibility
    /// changed.
    pub fn refresh_unit(&mut self, graph: &LiaisonGraph, id: UnitId) {
        let Some(old) = self.freedom.get(&id).copied() else {
            return;
        };
        let new = freedom_of(graph, id);
        if new != old {
            self.ln_s_total += (1.0 + new as f64).ln() - (1.0 + old as f64).ln();
            self.freedom.insert(id, new);
        }
    }

    /// Marks the estimator up to date with `graph` after a mutation that
    /// needs no factor updates.
    pub fn touch(&mut self, graph: &LiaisonGraph) {
        self.revision = graph.revision();
    }

    /// Current estimate, resynchronising from scratch if the incremental
    /// state no longer matches `graph`.
    pub fn estimate(&mut self, graph: &LiaisonGraph, topology: &TopologyCache) -> Estimate {
        if !self.is_consistent(graph) {
            warn!(
                tracked_units = self.freedom.len(),
                units = graph.unit_count(),
                tracked_revision = self.revision,
                revision = graph.revision(),
                "estimator out of sync, rebuilding"
            );
            let o_memo = self.o_memo;
            *self = Self::rebuild(graph, self.wl_rounds, self.epsilon);
            self.o_memo = o_memo;
        }
        let o = self.topological_count(graph, topology);
        let (s_total, ac, c_sym) = (self.ln_s_total.exp(), self.ln_ac.exp(), self.ln_c_sym.exp());
        Estimate {
            i: o * s_total * ac * c_sym,
            o,
            s_total,
            ac,
            c_sym,
        }
    }

    fn is_consistent(&self, graph: &LiaisonGraph) -> bool {
        self.revision == graph.revision()
            && self.freedom.len() == graph.unit_count()
            && self.orders.len() == graph.attachment_count()
            && self.type_counts.values().sum::<usize>() == graph.unit_count()
    }

    /// Sub-assembly hashes computed by the incremental path so far.
    pub fn component_hashes(&self) -> usize {
        self.component_hashes
    }

    fn topological_count(&mut self, graph: &LiaisonGraph, topology: &TopologyCache) -> f64 {
        if let Some((revision, generation, o)) = self.o_memo {
            if revision == graph.revision() && generation == topology.generation() {
                return o;
            }
        }
        let (hash, o, complete) = if graph.unit_count() < INCREMENTAL_MIN_UNITS {
            self.reset_components(graph);
            self.cascade_from_scratch(graph, topology)
        } else {
            self.refresh_components(graph);
            self.cascade_components(topology)
        };
        // An unknown component contributes 1 provisionally; that guess must
        // not shadow a later seed.
        if complete && topology.get(&hash).is_none() {
            topology.seed(hash, o);
            debug!(%hash, o, "topology count cascaded");
        }
        self.o_memo = Some((graph.revision(), topology.generation(), o));
        o
    }

    /// `(whole hash, O, every component known)` via the decomposition tree.
    fn cascade_from_scratch(
        &self,
        graph: &LiaisonGraph,
        topology: &TopologyCache,
    ) -> (HashValue, f64, bool) {
        let hash = topology_hash(graph, self.wl_rounds);
        if let Some(o) = topology.get(&hash) {
            return (hash, o, true);
        }
        let tree = DecompositionTree::build(graph, self.epsilon);
        let components: BTreeSet<usize> = tree.components().iter().copied().collect();
        let rounds = self.wl_rounds;
        let mut complete = true;
        let o = tree.cascade(|index, node| {
            if !components.contains(&index) || matches!(node.kind, NodeKind::Leaf(_)) {
                return None;
            }
            let units: BTreeSet<UnitId> = node.units.iter().copied().collect();
            let known = topology.get(&subassembly_hash(graph, &units, rounds));
            complete &= known.is_some();
            known
        });
        (hash, o, complete)
    }

    /// Same as [`cascade_from_scratch`](Self::cascade_from_scratch) over the
    /// cached components.
    fn cascade_components(&self, topology: &TopologyCache) -> (HashValue, f64, bool) {
        let hash = combine_labels(self.components.values().flat_map(|c| c.labels.iter()));
        if let Some(o) = topology.get(&hash) {
            return (hash, o, true);
        }
        let mut o = 1.0;
        let mut complete = true;
        for component in self.components.values().filter(|c| c.units.len() > 1) {
            match topology.get(&component.hash) {
                Some(known) => o *= known,
                None => complete = false,
            }
        }
        (hash, o, complete)
    }

    fn reset_components(&mut self, graph: &LiaisonGraph) {
        self.components.clear();
        self.member.clear();
        self.dirty = graph.unit_ids().into_iter().collect();
    }

    /// Drops every cached component holding a dirty unit and re-hashes the
    /// components now reachable from the dropped and dirty units.
    fn refresh_components(&mut self, graph: &LiaisonGraph) {
        let mut seeds = std::mem::take(&mut self.dirty);
        let touched: Vec<UnitId> = seeds.iter().copied().collect();
        for id in touched {
            let Some(key) = self.member.get(&id).copied() else {
                continue;
            };
            if let Some(component) = self.components.remove(&key) {
                for unit in component.units {
                    self.member.remove(&unit);
                    seeds.insert(unit);
                }
            }
        }

        for id in seeds {
            if self.member.contains_key(&id) || !graph.contains_unit(id) {
                continue;
            }
            let units = connected_units(graph, id);
            let labels: Vec<HashValue> = wl_labels(graph, self.wl_rounds, Some(&units))
                .into_values()
                .collect();
            let hash = combine_labels(&labels);
            let key = units.first().copied().unwrap_or(id);
            for unit in &units {
                self.member.insert(*unit, key);
            }
            self.components.insert(
                key,
                Component {
                    units: units.into_iter().collect(),
                    labels,
                    hash,
                },
            );
            self.component_hashes += 1;
        }
        trace!(
            components = self.components.len(),
            hashed = self.component_hashes,
            "components refreshed"
        );
    }

    fn track_unit(&mut self, graph: &LiaisonGraph, id: UnitId) {
        let Some(unit) = graph.unit(id) else {
            return;
        };
        if self.freedom.contains_key(&id) {
            return;
        }
        let k = freedom_of(graph, id);
        self.freedom.insert(id, k);
        self.ln_s_total += (1.0 + k as f64).ln();

        let t = unit.polygon_type();
        self.types.insert(id, t);
        let count = self.type_counts.entry(t).or_insert(0);
        *count += 1;
        let count = *count;
        self.ln_ac += (self.types.len() as f64).ln() - (count as f64).ln();
    }

    fn track_attachment(&mut self, id: AttachmentId, order: u32) {
        let order = order.max(1);
        if self.orders.insert(id, order).is_none() {
            self.ln_c_sym -= (order as f64).ln();
        }
    }

    fn untrack_attachment(&mut self, id: AttachmentId) {
        if let Some(order) = self.orders.remove(&id) {
            self.ln_c_sym += (order as f64).ln();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fold::{FoldCodeCache, DEFAULT_CONTEXT};
    use crate::geometry::{GeometryProvider, RegularPolygons, TypeSet};
    use crate::liaison::AttachmentState;
    use crate::test_support::{add_square, graph, planar_fold, strip};
    use glam::{DQuat, DVec3};
    use std::sync::Arc;

    const EPS: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    fn assert_matches_rebuild(est: &mut Estimator, g: &LiaisonGraph, topology: &TopologyCache) {
        let incremental = est.estimate(g, topology);
        let full = Estimator::rebuild(g, 4, 1e-6).estimate(g, topology);
        assert!(close(incremental.s_total, full.s_total));
        assert!(close(incremental.ac, full.ac));
        assert!(close(incremental.c_sym, full.c_sym));
        assert!(close(incremental.i, full.i));
    }

    #[test]
    fn lone_unit_counts_its_open_edges() {
        let mut g = graph();
        let id = add_square(&mut g, DVec3::ZERO);
        let mut est = Estimator::new(4, 1e-6);
        est.on_unit_added(&g, id);
        let e = est.estimate(&g, &TopologyCache::new());
        assert!(close(e.s_total, 5.0));
        assert!(close(e.ac, 1.0));
        assert!(close(e.c_sym, 1.0));
        assert!(close(e.o, 1.0));
        assert!(close(e.i, 5.0));
    }

    #[test]
    fn closing_edges_shrinks_orientation_freedom() {
        let mut g = graph();
        let topology = TopologyCache::new();
        let mut est = Estimator::new(4, 1e-6);
        let ids: Vec<UnitId> = (0..3)
            .map(|i| {
                let id = add_square(&mut g, DVec3::X * i as f64);
                est.on_unit_added(&g, id);
                id
            })
            .collect();
        assert!(close(est.estimate(&g, &topology).s_total, 125.0));

        let first = g
            .add_attachment(ids[0], 0, ids[1], 2, planar_fold(), AttachmentState::Permanent)
            .unwrap();
        est.on_attached(&g, first);
        let one = est.estimate(&g, &topology);
        assert!(close(one.s_total, 80.0));
        assert!(close(one.c_sym, 0.5));

        let second = g
            .add_attachment(ids[1], 0, ids[2], 2, planar_fold(), AttachmentState::Permanent)
            .unwrap();
        est.on_attached(&g, second);
        let two = est.estimate(&g, &topology);
        assert!(close(two.s_total, 48.0));
        assert!(two.s_total < one.s_total);
        assert!(close(two.c_sym, 0.25));
        assert_matches_rebuild(&mut est, &g, &topology);
    }

    #[test]
    fn type_permutations_follow_multiplicities() {
        let provider = RegularPolygons::new();
        let mut g = graph();
        let mut est = Estimator::new(4, 1e-6);
        let mut ids = Vec::new();
        for (i, t) in [4u8, 4, 3, 5].into_iter().enumerate() {
            let template = Arc::new(provider.get_template(t).unwrap());
            let id = g.add_unit(template, DVec3::X * 3.0 * i as f64, DQuat::IDENTITY, TypeSet::EMPTY);
            est.on_unit_added(&g, id);
            ids.push(id);
        }
        let topology = TopologyCache::new();
        // 4! / 2! = 12; no compatible types means no orientation freedom.
        let e = est.estimate(&g, &topology);
        assert!(close(e.ac, 12.0));
        assert!(close(e.s_total, 1.0));

        let removed = g.remove_unit(ids[0]).unwrap();
        est.on_unit_removed(&g, &removed);
        // 3! / 1! = 6
        assert!(close(est.estimate(&g, &topology).ac, 6.0));
        assert_matches_rebuild(&mut est, &g, &topology);
    }

    #[test]
    fn removal_reverses_attachment_factors() {
        let mut g = graph();
        let topology = TopologyCache::new();
        let ids = strip(&mut g, 3, DVec3::ZERO);
        let mut est = Estimator::rebuild(&g, 4, 1e-6);
        let removed = g.remove_unit(ids[1]).unwrap();
        est.on_unit_removed(&g, &removed);
        let e = est.estimate(&g, &topology);
        assert!(close(e.c_sym, 1.0));
        assert!(close(e.s_total, 25.0));
        assert_matches_rebuild(&mut est, &g, &topology);
    }

    #[test]
    fn stale_state_is_rebuilt() {
        let mut g = graph();
        let topology = TopologyCache::new();
        let mut est = Estimator::new(4, 1e-6);
        // Mutations the estimator never heard about.
        strip(&mut g, 2, DVec3::ZERO);
        let e = est.estimate(&g, &topology);
        assert!(close(e.s_total, 16.0));
        assert!(close(e.c_sym, 0.5));
        assert!(close(e.ac, 1.0));
    }

    #[test]
    fn seeded_topology_supplies_o() {
        let mut g = graph();
        strip(&mut g, 2, DVec3::ZERO);
        let topology = TopologyCache::new();
        topology.seed(topology_hash(&g, 4), 7.0);
        let mut est = Estimator::rebuild(&g, 4, 1e-6);
        let e = est.estimate(&g, &topology);
        assert!(close(e.o, 7.0));
        assert!(close(e.i, 7.0 * 16.0 * 0.5));
    }

    #[test]
    fn component_values_cascade_into_o() {
        // Seed a lone pair, then ask about two disjoint copies of it.
        let mut pair = graph();
        strip(&mut pair, 2, DVec3::ZERO);
        let topology = TopologyCache::new();
        topology.seed(topology_hash(&pair, 4), 3.0);

        let mut g = graph();
        strip(&mut g, 2, DVec3::ZERO);
        strip(&mut g, 2, DVec3::new(10.0, 0.0, 0.0));
        let mut est = Estimator::rebuild(&g, 4, 1e-6);
        let e = est.estimate(&g, &topology);
        assert!(close(e.o, 9.0));
        // The cascaded value is memoised under the whole assembly's hash.
        assert_eq!(topology.get(&topology_hash(&g, 4)), Some(9.0));
        assert_eq!(topology.len(), 2);
    }

    #[test]
    fn unknown_components_are_not_memoised() {
        let mut g = graph();
        strip(&mut g, 2, DVec3::ZERO);
        strip(&mut g, 2, DVec3::new(10.0, 0.0, 0.0));
        let topology = TopologyCache::new();
        let mut est = Estimator::rebuild(&g, 4, 1e-6);
        assert!(close(est.estimate(&g, &topology).o, 1.0));
        assert!(topology.is_empty());

        // A seed arriving later is picked up without any mutation.
        let mut pair = graph();
        strip(&mut pair, 2, DVec3::ZERO);
        topology.seed(topology_hash(&pair, 4), 3.0);
        assert!(close(est.estimate(&g, &topology).o, 9.0));
        assert_eq!(topology.get(&topology_hash(&g, 4)), Some(9.0));
    }

    #[test]
    fn only_touched_components_are_rehashed() {
        let mut g = graph();
        let topology = TopologyCache::new();
        let first = strip(&mut g, 10, DVec3::ZERO);
        let second = strip(&mut g, 9, DVec3::new(0.0, 20.0, 0.0));
        assert!(g.unit_count() >= INCREMENTAL_MIN_UNITS);
        let second_units: BTreeSet<UnitId> = second.iter().copied().collect();
        topology.seed(subassembly_hash(&g, &second_units, 4), 5.0);

        let mut est = Estimator::rebuild(&g, 4, 1e-6);
        let e = est.estimate(&g, &topology);
        assert_eq!(est.component_hashes(), 2);
        assert!(close(e.o, 5.0));
        // The first strip is unknown, so nothing is memoised for the whole.
        assert_eq!(topology.get(&topology_hash(&g, 4)), None);

        // Grow the first strip by one square.
        let extra = add_square(&mut g, DVec3::X * 10.0);
        est.on_unit_added(&g, extra);
        let joint = g
            .add_attachment(first[9], 0, extra, 2, planar_fold(), AttachmentState::Permanent)
            .unwrap();
        est.on_attached(&g, joint);
        let e = est.estimate(&g, &topology);
        assert_eq!(est.component_hashes(), 3);
        assert!(close(e.o, 5.0));

        let mut grown: BTreeSet<UnitId> = first.iter().copied().collect();
        grown.insert(extra);
        topology.seed(subassembly_hash(&g, &grown, 4), 2.0);
        let e = est.estimate(&g, &topology);
        assert_eq!(est.component_hashes(), 3);
        assert!(close(e.o, 10.0));
        // Cached component labels combine to the whole-assembly hash.
        assert_eq!(topology.get(&topology_hash(&g, 4)), Some(10.0));
        assert_matches_rebuild(&mut est, &g, &topology);
    }

    #[test]
    fn fold_symmetry_enters_c_sym() {
        let provider = RegularPolygons::new();
        let folds = FoldCodeCache::new();
        let mut g = graph();
        let tri = Arc::new(provider.get_template(3).unwrap());
        let sq = Arc::new(provider.get_template(4).unwrap());
        let a = g.add_unit(sq, DVec3::ZERO, DQuat::IDENTITY, TypeSet::EMPTY);
        let b = g.add_unit(tri, DVec3::X, DQuat::IDENTITY, TypeSet::EMPTY);
        let fold = folds.get_or_create(&provider, 4, 3, DEFAULT_CONTEXT).unwrap();
        g.add_attachment(a, 0, b, 0, fold, AttachmentState::Permanent)
            .unwrap();
        let e = Estimator::rebuild(&g, 4, 1e-6).estimate(&g, &TopologyCache::new());
        assert!((e.c_sym - 1.0).abs() < EPS);
        assert!((e.ac - 2.0).abs() < EPS);
    }
}
