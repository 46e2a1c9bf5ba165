//! Topology hashing via Weisfeiler–Lehman refinement.
//!
//! The topology hash of an assembly depends only on the polygon types of its
//! units, which pairs are attached, and the fold context of each attachment.
//! Unit ids, positions and insertion order do not contribute, so isomorphic
//! assemblies hash equal. Used as the key of the topology cache.
//!
//! # Citations
//! - Weisfeiler–Lehman graph isomorphism test: Weisfeiler & Lehman, "A reduction of a graph to a canonical form" (1968)
//! - SHA-256: NIST FIPS 180-4 (2015)

use crate::arena::UnitId;
use crate::liaison::LiaisonGraph;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// A 256-bit hash value.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashValue(pub [u8; 32]);

impl HashValue {
    #[inline]
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of `b"PAE:<domain>:v1" || len(data) as u64 LE || data`.
    pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"PAE:");
        hasher.update(domain);
        hasher.update(b":v1");
        hasher.update((data.len() as u64).to_le_bytes());
        hasher.update(data);
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for HashValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HashValue({:02x}{:02x}{:02x}{:02x}…)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// WL labels after exactly `rounds` refinement rounds, restricted to `scope`
/// when given. Attachments leaving the scope are ignored.
pub fn wl_labels(
    graph: &LiaisonGraph,
    rounds: usize,
    scope: Option<&BTreeSet<UnitId>>,
) -> BTreeMap<UnitId, HashValue> {
    let in_scope = |id: &UnitId| scope.map_or(true, |s| s.contains(id));

    let mut labels: BTreeMap<UnitId, HashValue> = graph
        .units()
        .filter(|(id, _)| in_scope(id))
        .map(|(id, unit)| {
            let mut data = Vec::with_capacity(9);
            data.push(unit.polygon_type());
            data.extend_from_slice(&(unit.edge_count() as u64).to_le_bytes());
            (id, HashValue::hash_with_domain(b"WL_INIT", &data))
        })
        .collect();

    // Incident (neighbour, joint label) pairs per unit.
    let mut incident: BTreeMap<UnitId, Vec<(UnitId, HashValue)>> = BTreeMap::new();
    for (_, edge) in graph.attachments() {
        let (a, b) = (edge.source.unit, edge.target.unit);
        if !in_scope(&a) || !in_scope(&b) {
            continue;
        }
        let mut data = vec![edge.fold.key.lo, edge.fold.key.hi];
        data.extend_from_slice(edge.fold.key.context.as_bytes());
        let joint = HashValue::hash_with_domain(b"JOINT", &data);
        incident.entry(a).or_default().push((b, joint));
        incident.entry(b).or_default().push((a, joint));
    }

    for round in 0..rounds {
        let mut next = BTreeMap::new();
        for (id, old) in &labels {
            let mut around: Vec<[u8; 32]> = incident
                .get(id)
                .map(|list| {
                    list.iter()
                        .filter_map(|(other, joint)| {
                            let neighbour = labels.get(other)?;
                            let mut data = Vec::with_capacity(64);
                            data.extend_from_slice(joint.as_bytes());
                            data.extend_from_slice(neighbour.as_bytes());
                            Some(HashValue::hash_with_domain(b"WL_EDGE", &data).0)
                        })
                        .collect()
                })
                .unwrap_or_default();
            around.sort_unstable();

            let mut data = Vec::with_capacity(40 + 32 * around.len());
            data.extend_from_slice(&(round as u64).to_le_bytes());
            data.extend_from_slice(old.as_bytes());
            for label in &around {
                data.extend_from_slice(label);
            }
            let label = HashValue::hash_with_domain(b"WL_ROUND", &data);
            next.insert(*id, label);
        }
        labels = next;
    }
    labels
}

/// Order-independent hash of the whole assembly's topology.
pub fn topology_hash(graph: &LiaisonGraph, rounds: usize) -> HashValue {
    combine_labels(wl_labels(graph, rounds, None).values())
}

/// Topology hash of the sub-assembly induced by `units`.
pub fn subassembly_hash(graph: &LiaisonGraph, units: &BTreeSet<UnitId>, rounds: usize) -> HashValue {
    combine_labels(wl_labels(graph, rounds, Some(units)).values())
}

/// Order-independent hash of a multiset of WL labels.
///
/// Labels of disconnected components never influence each other, so the
/// union of per-component labels combines to the whole assembly's hash.
pub fn combine_labels<'a>(labels: impl IntoIterator<Item = &'a HashValue>) -> HashValue {
    let mut sorted: Vec<&HashValue> = labels.into_iter().collect();
    sorted.sort_unstable();
    let mut data = Vec::with_capacity(8 + 32 * sorted.len());
    data.extend_from_slice(&(sorted.len() as u64).to_le_bytes());
    for label in sorted {
        data.extend_from_slice(label.as_bytes());
    }
    HashValue::hash_with_domain(b"TOPOLOGY", &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fold::{FoldCodeCache, DEFAULT_CONTEXT};
    use crate::geometry::{GeometryProvider, RegularPolygons, TypeSet};
    use crate::liaison::AttachmentState;
    use glam::{DQuat, DVec3};
    use std::sync::Arc;

    fn strip(types: &[u8], offset: f64) -> LiaisonGraph {
        let provider = RegularPolygons::new();
        let cache = FoldCodeCache::new();
        let mut graph = LiaisonGraph::new(0.01, 1.0, 32);
        let ids: Vec<UnitId> = types
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let template = Arc::new(provider.get_template(t).unwrap());
                let pos = DVec3::new(offset + 3.0 * i as f64, 0.0, 0.0);
                graph.add_unit(template, pos, DQuat::IDENTITY, TypeSet::EMPTY)
            })
            .collect();
        for pair in ids.windows(2) {
            let (ta, tb) = (
                graph.unit(pair[0]).unwrap().polygon_type(),
                graph.unit(pair[1]).unwrap().polygon_type(),
            );
            let fold = cache.get_or_create(&provider, ta, tb, DEFAULT_CONTEXT).unwrap();
            graph
                .add_attachment(pair[0], 0, pair[1], 1, fold, AttachmentState::Permanent)
                .unwrap();
        }
        graph
    }

    #[test]
    fn isomorphic_assemblies_hash_equal() {
        let a = strip(&[4, 4, 4], 0.0);
        let b = strip(&[4, 4, 4], 100.0);
        assert_eq!(topology_hash(&a, 4), topology_hash(&b, 4));
    }

    #[test]
    fn type_and_shape_changes_alter_hash() {
        let squares = strip(&[4, 4, 4], 0.0);
        let mixed = strip(&[4, 3, 4], 0.0);
        let shorter = strip(&[4, 4], 0.0);
        let h = topology_hash(&squares, 4);
        assert_ne!(h, topology_hash(&mixed, 4));
        assert_ne!(h, topology_hash(&shorter, 4));
    }

    #[test]
    fn subassembly_matches_standalone_copy() {
        let long = strip(&[4, 4, 4], 0.0);
        let ids = long.unit_ids();
        let head: BTreeSet<UnitId> = ids[..2].iter().copied().collect();
        let short = strip(&[4, 4], 0.0);
        assert_eq!(subassembly_hash(&long, &head, 4), topology_hash(&short, 4));
    }

    #[test]
    fn every_round_refines_labels() {
        let g = strip(&[4, 4, 4], 0.0);
        let one = wl_labels(&g, 1, None);
        let two = wl_labels(&g, 2, None);
        for id in g.unit_ids() {
            assert_ne!(one[&id], two[&id]);
        }
        assert_ne!(topology_hash(&g, 1), topology_hash(&g, 2));
    }

    #[test]
    fn display_shows_prefix() {
        let h = HashValue::hash_with_domain(b"TEST", b"");
        assert!(h.to_string().starts_with("HashValue("));
        assert_ne!(h, HashValue::zero());
    }
}
