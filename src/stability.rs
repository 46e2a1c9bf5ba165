//! Stability matrix: which units orphan which others when removed.
//!
//! Cell `(i, j)` is set when every attachment of `j` goes to `i` and, once
//! `i` is gone, none of `j`'s slots could re-attach to a compatible open edge
//! of a third unit within the re-attachment radius. Derived from the liaison
//! graph on demand and never mutated.

use crate::arena::UnitId;
use crate::liaison::LiaisonGraph;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityMatrix {
    ids: Vec<UnitId>,
    index: FxHashMap<UnitId, usize>,
    cells: Vec<bool>,
}

pub fn compute_stability_matrix(graph: &LiaisonGraph, reattach_radius: f64) -> StabilityMatrix {
    let ids = graph.unit_ids();
    let index: FxHashMap<UnitId, usize> = ids.iter().enumerate().map(|(k, id)| (*id, k)).collect();
    let n = ids.len();
    let mut cells = vec![false; n * n];

    for (col, &j) in ids.iter().enumerate() {
        let Ok(neighbors) = graph.neighbors(j) else {
            continue;
        };
        if neighbors.len() != 1 {
            continue;
        }
        let Some(&i) = neighbors.iter().next() else {
            continue;
        };
        if !can_reattach(graph, j, i, reattach_radius) {
            if let Some(&row) = index.get(&i) {
                cells[row * n + col] = true;
            }
        }
    }

    StabilityMatrix { ids, index, cells }
}

/// Whether `unit`, stripped of its attachments to `removed`, could find a
/// compatible open edge of some third unit near one of its edges.
fn can_reattach(graph: &LiaisonGraph, unit: UnitId, removed: UnitId, radius: f64) -> bool {
    let Some(u) = graph.unit(unit) else {
        return false;
    };
    let polygon_type = u.polygon_type();
    (0..u.edge_count())
        .filter_map(|edge| u.world_edge(edge))
        .any(|edge| {
            graph
                .registry()
                .query_compatible(edge.midpoint, radius, polygon_type)
                .into_iter()
                .any(|entry| {
                    entry.unit != unit
                        && entry.unit != removed
                        && u.compatible().contains(entry.polygon_type)
                })
        })
}

impl StabilityMatrix {
    /// Unit ids in row/column order.
    pub fn ids(&self) -> &[UnitId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether removing `i` would orphan `j`.
    pub fn blocks(&self, i: UnitId, j: UnitId) -> bool {
        match (self.index.get(&i), self.index.get(&j)) {
            (Some(&row), Some(&col)) => self.cells[row * self.ids.len() + col],
            _ => false,
        }
    }

    /// Units orphaned by removing `i`.
    pub fn dependents(&self, i: UnitId) -> Vec<UnitId> {
        let Some(&row) = self.index.get(&i) else {
            return Vec::new();
        };
        let n = self.ids.len();
        (0..n)
            .filter(|&col| self.cells[row * n + col])
            .map(|col| self.ids[col])
            .collect()
    }

    /// Units whose removal would orphan `j`.
    pub fn supporters(&self, j: UnitId) -> Vec<UnitId> {
        let Some(&col) = self.index.get(&j) else {
            return Vec::new();
        };
        let n = self.ids.len();
        (0..n)
            .filter(|&row| self.cells[row * n + col])
            .map(|row| self.ids[row])
            .collect()
    }

    /// Units that orphan at least one other unit.
    pub fn critical_units(&self) -> Vec<UnitId> {
        let n = self.ids.len();
        (0..n)
            .filter(|&row| self.cells[row * n..(row + 1) * n].iter().any(|c| *c))
            .map(|row| self.ids[row])
            .collect()
    }
}
