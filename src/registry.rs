//! Spatial index of open edges.
//!
//! Edge midpoints are bucketed into a uniform grid. A radius query visits the
//! cells overlapping the query cube and filters by exact distance. Small
//! registries, unbounded radii and queries covering more cells than entries
//! fall back to a linear scan.
//!
//! Results are ordered by distance to the query point, then by slot key, so
//! equal inputs always produce equal outputs.

use crate::arena::UnitId;
use crate::geometry::TypeSet;
use glam::DVec3;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

type Cell = (i64, i64, i64);

/// Addresses one edge slot of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub unit: UnitId,
    pub edge: usize,
}

impl SlotKey {
    pub const fn new(unit: UnitId, edge: usize) -> Self {
        Self { unit, edge }
    }
}

/// An open edge as seen by placement and re-attachment queries.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenEdgeEntry {
    pub unit: UnitId,
    pub edge: usize,
    pub polygon_type: u8,
    /// World-space edge midpoint.
    pub midpoint: DVec3,
    /// World-space in-plane outward normal of the edge.
    pub normal: DVec3,
    /// World-space face normal of the owning unit.
    pub face_normal: DVec3,
    pub length: f64,
    /// Polygon types that may attach here.
    pub compatible: TypeSet,
}

impl OpenEdgeEntry {
    #[inline]
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.unit, self.edge)
    }
}

#[derive(Debug, Clone)]
pub struct OpenEdgeRegistry {
    entries: FxHashMap<SlotKey, OpenEdgeEntry>,
    cells: FxHashMap<Cell, Vec<SlotKey>>,
    cell_size: f64,
    naive_threshold: usize,
}

impl OpenEdgeRegistry {
    pub fn new(cell_size: f64, naive_threshold: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            cells: FxHashMap::default(),
            cell_size,
            naive_threshold,
        }
    }

    #[inline]
    fn cell_coords(&self, p: DVec3) -> Cell {
        let discretize = |v: f64| (v / self.cell_size).floor() as i64;
        (discretize(p.x), discretize(p.y), discretize(p.z))
    }

    /// Inserts `entry`. Returns `false` and changes nothing if the slot is
    /// already registered.
    pub fn register(&mut self, entry: OpenEdgeEntry) -> bool {
        let key = entry.key();
        if self.entries.contains_key(&key) {
            return false;
        }
        let cell = self.cell_coords(entry.midpoint);
        self.cells.entry(cell).or_default().push(key);
        self.entries.insert(key, entry);
        true
    }

    /// Removes and returns the entry for `(unit, edge)`, if registered.
    pub fn unregister(&mut self, unit: UnitId, edge: usize) -> Option<OpenEdgeEntry> {
        let key = SlotKey::new(unit, edge);
        let entry = self.entries.remove(&key)?;
        let cell = self.cell_coords(entry.midpoint);
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.retain(|k| *k != key);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
        Some(entry)
    }

    pub fn contains(&self, unit: UnitId, edge: usize) -> bool {
        self.entries.contains_key(&SlotKey::new(unit, edge))
    }

    pub fn get(&self, unit: UnitId, edge: usize) -> Option<&OpenEdgeEntry> {
        self.entries.get(&SlotKey::new(unit, edge))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in slot-key order.
    pub fn iter(&self) -> impl Iterator<Item = &OpenEdgeEntry> {
        let mut keys: Vec<&SlotKey> = self.entries.keys().collect();
        keys.sort_unstable();
        keys.into_iter().filter_map(move |key| self.entries.get(key))
    }

    /// Open edges whose midpoint lies within `radius` of `point`.
    pub fn query_near(&self, point: DVec3, radius: f64) -> Vec<&OpenEdgeEntry> {
        if radius < 0.0 || radius.is_nan() {
            return Vec::new();
        }
        let mut hits: Vec<(f64, &OpenEdgeEntry)> = if self.use_linear_scan(radius) {
            self.entries
                .values()
                .map(|entry| (entry.midpoint.distance(point), entry))
                .filter(|(d, _)| *d <= radius)
                .collect()
        } else {
            let (lo, hi) = (
                self.cell_coords(point - DVec3::splat(radius)),
                self.cell_coords(point + DVec3::splat(radius)),
            );
            let mut hits = Vec::new();
            for x in lo.0..=hi.0 {
                for y in lo.1..=hi.1 {
                    for z in lo.2..=hi.2 {
                        let Some(bucket) = self.cells.get(&(x, y, z)) else {
                            continue;
                        };
                        for key in bucket {
                            if let Some(entry) = self.entries.get(key) {
                                let d = entry.midpoint.distance(point);
                                if d <= radius {
                                    hits.push((d, entry));
                                }
                            }
                        }
                    }
                }
            }
            hits
        };
        hits.sort_by(|(da, a), (db, b)| da.total_cmp(db).then_with(|| a.key().cmp(&b.key())));
        hits.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Like [`query_near`](Self::query_near), keeping only edges that accept
    /// `polygon_type`.
    pub fn query_compatible(
        &self,
        point: DVec3,
        radius: f64,
        polygon_type: u8,
    ) -> Vec<&OpenEdgeEntry> {
        self.query_near(point, radius)
            .into_iter()
            .filter(|entry| entry.compatible.contains(polygon_type))
            .collect()
    }

    fn use_linear_scan(&self, radius: f64) -> bool {
        if self.entries.len() <= self.naive_threshold || !radius.is_finite() {
            return true;
        }
        let span = (2.0 * radius / self.cell_size).ceil() + 1.0;
        span * span * span > self.entries.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;

    fn entry(unit: u32, edge: usize, x: f64, polygon_type: u8) -> OpenEdgeEntry {
        OpenEdgeEntry {
            unit: UnitId::new(unit, 0),
            edge,
            polygon_type,
            midpoint: DVec3::new(x, 0.0, 0.0),
            normal: DVec3::X,
            face_normal: DVec3::Z,
            length: 1.0,
            compatible: [polygon_type].into_iter().collect(),
        }
    }

    #[test]
    fn register_is_idempotent_per_slot() {
        let mut registry = OpenEdgeRegistry::new(1.0, 32);
        assert!(registry.register(entry(0, 0, 0.5, 4)));
        assert!(!registry.register(entry(0, 0, 9.0, 4)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(UnitId::new(0, 0), 0).unwrap().midpoint.x, 0.5);
        assert!(registry.unregister(UnitId::new(0, 0), 0).is_some());
        assert!(registry.unregister(UnitId::new(0, 0), 0).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn radius_query_orders_by_distance() {
        let mut registry = OpenEdgeRegistry::new(1.0, 32);
        registry.register(entry(0, 0, 2.0, 4));
        registry.register(entry(1, 0, 0.5, 4));
        registry.register(entry(2, 0, 5.0, 4));
        let hits: Vec<u32> = registry
            .query_near(DVec3::ZERO, 2.5)
            .iter()
            .map(|e| e.unit.index())
            .collect();
        assert_eq!(hits, vec![1, 0]);
    }

    #[test]
    fn grid_and_linear_scan_agree() {
        let mut grid = OpenEdgeRegistry::new(0.5, 0);
        let mut naive = OpenEdgeRegistry::new(0.5, usize::MAX);
        for i in 0..256u32 {
            let x = (i as f64) * 0.37 - 40.0;
            grid.register(entry(i, (i % 4) as usize, x, 4));
            naive.register(entry(i, (i % 4) as usize, x, 4));
        }
        let query = DVec3::new(-3.2, 0.1, 0.0);
        let a: Vec<SlotKey> = grid.query_near(query, 1.0).iter().map(|e| e.key()).collect();
        let b: Vec<SlotKey> = naive.query_near(query, 1.0).iter().map(|e| e.key()).collect();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn equidistant_hits_break_ties_by_key() {
        let mut registry = OpenEdgeRegistry::new(1.0, 32);
        registry.register(entry(3, 1, 1.0, 4));
        registry.register(entry(3, 0, -1.0, 4));
        let keys: Vec<usize> = registry
            .query_near(DVec3::ZERO, 1.0)
            .iter()
            .map(|e| e.edge)
            .collect();
        assert_eq!(keys, vec![0, 1]);
    }

    #[test]
    fn compatible_query_filters_by_type() {
        let mut registry = OpenEdgeRegistry::new(1.0, 32);
        registry.register(entry(0, 0, 0.0, 3));
        registry.register(entry(1, 0, 0.1, 4));
        let hits = registry.query_compatible(DVec3::ZERO, 1.0, 4);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].unit, UnitId::new(1, 0));
        assert!(registry.query_near(DVec3::ZERO, -1.0).is_empty());
        assert_eq!(registry.query_near(DVec3::ZERO, f64::INFINITY).len(), 2);
    }
}
