//! Boundary interfaces: polygon templates and collision checks.
//!
//! The engine never builds unit geometry itself. A [`GeometryProvider`]
//! supplies a [`PolygonTemplate`] per side count and a [`CollisionOracle`]
//! decides whether a candidate would overlap existing units. Reference
//! implementations of both are provided for callers without their own.
//!
//! # Template convention
//! A template is centred on the origin in the local XY plane with face
//! normal `+Z`. Edge `k` joins vertex `k` to vertex `k + 1`; for regular
//! polygons its midpoint lies at angle `2πk/n`, so edge 0 faces `+X`.

use crate::error::EngineError;
use glam::DVec3;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::ops::RangeInclusive;

/// Smallest side count of the reference provider.
pub const MIN_SIDES: u8 = 3;
/// Largest side count of the reference provider.
pub const MAX_SIDES: u8 = 20;

/// Geometry of a single polygon in its local frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonTemplate {
    pub side_count: u8,
    pub vertices: Vec<DVec3>,
    /// Vertex index pairs, one per edge slot.
    pub edges: Vec<(usize, usize)>,
    pub edge_length: f64,
}

/// An edge of a template expressed in the template's local frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalEdge {
    pub midpoint: DVec3,
    /// In-plane normal pointing away from the centroid.
    pub normal: DVec3,
    pub direction: DVec3,
    pub length: f64,
}

impl PolygonTemplate {
    /// Regular `side_count`-gon with the given edge length.
    pub fn regular(side_count: u8, edge_length: f64) -> Self {
        let n = side_count as usize;
        let step = 2.0 * PI / n as f64;
        let circumradius = edge_length / (2.0 * (PI / n as f64).sin());
        let vertices = (0..n)
            .map(|k| {
                let angle = step * k as f64 - step / 2.0;
                DVec3::new(circumradius * angle.cos(), circumradius * angle.sin(), 0.0)
            })
            .collect();
        let edges = (0..n).map(|k| (k, (k + 1) % n)).collect();
        Self {
            side_count,
            vertices,
            edges,
            edge_length,
        }
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Local geometry of edge `k`, or `None` past the last edge.
    pub fn local_edge(&self, k: usize) -> Option<LocalEdge> {
        let &(i, j) = self.edges.get(k)?;
        let (a, b) = (*self.vertices.get(i)?, *self.vertices.get(j)?);
        let midpoint = (a + b) * 0.5;
        let along = b - a;
        let direction = along.normalize_or_zero();
        // In-plane perpendicular; for a counter-clockwise polygon this points out.
        let mut normal = direction.cross(DVec3::Z).normalize_or_zero();
        if normal.dot(midpoint) < 0.0 {
            normal = -normal;
        }
        Some(LocalEdge {
            midpoint,
            normal,
            direction,
            length: along.length(),
        })
    }

    /// Distance from the centroid to the farthest vertex.
    pub fn circumradius(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| v.length())
            .fold(0.0, f64::max)
    }

    /// Distance from the centroid to the nearest edge midpoint.
    pub fn apothem(&self) -> f64 {
        (0..self.edge_count())
            .filter_map(|k| self.local_edge(k))
            .map(|edge| edge.midpoint.length())
            .fold(f64::INFINITY, f64::min)
            .min(self.circumradius())
    }

    /// Interior angle of the regular polygon with this side count.
    pub fn interior_angle(&self) -> f64 {
        interior_angle(self.side_count)
    }
}

/// Interior angle of a regular `side_count`-gon in radians.
#[inline]
pub fn interior_angle(side_count: u8) -> f64 {
    PI * (side_count as f64 - 2.0) / side_count as f64
}

/// Supplies polygon templates by side count.
pub trait GeometryProvider: Send + Sync + fmt::Debug {
    /// Template for `side_count`, or `UnsupportedSideCount`.
    fn get_template(&self, side_count: u8) -> Result<PolygonTemplate, EngineError>;

    /// Side counts this provider can build.
    fn supported_side_counts(&self) -> RangeInclusive<u8> {
        MIN_SIDES..=MAX_SIDES
    }
}

/// Reference provider of regular polygons with 3–20 sides.
#[derive(Debug, Clone)]
pub struct RegularPolygons {
    edge_length: f64,
    overrides: FxHashMap<u8, f64>,
}

impl RegularPolygons {
    /// Every polygon gets unit edge length.
    pub fn new() -> Self {
        Self::with_edge_length(1.0)
    }

    pub fn with_edge_length(edge_length: f64) -> Self {
        Self {
            edge_length,
            overrides: FxHashMap::default(),
        }
    }

    /// Scales one polygon type independently of the others.
    pub fn with_side_edge_length(mut self, side_count: u8, edge_length: f64) -> Self {
        self.overrides.insert(side_count, edge_length);
        self
    }
}

impl Default for RegularPolygons {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryProvider for RegularPolygons {
    fn get_template(&self, side_count: u8) -> Result<PolygonTemplate, EngineError> {
        if !self.supported_side_counts().contains(&side_count) {
            return Err(EngineError::UnsupportedSideCount(side_count));
        }
        let length = self
            .overrides
            .get(&side_count)
            .copied()
            .unwrap_or(self.edge_length);
        Ok(PolygonTemplate::regular(side_count, length))
    }
}

/// Set of polygon types packed into a 256-bit mask, one bit per side count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeSet([u64; 4]);

impl TypeSet {
    pub const EMPTY: TypeSet = TypeSet([0; 4]);

    #[inline]
    fn slot(side_count: u8) -> (usize, u64) {
        (usize::from(side_count >> 6), 1 << (side_count & 63))
    }

    pub fn insert(&mut self, side_count: u8) {
        let (word, bit) = Self::slot(side_count);
        self.0[word] |= bit;
    }

    #[inline]
    pub fn contains(&self, side_count: u8) -> bool {
        let (word, bit) = Self::slot(side_count);
        self.0[word] & bit != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(move |&side| self.contains(side))
    }
}

impl FromIterator<u8> for TypeSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = TypeSet::EMPTY;
        for side in iter {
            set.insert(side);
        }
        set
    }
}

/// Bounding description of a placed or candidate unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitBounds {
    pub center: DVec3,
    pub normal: DVec3,
    pub circumradius: f64,
    pub inradius: f64,
}

/// Decides whether a candidate unit would intersect existing units.
///
/// Implementations must be pure; the engine may call them from any thread.
pub trait CollisionOracle: Send + Sync + fmt::Debug {
    fn would_overlap(&self, candidate: &UnitBounds, existing: &[UnitBounds]) -> bool;
}

/// Rejects candidates whose centroid sits within `clearance × min inradius`
/// of an existing centroid, i.e. a face stacked onto an occupied one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidClearance {
    pub clearance: f64,
}

impl CollisionOracle for CentroidClearance {
    fn would_overlap(&self, candidate: &UnitBounds, existing: &[UnitBounds]) -> bool {
        existing.iter().any(|other| {
            let limit = self.clearance * candidate.inradius.min(other.inradius);
            candidate.center.distance(other.center) < limit
        })
    }
}

/// Accepts every candidate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NoCollision;

impl CollisionOracle for NoCollision {
    fn would_overlap(&self, _candidate: &UnitBounds, _existing: &[UnitBounds]) -> bool {
        false
    }
}
