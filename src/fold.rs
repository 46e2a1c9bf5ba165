//! Fold codes and the shared fold-code cache.
//!
//! A fold code is the reusable geometric transform for hinging two polygon
//! types together in a given attachment context: the dihedral angle (or a
//! bounded range plus a sensitivity function for flexible joints), the hinge
//! axis, the centroid displacement, a stability score and the joint's
//! symmetry order.
//!
//! # Contexts
//! The context identifier selects the dihedral solve:
//! - `planar`: coplanar tiling, δ = π.
//! - `vertex:N`: trihedral closure with an N-gon completing each hinge end,
//!   `cos δ = (cos γ − cos α cos β) / (sin α sin β)`.
//! - `flex` / `flex:N`: variable joint spanning ±30° around the base angle.
//! - anything else: fallback `δ = π − (α + β) / 2`.
//!
//! # Sharing
//! Codes are immutable and handed out as `Arc<FoldCode>`. Concurrent misses on
//! the same key may both solve, but only the first insert is kept and every
//! caller receives that handle.

use crate::error::EngineError;
use crate::geometry::{interior_angle, GeometryProvider, PolygonTemplate, TypeSet};
use glam::DVec3;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::debug;

/// Context used when callers do not name one.
pub const DEFAULT_CONTEXT: &str = "default";

/// Half-width of a flexible joint's dihedral range.
const FLEX_HALF_RANGE: f64 = PI / 6.0;

/// Smallest dihedral a flexible joint may reach.
const MIN_DIHEDRAL: f64 = 1e-3;

/// Feasible joints never score below this.
const STABILITY_FLOOR: f64 = 0.01;

static GLOBAL_CACHE: OnceLock<Arc<FoldCodeCache>> = OnceLock::new();

/// Cache key: unordered polygon pair plus attachment context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FoldKey {
    pub lo: u8,
    pub hi: u8,
    pub context: String,
}

impl FoldKey {
    /// Normalises the pair order so `(a, b)` and `(b, a)` share a key.
    pub fn new(a: u8, b: u8, context: &str) -> Self {
        Self {
            lo: a.min(b),
            hi: a.max(b),
            context: context.to_string(),
        }
    }

    /// Returns `true` if this key joins types `a` and `b` in either order.
    pub fn joins(&self, a: u8, b: u8) -> bool {
        self.lo == a.min(b) && self.hi == a.max(b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum JointContext {
    Fallback,
    Planar,
    Trihedral(u8),
    Flexible(Option<u8>),
}

impl JointContext {
    fn parse(context: &str) -> Self {
        let context = context.trim();
        if context == "planar" {
            return JointContext::Planar;
        }
        if context == "flex" {
            return JointContext::Flexible(None);
        }
        if let Some(rest) = context.strip_prefix("flex:") {
            return JointContext::Flexible(rest.parse().ok());
        }
        if let Some(rest) = context.strip_prefix("vertex:") {
            if let Ok(third) = rest.parse() {
                return JointContext::Trihedral(third);
            }
        }
        JointContext::Fallback
    }
}

/// Maps a target centroid distance onto a feasible dihedral.
///
/// With apothems `a`, `b` meeting at the hinge midpoint the centroid distance
/// obeys `D² = a² + b² − 2ab·cos δ`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sensitivity {
    pub apothem_lo: f64,
    pub apothem_hi: f64,
    pub min_dihedral: f64,
    pub max_dihedral: f64,
}

impl Sensitivity {
    /// Centroid distance produced by `dihedral`.
    pub fn distance_at(&self, dihedral: f64) -> f64 {
        centroid_distance(self.apothem_lo, self.apothem_hi, dihedral)
    }

    /// Dihedral whose centroid distance is closest to `distance`, clamped to
    /// the joint's range.
    pub fn dihedral_for_distance(&self, distance: f64) -> f64 {
        let (a, b) = (self.apothem_lo, self.apothem_hi);
        let cos = ((a * a + b * b - distance * distance) / (2.0 * a * b)).clamp(-1.0, 1.0);
        cos.acos().clamp(self.min_dihedral, self.max_dihedral)
    }

    /// Midpoint of the dihedral range.
    pub fn rest_dihedral(&self) -> f64 {
        0.5 * (self.min_dihedral + self.max_dihedral)
    }
}

/// Rigid or flexible hinge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Joint {
    Rigid { dihedral: f64 },
    Variable(Sensitivity),
}

/// Immutable, shareable geometric transform for one polygon pair + context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldCode {
    pub key: FoldKey,
    pub joint: Joint,
    /// Hinge axis in the canonical hinge frame (edge along `+X`).
    pub axis: DVec3,
    /// Centroid displacement magnitude at the rest dihedral.
    pub displacement: f64,
    /// Score in `(0, 1]`; higher joints are preferred.
    pub stability: f64,
    /// Order of the joint's symmetry group (2 when both sides match).
    pub symmetry_order: u32,
}

impl FoldCode {
    /// Solves the fold code for `key` from the provider's templates.
    pub fn solve(provider: &dyn GeometryProvider, key: &FoldKey) -> Result<Self, EngineError> {
        let unknown = || EngineError::UnknownTypePair {
            a: key.lo,
            b: key.hi,
            context: key.context.clone(),
        };
        let lo = provider.get_template(key.lo).map_err(|_| unknown())?;
        let hi = provider.get_template(key.hi).map_err(|_| unknown())?;
        let infeasible = || EngineError::InfeasibleJoint {
            a: key.lo,
            b: key.hi,
            context: key.context.clone(),
        };

        let (alpha, beta) = (lo.interior_angle(), hi.interior_angle());
        let trihedral = |third: u8| -> Result<f64, EngineError> {
            provider.get_template(third).map_err(|_| unknown())?;
            trihedral_dihedral(alpha, beta, interior_angle(third)).ok_or_else(infeasible)
        };

        let joint = match JointContext::parse(&key.context) {
            JointContext::Planar => Joint::Rigid { dihedral: PI },
            JointContext::Fallback => Joint::Rigid {
                dihedral: fallback_dihedral(alpha, beta),
            },
            JointContext::Trihedral(third) => Joint::Rigid {
                dihedral: trihedral(third)?,
            },
            JointContext::Flexible(third) => {
                let base = match third {
                    Some(third) => trihedral(third)?,
                    None => fallback_dihedral(alpha, beta),
                };
                Joint::Variable(Sensitivity {
                    apothem_lo: lo.apothem(),
                    apothem_hi: hi.apothem(),
                    min_dihedral: (base - FLEX_HALF_RANGE).max(MIN_DIHEDRAL),
                    max_dihedral: (base + FLEX_HALF_RANGE).min(PI),
                })
            }
        };

        Ok(Self::from_joint(key.clone(), joint, &lo, &hi))
    }

    fn from_joint(key: FoldKey, joint: Joint, lo: &PolygonTemplate, hi: &PolygonTemplate) -> Self {
        let rest = match joint {
            Joint::Rigid { dihedral } => dihedral,
            Joint::Variable(sensitivity) => sensitivity.rest_dihedral(),
        };
        let symmetry_order = if key.lo == key.hi { 2 } else { 1 };
        Self {
            displacement: centroid_distance(lo.apothem(), hi.apothem(), rest),
            stability: stability_score(rest, key.lo, key.hi),
            axis: DVec3::X,
            symmetry_order,
            joint,
            key,
        }
    }

    /// Rigid dihedral, or the midpoint of a flexible joint's range.
    pub fn dihedral(&self) -> f64 {
        match self.joint {
            Joint::Rigid { dihedral } => dihedral,
            Joint::Variable(sensitivity) => sensitivity.rest_dihedral(),
        }
    }

    /// Bend away from coplanar, `π − dihedral`.
    pub fn fold_angle(&self) -> f64 {
        PI - self.dihedral()
    }

    pub fn is_rigid(&self) -> bool {
        matches!(self.joint, Joint::Rigid { .. })
    }

    /// Sensitivity function of a flexible joint.
    pub fn sensitivity(&self) -> Option<&Sensitivity> {
        match &self.joint {
            Joint::Rigid { .. } => None,
            Joint::Variable(sensitivity) => Some(sensitivity),
        }
    }

    /// Dihedral to use for a target centroid distance. Rigid joints ignore it.
    pub fn dihedral_for_distance(&self, distance: f64) -> f64 {
        match self.joint {
            Joint::Rigid { dihedral } => dihedral,
            Joint::Variable(sensitivity) => sensitivity.dihedral_for_distance(distance),
        }
    }
}

/// `π − (α + β) / 2` for interior angles `α`, `β`.
pub fn fallback_dihedral(alpha: f64, beta: f64) -> f64 {
    PI - 0.5 * (alpha + beta)
}

/// Dihedral along the edge between faces with interior angles `alpha` and
/// `beta` when a face with angle `gamma` closes the vertex. `None` when the
/// three angles cannot meet at a convex vertex.
pub fn trihedral_dihedral(alpha: f64, beta: f64, gamma: f64) -> Option<f64> {
    let denom = alpha.sin() * beta.sin();
    if denom.abs() < 1e-12 {
        return None;
    }
    let cos = (gamma.cos() - alpha.cos() * beta.cos()) / denom;
    if !(-1.0 - 1e-9..=1.0 + 1e-9).contains(&cos) {
        return None;
    }
    Some(cos.clamp(-1.0, 1.0).acos())
}

fn centroid_distance(a: f64, b: f64, dihedral: f64) -> f64 {
    (a * a + b * b - 2.0 * a * b * dihedral.cos()).max(0.0).sqrt()
}

/// Joints near 90° score highest; larger polygons lose a little.
fn stability_score(dihedral: f64, lo: u8, hi: u8) -> f64 {
    let degrees = dihedral.to_degrees();
    let base = (1.0 - (degrees - 90.0).abs() / 90.0).max(0.0);
    let complexity = (1.0 - (lo as f64 + hi as f64 - 6.0) * 0.02).max(0.5);
    (base * complexity).clamp(STABILITY_FLOOR, 1.0)
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    codes: Vec<FoldCode>,
}

/// Process-wide, read-mostly store of fold codes.
#[derive(Debug, Default)]
pub struct FoldCodeCache {
    codes: RwLock<FxHashMap<FoldKey, Arc<FoldCode>>>,
    compatible: RwLock<FxHashMap<(u8, String, u64), TypeSet>>,
    solves: AtomicUsize,
}

impl FoldCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    ///
    /// Entries are keyed by polygon types only, so every assembly sharing it
    /// must use geometry providers that agree on those types.
    pub fn global() -> Arc<FoldCodeCache> {
        GLOBAL_CACHE
            .get_or_init(|| Arc::new(FoldCodeCache::new()))
            .clone()
    }

    /// Returns the cached fold code for `(a, b, context)`, solving and
    /// inserting it on a miss.
    pub fn get_or_create(
        &self,
        provider: &dyn GeometryProvider,
        a: u8,
        b: u8,
        context: &str,
    ) -> Result<Arc<FoldCode>, EngineError> {
        let key = FoldKey::new(a, b, context);
        if let Some(code) = self.read_codes().get(&key) {
            return Ok(code.clone());
        }

        let solved = FoldCode::solve(provider, &key)?;
        self.solves.fetch_add(1, Ordering::Relaxed);
        debug!(
            lo = key.lo,
            hi = key.hi,
            context = %key.context,
            dihedral = solved.dihedral(),
            stability = solved.stability,
            "solved fold code"
        );

        let mut codes = self.codes.write().unwrap_or_else(PoisonError::into_inner);
        Ok(codes.entry(key).or_insert_with(|| Arc::new(solved)).clone())
    }

    /// Cached fold code, without solving.
    pub fn get(&self, a: u8, b: u8, context: &str) -> Option<Arc<FoldCode>> {
        self.read_codes().get(&FoldKey::new(a, b, context)).cloned()
    }

    /// Supersedes the entry for `code.key`. Handles already given out keep
    /// pointing at the previous variant.
    pub fn insert_variant(&self, code: FoldCode) -> Arc<FoldCode> {
        let code = Arc::new(code);
        self.codes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.key.clone(), code.clone());
        self.compatible
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        code
    }

    /// Polygon types that `side_count` can hinge to in `context` with at
    /// least `min_stability`.
    pub fn compatible_types(
        &self,
        provider: &dyn GeometryProvider,
        side_count: u8,
        context: &str,
        min_stability: f64,
    ) -> TypeSet {
        let memo_key = (side_count, context.to_string(), min_stability.to_bits());
        if let Some(set) = self
            .compatible
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&memo_key)
        {
            return *set;
        }
        let set: TypeSet = provider
            .supported_side_counts()
            .filter(|&other| {
                self.get_or_create(provider, side_count, other, context)
                    .map(|code| code.stability >= min_stability)
                    .unwrap_or(false)
            })
            .collect();
        self.compatible
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(memo_key, set);
        set
    }

    pub fn len(&self) -> usize {
        self.read_codes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dihedral solves performed, including discarded races.
    pub fn solve_count(&self) -> usize {
        self.solves.load(Ordering::Relaxed)
    }

    /// Serialises all cached codes to CBOR, ordered by key.
    pub fn to_cbor(&self) -> Result<Vec<u8>, EngineError> {
        let mut codes: Vec<FoldCode> = self
            .read_codes()
            .values()
            .map(|code| (**code).clone())
            .collect();
        codes.sort_by(|a, b| a.key.cmp(&b.key));
        serde_cbor::to_vec(&Snapshot { codes }).map_err(|e| EngineError::Snapshot(e.to_string()))
    }

    /// Rebuilds a cache from a CBOR snapshot.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, EngineError> {
        let snapshot: Snapshot =
            serde_cbor::from_slice(bytes).map_err(|e| EngineError::Snapshot(e.to_string()))?;
        let codes = snapshot
            .codes
            .into_iter()
            .map(|code| (code.key.clone(), Arc::new(code)))
            .collect();
        Ok(Self {
            codes: RwLock::new(codes),
            ..Self::default()
        })
    }

    fn read_codes(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<FoldKey, Arc<FoldCode>>> {
        // Entries are immutable Arcs, so a panicked writer cannot leave the map
        // half-updated.
        self.codes.read().unwrap_or_else(PoisonError::into_inner)
    }
}
