//! Constraint propagation: where could a new unit of a given type go?
//!
//! For every open edge that accepts the requested polygon type in the
//! requested context, at or above the stability threshold, the propagator
//! fetches the fold code, hinges the new unit's edge 0 onto the open edge at
//! the fold's dihedral, asks the collision oracle about the resulting pose,
//! and ranks the survivors.
//!
//! # Hinge convention
//! With `M` the open edge midpoint, `n` its outward in-plane normal and `z`
//! the host's face normal, a fold angle `φ = π − δ` swings the new unit
//! towards `z`: its centroid sits at `M + apothem · (cos φ · n + sin φ · z)`
//! and its face normal becomes `cos φ · z − sin φ · n`. A dihedral of `π`
//! therefore continues the host's plane.

use crate::arena::UnitId;
use crate::error::EngineError;
use crate::fold::{FoldCode, FoldCodeCache};
use crate::geometry::{CollisionOracle, GeometryProvider, PolygonTemplate, UnitBounds};
use crate::liaison::LiaisonGraph;
use crate::registry::OpenEdgeEntry;
use glam::{DMat3, DQuat, DVec3};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, trace};

/// A proposed pose for a new unit, hinged onto an existing open edge.
#[derive(Debug, Clone)]
pub struct CandidatePlacement {
    /// The open edge the new unit attaches to.
    pub target: OpenEdgeEntry,
    pub polygon_type: u8,
    /// Edge of the new unit that meets `target`.
    pub edge: usize,
    pub position: DVec3,
    pub orientation: DQuat,
    /// Dihedral the pose was solved for.
    pub dihedral: f64,
    pub fold: Arc<FoldCode>,
    /// Higher is better; currently the fold's stability score.
    pub feasibility: f64,
    /// Distance from `position` to the assembly centroid.
    pub centroid_distance: f64,
}

impl CandidatePlacement {
    pub fn target_unit(&self) -> UnitId {
        self.target.unit
    }
}

/// Read-only view used to generate placement candidates.
pub struct Propagator<'a> {
    pub graph: &'a LiaisonGraph,
    pub provider: &'a dyn GeometryProvider,
    pub folds: &'a FoldCodeCache,
    pub oracle: &'a dyn CollisionOracle,
    /// Joints scoring below this are never proposed.
    pub min_stability: f64,
}

impl<'a> Propagator<'a> {
    /// Ranked placements of a `polygon_type` unit in `context`.
    ///
    /// Fails only when the provider cannot build `polygon_type`. An empty
    /// vector means no open edge accepts it.
    pub fn propose(
        &self,
        polygon_type: u8,
        context: &str,
    ) -> Result<Vec<CandidatePlacement>, EngineError> {
        let template = self.provider.get_template(polygon_type)?;
        let centroid = self.graph.centroid();
        let existing: Vec<UnitBounds> = self.graph.units().map(|(_, u)| u.bounds()).collect();

        let mut candidates = Vec::new();
        for entry in self.graph.registry().iter() {
            if !entry.compatible.contains(polygon_type) {
                continue;
            }
            let accepted = self.folds.compatible_types(
                self.provider,
                entry.polygon_type,
                context,
                self.min_stability,
            );
            if !accepted.contains(polygon_type) {
                continue;
            }
            let Some(candidate) = self.candidate_for(entry, &template, context, centroid) else {
                continue;
            };
            let bounds = UnitBounds {
                center: candidate.position,
                normal: candidate.orientation * DVec3::Z,
                circumradius: template.circumradius(),
                inradius: template.apothem(),
            };
            if self.oracle.would_overlap(&bounds, &existing) {
                trace!(unit = %entry.unit, edge = entry.edge, "candidate overlaps");
                continue;
            }
            candidates.push(candidate);
        }

        candidates.sort_by(|a, b| {
            b.feasibility
                .total_cmp(&a.feasibility)
                .then_with(|| a.centroid_distance.total_cmp(&b.centroid_distance))
                .then_with(|| a.target.key().cmp(&b.target.key()))
        });
        debug!(polygon_type, context, count = candidates.len(), "placements proposed");
        Ok(candidates)
    }

    fn candidate_for(
        &self,
        entry: &OpenEdgeEntry,
        template: &PolygonTemplate,
        context: &str,
        centroid: DVec3,
    ) -> Option<CandidatePlacement> {
        let local = template.local_edge(0)?;
        let tolerance = self.graph.tolerance() * entry.length.max(local.length);
        if (entry.length - local.length).abs() > tolerance {
            return None;
        }
        let fold = match self
            .folds
            .get_or_create(self.provider, entry.polygon_type, template.side_count, context)
        {
            Ok(fold) => fold,
            Err(err) => {
                trace!(%err, unit = %entry.unit, edge = entry.edge, "no fold code");
                return None;
            }
        };

        let dihedral = match fold.sensitivity() {
            None => fold.dihedral(),
            Some(sensitivity) => match self.mean_attachment_distance(entry.unit) {
                Some(distance) => sensitivity.dihedral_for_distance(distance),
                None => sensitivity.rest_dihedral(),
            },
        };

        let (position, orientation) = hinge_pose(entry, local.midpoint.length(), dihedral)?;
        Some(CandidatePlacement {
            target: entry.clone(),
            polygon_type: template.side_count,
            edge: 0,
            position,
            orientation,
            dihedral,
            feasibility: fold.stability,
            centroid_distance: position.distance(centroid),
            fold,
        })
    }

    fn mean_attachment_distance(&self, unit: UnitId) -> Option<f64> {
        let ids = self.graph.attachments_of(unit).ok()?;
        if ids.is_empty() {
            return None;
        }
        let total: f64 = ids
            .iter()
            .filter_map(|id| self.graph.attachment(*id))
            .map(|edge| edge.displacement.length())
            .sum();
        Some(total / ids.len() as f64)
    }
}

/// Centroid and orientation of a unit whose edge 0 is hinged onto `entry` at
/// `dihedral`.
pub fn hinge_pose(entry: &OpenEdgeEntry, apothem: f64, dihedral: f64) -> Option<(DVec3, DQuat)> {
    let n = entry.normal.normalize_or_zero();
    let z = entry.face_normal.normalize_or_zero();
    let axis = n.cross(z);
    if axis.length_squared() < 1e-12 {
        return None;
    }
    let swing = DQuat::from_axis_angle(axis.normalize(), PI - dihedral);
    let outward = swing * n;
    let face = swing * z;

    // Edge 0 of a template has local outward normal +X and face normal +Z.
    let inward = -outward;
    let basis = DMat3::from_cols(inward, face.cross(inward), face);
    let orientation = DQuat::from_mat3(&basis).normalize();
    Some((entry.midpoint + outward * apothem, orientation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fold::DEFAULT_CONTEXT;
    use crate::geometry::{CentroidClearance, NoCollision, RegularPolygons};
    use crate::liaison::Unit;
    use crate::test_support::{add_square, graph, strip};
    use std::f64::consts::FRAC_PI_2;

    const EPS: f64 = 1e-9;

    fn propose(g: &LiaisonGraph, polygon_type: u8, context: &str) -> Vec<CandidatePlacement> {
        let provider = RegularPolygons::new();
        let folds = FoldCodeCache::new();
        Propagator {
            graph: g,
            provider: &provider,
            folds: &folds,
            oracle: &CentroidClearance { clearance: 0.5 },
            min_stability: 0.0,
        }
        .propose(polygon_type, context)
        .unwrap()
    }

    fn shares_edge(unit: &Unit, edge: usize, candidate: &CandidatePlacement) -> bool {
        let host = unit.world_edge(edge).unwrap();
        let template = RegularPolygons::new().get_template(candidate.polygon_type).unwrap();
        let local = template.local_edge(candidate.edge).unwrap();
        let placed = candidate.position + candidate.orientation * local.midpoint;
        (placed - host.midpoint).length() < 1e-9
    }

    #[test]
    fn lone_square_offers_every_edge() {
        let mut g = graph();
        let id = add_square(&mut g, DVec3::ZERO);
        let candidates = propose(&g, 4, DEFAULT_CONTEXT);
        assert_eq!(candidates.len(), 4);
        let unit = g.unit(id).unwrap();
        for c in &candidates {
            assert!(c.feasibility > 0.0);
            assert_eq!(c.target_unit(), id);
            assert!((c.dihedral - FRAC_PI_2).abs() < EPS);
            assert!(shares_edge(unit, c.target.edge, c));
        }
        let mut edges: Vec<usize> = candidates.iter().map(|c| c.target.edge).collect();
        edges.sort_unstable();
        assert_eq!(edges, vec![0, 1, 2, 3]);
    }

    #[test]
    fn cube_fold_stands_the_new_face_upright() {
        let mut g = graph();
        add_square(&mut g, DVec3::ZERO);
        let candidates = propose(&g, 4, DEFAULT_CONTEXT);
        let east = candidates.iter().find(|c| c.target.edge == 0).unwrap();
        assert!((east.position - DVec3::new(0.5, 0.0, 0.5)).length() < EPS);
        assert!((east.orientation * DVec3::Z - DVec3::NEG_X).length() < EPS);
        assert!((east.orientation * DVec3::X - DVec3::NEG_Z).length() < EPS);
    }

    #[test]
    fn planar_context_continues_the_plane() {
        let mut g = graph();
        add_square(&mut g, DVec3::ZERO);
        let candidates = propose(&g, 4, "planar");
        let east = candidates.iter().find(|c| c.target.edge == 0).unwrap();
        assert!((east.position - DVec3::X).length() < EPS);
        assert!((east.orientation * DVec3::Z - DVec3::Z).length() < EPS);
    }

    #[test]
    fn threshold_applies_to_the_requested_context() {
        let mut g = graph();
        add_square(&mut g, DVec3::ZERO);
        let provider = RegularPolygons::new();
        let folds = FoldCodeCache::new();
        let strict = |context: &str| {
            Propagator {
                graph: &g,
                provider: &provider,
                folds: &folds,
                oracle: &NoCollision,
                min_stability: 0.5,
            }
            .propose(4, context)
            .unwrap()
        };
        // Coplanar joints score at the floor; right angles score high.
        assert!(strict("planar").is_empty());
        let upright = strict(DEFAULT_CONTEXT);
        assert_eq!(upright.len(), 4);
        assert!(upright.iter().all(|c| c.feasibility >= 0.5));
    }

    #[test]
    fn incompatible_types_yield_nothing() {
        let mut g = graph();
        add_square(&mut g, DVec3::ZERO);
        // Squares in the fixture only accept squares.
        assert!(propose(&g, 3, DEFAULT_CONTEXT).is_empty());
        assert!(propose(&graph(), 4, DEFAULT_CONTEXT).is_empty());
    }

    #[test]
    fn overlapping_poses_are_rejected() {
        // Two loose squares side by side: each one's planar neighbour slot
        // is already occupied by the other.
        let mut g = graph();
        add_square(&mut g, DVec3::ZERO);
        add_square(&mut g, DVec3::X);
        let provider = RegularPolygons::new();
        let folds = FoldCodeCache::new();
        let strict = Propagator {
            graph: &g,
            provider: &provider,
            folds: &folds,
            oracle: &CentroidClearance { clearance: 0.5 },
            min_stability: 0.0,
        }
        .propose(4, "planar")
        .unwrap();
        let lax = Propagator {
            graph: &g,
            provider: &provider,
            folds: &folds,
            oracle: &NoCollision,
            min_stability: 0.0,
        }
        .propose(4, "planar")
        .unwrap();
        assert_eq!(lax.len(), 8);
        assert_eq!(strict.len(), 6);
        let ids = g.unit_ids();
        assert!(!strict
            .iter()
            .any(|c| (c.target.unit, c.target.edge) == (ids[0], 0)
                || (c.target.unit, c.target.edge) == (ids[1], 2)));
    }

    #[test]
    fn flexible_joint_tracks_host_spacing() {
        let mut g = graph();
        strip(&mut g, 2, DVec3::ZERO);
        let candidates = propose(&g, 4, "flex");
        assert!(!candidates.is_empty());
        // Coplanar neighbours sit one apart, beyond the flex range, so the
        // dihedral clamps to its upper end.
        for c in &candidates {
            assert!((c.dihedral - 2.0 * PI / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn unsupported_type_is_an_input_error() {
        let g = graph();
        let provider = RegularPolygons::new();
        let folds = FoldCodeCache::new();
        let err = Propagator {
            graph: &g,
            provider: &provider,
            folds: &folds,
            oracle: &NoCollision,
            min_stability: 0.0,
        }
        .propose(2, DEFAULT_CONTEXT)
        .unwrap_err();
        assert_eq!(err, EngineError::UnsupportedSideCount(2));
    }
}
