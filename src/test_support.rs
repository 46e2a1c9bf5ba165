//! Fixtures shared by unit tests.

use crate::arena::UnitId;
use crate::fold::{FoldCode, FoldCodeCache};
use crate::geometry::{GeometryProvider, RegularPolygons, TypeSet};
use crate::liaison::{AttachmentState, LiaisonGraph};
use glam::{DQuat, DVec3};
use std::sync::Arc;

pub fn graph() -> LiaisonGraph {
    LiaisonGraph::new(0.01, 1.0, 32)
}

pub fn square_compat() -> TypeSet {
    [4u8].into_iter().collect()
}

pub fn add_square(graph: &mut LiaisonGraph, position: DVec3) -> UnitId {
    let template = Arc::new(RegularPolygons::new().get_template(4).unwrap());
    graph.add_unit(template, position, DQuat::IDENTITY, square_compat())
}

pub fn planar_fold() -> Arc<FoldCode> {
    FoldCodeCache::new()
        .get_or_create(&RegularPolygons::new(), 4, 4, "planar")
        .unwrap()
}

/// `n` coplanar unit squares along `+X`, each edge 0 joined to the next
/// square's edge 2.
pub fn strip(graph: &mut LiaisonGraph, n: usize, origin: DVec3) -> Vec<UnitId> {
    let ids: Vec<UnitId> = (0..n)
        .map(|i| add_square(graph, origin + DVec3::X * i as f64))
        .collect();
    for pair in ids.windows(2) {
        graph
            .add_attachment(pair[0], 0, pair[1], 2, planar_fold(), AttachmentState::Permanent)
            .unwrap();
    }
    ids
}
