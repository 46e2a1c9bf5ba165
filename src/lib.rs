//! Polyform assembly: a constraint engine for 3D assemblies of regular polygons.
//!
//! The engine tracks how polygonal units are hinged together edge to edge,
//! caches the fold transforms needed to realise each kind of hinge, proposes
//! where the next unit could go, and reduces an unstable assembly to its best
//! connected sub-assembly.
//!
//! - [`liaison`]: units, attachments and the invariant that every edge slot is
//!   either open (and indexed in the [`registry`]) or attached, never both.
//! - [`fold`]: shared, immutable fold codes (dihedral, hinge axis, stability)
//!   keyed by polygon pair and attachment context.
//! - [`propagate`]: ranked placement candidates for a new unit.
//! - [`stability`] and [`decomposition`]: derived views used to decide what
//!   to keep when an assembly decays.
//! - [`estimate`]: the combinatorial estimate `I = O · s_total · Ac · C_sym`,
//!   maintained incrementally.
//! - [`assembly`]: the facade tying these together, plus a lock-wrapped
//!   handle for concurrent readers.
//!
//! Unit geometry comes from a [`geometry::GeometryProvider`] and overlap
//! checks from a [`geometry::CollisionOracle`]; reference implementations of
//! both are included.
//!
//! # Example
//!
//! ```
//! use polyform_assembly::prelude::*;
//! use std::sync::Arc;
//!
//! let mut assembly = Assembly::new(Arc::new(RegularPolygons::new()));
//! let base = assembly.add_unit(4, DVec3::ZERO, DQuat::IDENTITY)?;
//! let candidates = assembly.propose_placements(4)?;
//! let (wall, _) = assembly.place(&candidates[0])?;
//! assert!(assembly.neighbors(base)?.contains(&wall));
//! assert!(assembly.estimate().i > 0.0);
//! # Ok::<(), EngineError>(())
//! ```

pub mod arena;
pub mod assembly;
pub mod config;
pub mod decomposition;
pub mod error;
pub mod estimate;
pub mod fingerprint;
pub mod fold;
pub mod geometry;
pub mod liaison;
pub mod propagate;
pub mod registry;
pub mod stability;

#[cfg(test)]
mod test_support;

pub use arena::{AttachmentId, UnitId};
pub use assembly::{Assembly, SharedAssembly};
pub use config::EngineConfig;
pub use error::EngineError;
pub use estimate::Estimate;
pub use fold::{FoldCode, FoldCodeCache};

/// Prelude for convenient usage.
pub mod prelude {
    pub use crate::arena::{AttachmentId, UnitId};
    pub use crate::assembly::{Assembly, SharedAssembly};
    pub use crate::config::EngineConfig;
    pub use crate::decomposition::{DecayOutcome, DecompositionTree, NodeKind};
    pub use crate::error::EngineError;
    pub use crate::estimate::{Estimate, TopologyCache};
    pub use crate::fingerprint::HashValue;
    pub use crate::fold::{FoldCode, FoldCodeCache, FoldKey, Joint, Sensitivity, DEFAULT_CONTEXT};
    pub use crate::geometry::{
        CentroidClearance, CollisionOracle, GeometryProvider, NoCollision, PolygonTemplate,
        RegularPolygons, TypeSet, UnitBounds,
    };
    pub use crate::liaison::{AttachmentEdge, AttachmentState, EdgeSlot, RemovedUnit, Unit};
    pub use crate::propagate::CandidatePlacement;
    pub use crate::registry::{OpenEdgeEntry, SlotKey};
    pub use crate::stability::StabilityMatrix;
    pub use glam::{DQuat, DVec3};
}
