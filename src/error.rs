//! Error taxonomy for the assembly engine.
//!
//! Input errors are recoverable: the operation that returns one leaves the
//! assembly exactly as it was. `InvariantViolation` means the engine's own
//! bookkeeping is inconsistent; the assembly that produced it is poisoned and
//! refuses further mutations with `Poisoned`.

use crate::arena::{AttachmentId, UnitId};
use thiserror::Error;

/// Error returned by engine operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The geometry provider has no template for this side count.
    #[error("unsupported side count {0}")]
    UnsupportedSideCount(u8),

    /// No fold code can be built for the polygon pair in this context.
    #[error("no fold code for polygon pair ({a}, {b}) in context `{context}`")]
    UnknownTypePair { a: u8, b: u8, context: String },

    /// The joint geometry has no real dihedral (e.g. a vertex whose face
    /// angles exceed a full turn).
    #[error("joint ({a}, {b}) in context `{context}` has no feasible dihedral")]
    InfeasibleJoint { a: u8, b: u8, context: String },

    /// The edge slot is already referenced by an attachment.
    #[error("edge {edge} of {unit} is already attached")]
    EdgeAlreadyAttached { unit: UnitId, edge: usize },

    /// The two edges differ in length by more than the configured tolerance.
    #[error("edge lengths {a} and {b} differ by more than {tolerance} (relative)")]
    IncompatibleEdgeLength { a: f64, b: f64, tolerance: f64 },

    /// The unit id is stale or was never issued.
    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),

    /// The attachment id is stale or was never issued.
    #[error("unknown attachment {0}")]
    UnknownAttachment(AttachmentId),

    /// The unit has fewer edges than the requested index.
    #[error("{unit} has no edge {edge}")]
    EdgeOutOfRange { unit: UnitId, edge: usize },

    /// Both ends of a requested attachment are the same unit.
    #[error("cannot attach {0} to itself")]
    SelfAttachment(UnitId),

    /// The supplied fold code was built for a different polygon pair.
    #[error("fold code for ({found_a}, {found_b}) cannot join types {a} and {b}")]
    FoldCodeMismatch { a: u8, b: u8, found_a: u8, found_b: u8 },

    /// The unit cannot move while attachments pin it in place.
    #[error("{0} is pinned by attachments")]
    UnitPinned(UnitId),

    /// A configuration value is out of range or unparsable.
    #[error("invalid configuration value for `{key}`: {value}")]
    InvalidConfig { key: String, value: String },

    /// A fold cache snapshot could not be encoded or decoded.
    #[error("fold cache snapshot failed: {0}")]
    Snapshot(String),

    /// Internal bookkeeping is inconsistent.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The assembly previously hit an invariant violation.
    #[error("assembly is poisoned: {0}")]
    Poisoned(String),
}

impl EngineError {
    /// Returns `true` for errors that leave the assembly usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::InvariantViolation(_) | EngineError::Poisoned(_)
        )
    }
}
