//! Engine configuration.
//!
//! All lengths are in the same units as the geometry provider's templates.
//! `from_env` overlays `POLYFORM_*` environment variables on the defaults.

use crate::error::EngineError;
use crate::fold::DEFAULT_CONTEXT;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Tunables shared by every component of an assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Relative tolerance for edge-length compatibility (0.01 = 1%).
    pub edge_length_tolerance: f64,
    /// The ε in `contacts / (contacts + open + ε)`.
    pub stability_epsilon: f64,
    /// Search radius for re-attachment when building the stability matrix.
    pub reattach_radius: f64,
    /// Cell size of the open-edge spatial hash.
    pub registry_cell_size: f64,
    /// Below this many open edges the registry scans linearly.
    pub naive_scan_threshold: usize,
    /// Attachment context used when callers do not name one.
    pub default_context: String,
    /// Fold codes below this stability do not count as compatible.
    pub min_fold_stability: f64,
    /// Weisfeiler–Lehman rounds used for topology hashing.
    pub wl_rounds: usize,
    /// Clearance factor of the default collision oracle.
    pub collision_clearance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            edge_length_tolerance: 0.01,
            stability_epsilon: 1e-6,
            reattach_radius: 1.5,
            registry_cell_size: 1.0,
            naive_scan_threshold: 32,
            default_context: DEFAULT_CONTEXT.to_string(),
            min_fold_stability: 0.0,
            wl_rounds: 4,
            collision_clearance: 0.5,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `POLYFORM_*` environment variables.
    ///
    /// Recognised keys: `POLYFORM_EDGE_TOLERANCE`, `POLYFORM_STABILITY_EPSILON`,
    /// `POLYFORM_REATTACH_RADIUS`, `POLYFORM_REGISTRY_CELL_SIZE`,
    /// `POLYFORM_NAIVE_SCAN_THRESHOLD`, `POLYFORM_DEFAULT_CONTEXT`,
    /// `POLYFORM_MIN_FOLD_STABILITY`, `POLYFORM_WL_ROUNDS`,
    /// `POLYFORM_COLLISION_CLEARANCE`.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values produced by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        overlay(&lookup, "POLYFORM_EDGE_TOLERANCE", &mut config.edge_length_tolerance)?;
        overlay(&lookup, "POLYFORM_STABILITY_EPSILON", &mut config.stability_epsilon)?;
        overlay(&lookup, "POLYFORM_REATTACH_RADIUS", &mut config.reattach_radius)?;
        overlay(&lookup, "POLYFORM_REGISTRY_CELL_SIZE", &mut config.registry_cell_size)?;
        overlay(&lookup, "POLYFORM_NAIVE_SCAN_THRESHOLD", &mut config.naive_scan_threshold)?;
        overlay(&lookup, "POLYFORM_DEFAULT_CONTEXT", &mut config.default_context)?;
        overlay(&lookup, "POLYFORM_MIN_FOLD_STABILITY", &mut config.min_fold_stability)?;
        overlay(&lookup, "POLYFORM_WL_ROUNDS", &mut config.wl_rounds)?;
        overlay(&lookup, "POLYFORM_COLLISION_CLEARANCE", &mut config.collision_clearance)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |key: &str, value: String| EngineError::InvalidConfig {
            key: key.to_string(),
            value,
        };
        if !(0.0..1.0).contains(&self.edge_length_tolerance) {
            return Err(invalid("edge_length_tolerance", self.edge_length_tolerance.to_string()));
        }
        if !(self.stability_epsilon > 0.0 && self.stability_epsilon.is_finite()) {
            return Err(invalid("stability_epsilon", self.stability_epsilon.to_string()));
        }
        if !(self.reattach_radius >= 0.0) {
            return Err(invalid("reattach_radius", self.reattach_radius.to_string()));
        }
        if !(self.registry_cell_size > 0.0 && self.registry_cell_size.is_finite()) {
            return Err(invalid("registry_cell_size", self.registry_cell_size.to_string()));
        }
        if self.default_context.trim().is_empty() {
            return Err(invalid("default_context", format!("{:?}", self.default_context)));
        }
        if !(0.0..=1.0).contains(&self.min_fold_stability) {
            return Err(invalid("min_fold_stability", self.min_fold_stability.to_string()));
        }
        if !(self.collision_clearance >= 0.0) {
            return Err(invalid("collision_clearance", self.collision_clearance.to_string()));
        }
        Ok(())
    }
}

fn overlay<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), EngineError> {
    if let Some(raw) = lookup(key) {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        *slot = raw.parse().map_err(|_| EngineError::InvalidConfig {
            key: key.to_string(),
            value: raw.to_string(),
        })?;
    }
    Ok(())
}
