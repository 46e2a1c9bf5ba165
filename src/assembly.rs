//! The assembly facade.
//!
//! [`Assembly`] owns one liaison graph and wires it to the fold-code cache,
//! the geometry provider, the collision oracle and the estimator. All
//! mutations go through `&mut self`; [`SharedAssembly`] adds a reader-writer
//! lock for callers that share an assembly between threads.
//!
//! Input errors leave the assembly untouched. An invariant violation poisons
//! it: the error is logged, returned once, and every later mutation fails
//! with [`EngineError::Poisoned`].

use crate::arena::{AttachmentId, UnitId};
use crate::config::EngineConfig;
use crate::decomposition::{decay, DecayOutcome, DecompositionTree};
use crate::error::EngineError;
use crate::estimate::{Estimate, Estimator, TopologyCache};
use crate::fingerprint::{topology_hash, HashValue};
use crate::fold::{FoldCode, FoldCodeCache};
use crate::geometry::{CentroidClearance, CollisionOracle, GeometryProvider, PolygonTemplate};
use crate::liaison::{AttachmentEdge, AttachmentState, LiaisonGraph, RemovedUnit, Unit};
use crate::propagate::{CandidatePlacement, Propagator};
use crate::registry::{OpenEdgeEntry, SlotKey};
use crate::stability::{compute_stability_matrix, StabilityMatrix};
use glam::{DQuat, DVec3};
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

#[derive(Debug)]
pub struct Assembly {
    config: EngineConfig,
    provider: Arc<dyn GeometryProvider>,
    oracle: Arc<dyn CollisionOracle>,
    folds: Arc<FoldCodeCache>,
    topology: Arc<TopologyCache>,
    templates: FxHashMap<u8, Arc<PolygonTemplate>>,
    graph: LiaisonGraph,
    estimator: Mutex<Estimator>,
    poisoned: Option<String>,
}

impl Assembly {
    /// Empty assembly with the default configuration.
    pub fn new(provider: Arc<dyn GeometryProvider>) -> Self {
        let config = EngineConfig::default();
        Self::build(provider, config)
    }

    /// Empty assembly after validating `config`.
    pub fn with_config(
        provider: Arc<dyn GeometryProvider>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self::build(provider, config))
    }

    fn build(provider: Arc<dyn GeometryProvider>, config: EngineConfig) -> Self {
        let graph = LiaisonGraph::new(
            config.edge_length_tolerance,
            config.registry_cell_size,
            config.naive_scan_threshold,
        );
        Self {
            oracle: Arc::new(CentroidClearance {
                clearance: config.collision_clearance,
            }),
            folds: Arc::new(FoldCodeCache::new()),
            topology: Arc::new(TopologyCache::new()),
            templates: FxHashMap::default(),
            estimator: Mutex::new(Estimator::new(config.wl_rounds, config.stability_epsilon)),
            poisoned: None,
            provider,
            config,
            graph,
        }
    }

    /// Replaces the collision oracle.
    pub fn with_oracle(mut self, oracle: Arc<dyn CollisionOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Shares a fold-code cache (e.g. [`FoldCodeCache::global`]) with other
    /// assemblies.
    pub fn with_fold_cache(mut self, folds: Arc<FoldCodeCache>) -> Self {
        self.folds = folds;
        self
    }

    /// Shares a topology cache with other assemblies.
    pub fn with_topology_cache(mut self, topology: Arc<TopologyCache>) -> Self {
        self.topology = topology;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &LiaisonGraph {
        &self.graph
    }

    pub fn fold_cache(&self) -> &Arc<FoldCodeCache> {
        &self.folds
    }

    pub fn topology_cache(&self) -> &Arc<TopologyCache> {
        &self.topology
    }

    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.graph.unit(id)
    }

    pub fn attachment(&self, id: AttachmentId) -> Option<&AttachmentEdge> {
        self.graph.attachment(id)
    }

    pub fn unit_count(&self) -> usize {
        self.graph.unit_count()
    }

    pub fn attachment_count(&self) -> usize {
        self.graph.attachment_count()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    // ---- mutations -------------------------------------------------------

    /// Places a unit of `polygon_type` with every edge open.
    pub fn add_unit(
        &mut self,
        polygon_type: u8,
        position: DVec3,
        orientation: DQuat,
    ) -> Result<UnitId, EngineError> {
        self.ensure_writable()?;
        let template = self.template(polygon_type)?;
        let compatible = self.folds.compatible_types(
            self.provider.as_ref(),
            polygon_type,
            &self.config.default_context,
            self.config.min_fold_stability,
        );
        let id = self.graph.add_unit(template, position, orientation, compatible);
        unlocked(&mut self.estimator).on_unit_added(&self.graph, id);
        debug!(%id, polygon_type, "unit placed");
        Ok(id)
    }

    /// Joins two open edges permanently with `fold`.
    pub fn add_attachment(
        &mut self,
        a: UnitId,
        edge_a: usize,
        b: UnitId,
        edge_b: usize,
        fold: Arc<FoldCode>,
    ) -> Result<AttachmentId, EngineError> {
        self.attach_with(a, edge_a, b, edge_b, fold, AttachmentState::Permanent)
    }

    /// Joins two open edges pending confirmation.
    pub fn add_temporary_attachment(
        &mut self,
        a: UnitId,
        edge_a: usize,
        b: UnitId,
        edge_b: usize,
        fold: Arc<FoldCode>,
    ) -> Result<AttachmentId, EngineError> {
        self.attach_with(a, edge_a, b, edge_b, fold, AttachmentState::Temporary)
    }

    /// Joins two open edges with the fold code for their types in `context`.
    pub fn attach(
        &mut self,
        a: UnitId,
        edge_a: usize,
        b: UnitId,
        edge_b: usize,
        context: &str,
    ) -> Result<AttachmentId, EngineError> {
        self.ensure_writable()?;
        let type_a = self.unit(a).ok_or(EngineError::UnknownUnit(a))?.polygon_type();
        let type_b = self.unit(b).ok_or(EngineError::UnknownUnit(b))?.polygon_type();
        let fold = self.fold_code(type_a, type_b, context)?;
        self.add_attachment(a, edge_a, b, edge_b, fold)
    }

    pub fn confirm_attachment(&mut self, id: AttachmentId) -> Result<(), EngineError> {
        self.ensure_writable()?;
        self.graph.confirm_attachment(id)
    }

    /// Breaks one joint, reopening both edges.
    pub fn break_attachment(&mut self, id: AttachmentId) -> Result<AttachmentEdge, EngineError> {
        self.ensure_writable()?;
        let result = self.graph.detach(id);
        let edge = self.guard(result)?;
        unlocked(&mut self.estimator).on_detached(&self.graph, &edge);
        debug!(%id, "attachment broken");
        Ok(edge)
    }

    /// Removes a unit and every attachment touching it.
    pub fn remove_unit(&mut self, id: UnitId) -> Result<RemovedUnit, EngineError> {
        self.ensure_writable()?;
        if !self.graph.contains_unit(id) {
            return Err(EngineError::UnknownUnit(id));
        }
        let result = self.graph.remove_unit(id);
        let removed = self.guard(result)?;
        unlocked(&mut self.estimator).on_unit_removed(&self.graph, &removed);
        debug!(%id, detached = removed.detached.len(), "unit removed");
        Ok(removed)
    }

    /// Removes several units, typically a decay removal set. Fails without
    /// removing anything if any id is unknown.
    pub fn remove_units(
        &mut self,
        ids: impl IntoIterator<Item = UnitId>,
    ) -> Result<Vec<RemovedUnit>, EngineError> {
        self.ensure_writable()?;
        let ids: BTreeSet<UnitId> = ids.into_iter().collect();
        if let Some(missing) = ids.iter().find(|id| !self.graph.contains_unit(**id)) {
            return Err(EngineError::UnknownUnit(*missing));
        }
        ids.into_iter().map(|id| self.remove_unit(id)).collect()
    }

    /// Repositions a unit with no attachments.
    pub fn move_unit(
        &mut self,
        id: UnitId,
        position: DVec3,
        orientation: DQuat,
    ) -> Result<(), EngineError> {
        self.ensure_writable()?;
        let result = self.graph.move_unit(id, position, orientation);
        self.guard(result)?;
        unlocked(&mut self.estimator).touch(&self.graph);
        Ok(())
    }

    /// Re-registers an open edge from its unit's current pose. A no-op for
    /// attached edges.
    ///
    /// There is no facade `unregister`: an open slot missing from the
    /// registry would break edge exclusivity. Slots leave the registry only
    /// by being attached or by their unit being removed.
    pub fn register(&mut self, unit: UnitId, edge: usize) -> Result<(), EngineError> {
        self.ensure_writable()?;
        let result = self.graph.refresh_open_edge(unit, edge);
        self.guard(result)
    }

    /// Realises a candidate from [`propose_placements`](Self::propose_placements).
    ///
    /// Atomic: if the attachment cannot be made, the new unit is removed
    /// again and the error returned.
    pub fn place(
        &mut self,
        candidate: &CandidatePlacement,
    ) -> Result<(UnitId, AttachmentId), EngineError> {
        self.ensure_writable()?;
        let target = candidate.target.key();
        let host = self
            .unit(target.unit)
            .ok_or(EngineError::UnknownUnit(target.unit))?;
        if !host.slot(target.edge).is_some_and(|s| s.is_open()) {
            return Err(EngineError::EdgeAlreadyAttached {
                unit: target.unit,
                edge: target.edge,
            });
        }
        let id = self.add_unit(candidate.polygon_type, candidate.position, candidate.orientation)?;
        match self.add_attachment(
            target.unit,
            target.edge,
            id,
            candidate.edge,
            candidate.fold.clone(),
        ) {
            Ok(attachment) => Ok((id, attachment)),
            Err(err) => {
                if err.is_recoverable() {
                    self.remove_unit(id)?;
                }
                Err(err)
            }
        }
    }

    /// Attaches every pair of open edges on different units whose midpoints
    /// coincide, using the fold code for their types in `context`.
    ///
    /// All fold codes and edge lengths are checked before the first
    /// attachment is made.
    pub fn close_coincident_edges(
        &mut self,
        context: &str,
    ) -> Result<Vec<AttachmentId>, EngineError> {
        self.ensure_writable()?;
        let tolerance = self.config.edge_length_tolerance;
        let mut used: HashSet<SlotKey> = HashSet::new();
        let mut pairs: Vec<(SlotKey, SlotKey, Arc<FoldCode>)> = Vec::new();

        let entries: Vec<OpenEdgeEntry> = self.graph.registry().iter().cloned().collect();
        for entry in &entries {
            if used.contains(&entry.key()) {
                continue;
            }
            let radius = tolerance * entry.length;
            let partner = self
                .graph
                .registry()
                .query_near(entry.midpoint, radius)
                .into_iter()
                .find(|other| {
                    other.unit != entry.unit
                        && other.key() > entry.key()
                        && !used.contains(&other.key())
                })
                .cloned();
            let Some(partner) = partner else {
                continue;
            };
            if (entry.length - partner.length).abs() > tolerance * entry.length.max(partner.length) {
                return Err(EngineError::IncompatibleEdgeLength {
                    a: entry.length,
                    b: partner.length,
                    tolerance,
                });
            }
            let fold = self.fold_code(entry.polygon_type, partner.polygon_type, context)?;
            used.insert(entry.key());
            used.insert(partner.key());
            pairs.push((entry.key(), partner.key(), fold));
        }

        let mut created = Vec::with_capacity(pairs.len());
        for (a, b, fold) in pairs {
            created.push(self.add_attachment(a.unit, a.edge, b.unit, b.edge, fold)?);
        }
        debug!(count = created.len(), context, "coincident edges closed");
        Ok(created)
    }

    // ---- queries ---------------------------------------------------------

    pub fn neighbors(&self, id: UnitId) -> Result<BTreeSet<UnitId>, EngineError> {
        self.graph.neighbors(id)
    }

    pub fn query_near(&self, point: DVec3, radius: f64) -> Vec<OpenEdgeEntry> {
        self.graph
            .registry()
            .query_near(point, radius)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn query_compatible(&self, point: DVec3, radius: f64, polygon_type: u8) -> Vec<OpenEdgeEntry> {
        self.graph
            .registry()
            .query_compatible(point, radius, polygon_type)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Ranked placements for a new `polygon_type` unit in the default context.
    pub fn propose_placements(
        &self,
        polygon_type: u8,
    ) -> Result<Vec<CandidatePlacement>, EngineError> {
        self.propose_placements_in(polygon_type, &self.config.default_context)
    }

    pub fn propose_placements_in(
        &self,
        polygon_type: u8,
        context: &str,
    ) -> Result<Vec<CandidatePlacement>, EngineError> {
        Propagator {
            graph: &self.graph,
            provider: self.provider.as_ref(),
            folds: &self.folds,
            oracle: self.oracle.as_ref(),
            min_stability: self.config.min_fold_stability,
        }
        .propose(polygon_type, context)
    }

    /// Splits the assembly into the sub-assembly to keep and the units to
    /// remove. Removing them is left to the caller.
    pub fn decay(&self) -> DecayOutcome {
        let outcome = decay(&self.graph, self.config.stability_epsilon);
        debug!(
            stable = outcome.stable.len(),
            removal = outcome.removal.len(),
            score = outcome.score,
            "decay evaluated"
        );
        outcome
    }

    pub fn stability_matrix(&self) -> StabilityMatrix {
        compute_stability_matrix(&self.graph, self.config.reattach_radius)
    }

    pub fn decomposition(&self) -> DecompositionTree {
        DecompositionTree::build(&self.graph, self.config.stability_epsilon)
    }

    pub fn estimate(&self) -> Estimate {
        self.estimator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .estimate(&self.graph, &self.topology)
    }

    pub fn topology_hash(&self) -> HashValue {
        topology_hash(&self.graph, self.config.wl_rounds)
    }

    /// Records a known topological count for the current topology.
    pub fn seed_topology(&self, o: f64) -> HashValue {
        let hash = self.topology_hash();
        self.topology.seed(hash, o);
        hash
    }

    /// Fold code for a type pair, solving it on first use.
    pub fn fold_code(&self, a: u8, b: u8, context: &str) -> Result<Arc<FoldCode>, EngineError> {
        self.folds.get_or_create(self.provider.as_ref(), a, b, context)
    }

    /// Full audit of slots, attachments and registry. Poisons on failure.
    pub fn check_invariants(&mut self) -> Result<(), EngineError> {
        if let Some(reason) = &self.poisoned {
            return Err(EngineError::Poisoned(reason.clone()));
        }
        let result = self.graph.check_invariants();
        self.guard(result)
    }

    // ---- internals -------------------------------------------------------

    fn attach_with(
        &mut self,
        a: UnitId,
        edge_a: usize,
        b: UnitId,
        edge_b: usize,
        fold: Arc<FoldCode>,
        state: AttachmentState,
    ) -> Result<AttachmentId, EngineError> {
        self.ensure_writable()?;
        let result = self.graph.add_attachment(a, edge_a, b, edge_b, fold, state);
        let id = self.guard(result)?;
        unlocked(&mut self.estimator).on_attached(&self.graph, id);
        debug!(%id, %a, edge_a, %b, edge_b, ?state, "units attached");
        Ok(id)
    }

    fn template(&mut self, polygon_type: u8) -> Result<Arc<PolygonTemplate>, EngineError> {
        if let Some(template) = self.templates.get(&polygon_type) {
            return Ok(template.clone());
        }
        let template = Arc::new(self.provider.get_template(polygon_type)?);
        self.templates.insert(polygon_type, template.clone());
        Ok(template)
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        match &self.poisoned {
            Some(reason) => Err(EngineError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    fn guard<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(EngineError::InvariantViolation(reason)) = &result {
            error!(%reason, "assembly poisoned");
            self.poisoned = Some(reason.clone());
        }
        result
    }
}

fn unlocked(estimator: &mut Mutex<Estimator>) -> &mut Estimator {
    estimator.get_mut().unwrap_or_else(PoisonError::into_inner)
}

/// An [`Assembly`] behind a reader-writer lock.
///
/// Readers run concurrently; a writer excludes everyone else.
#[derive(Debug, Clone)]
pub struct SharedAssembly(Arc<RwLock<Assembly>>);

impl SharedAssembly {
    pub fn new(assembly: Assembly) -> Self {
        Self(Arc::new(RwLock::new(assembly)))
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Assembly>, EngineError> {
        self.0
            .read()
            .map_err(|_| EngineError::Poisoned("assembly lock poisoned".to_string()))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Assembly>, EngineError> {
        self.0
            .write()
            .map_err(|_| EngineError::Poisoned("assembly lock poisoned".to_string()))
    }

    /// Runs `f` under the read lock.
    pub fn with_read<T>(&self, f: impl FnOnce(&Assembly) -> T) -> Result<T, EngineError> {
        Ok(f(&*self.read()?))
    }

    /// Runs `f` under the write lock.
    pub fn with_write<T>(
        &self,
        f: impl FnOnce(&mut Assembly) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        f(&mut *self.write()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fold::DEFAULT_CONTEXT;
    use crate::geometry::{NoCollision, RegularPolygons};
    use std::f64::consts::{FRAC_PI_2, PI};

    fn assembly() -> Assembly {
        Assembly::new(Arc::new(RegularPolygons::new()))
    }

    #[test]
    fn attach_resolves_fold_by_context() {
        let mut asm = assembly();
        let a = asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        let b = asm.add_unit(4, DVec3::X, DQuat::IDENTITY).unwrap();
        let id = asm.attach(a, 0, b, 2, "planar").unwrap();
        let edge = asm.attachment(id).unwrap();
        assert!((edge.fold.dihedral() - PI).abs() < 1e-12);
        assert_eq!(edge.state, AttachmentState::Permanent);
        assert_eq!(asm.neighbors(b).unwrap().len(), 1);
        // Re-registering an attached slot cannot reopen it.
        asm.register(a, 0).unwrap();
        assert!(!asm.graph().registry().contains(a, 0));
        asm.check_invariants().unwrap();
    }

    #[test]
    fn temporary_attachment_needs_confirmation() {
        let mut asm = assembly();
        let a = asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        let b = asm.add_unit(4, DVec3::X, DQuat::IDENTITY).unwrap();
        let fold = asm.fold_code(4, 4, "planar").unwrap();
        let id = asm.add_temporary_attachment(a, 0, b, 2, fold).unwrap();
        assert_eq!(asm.attachment(id).unwrap().state, AttachmentState::Temporary);
        asm.confirm_attachment(id).unwrap();
        assert_eq!(asm.attachment(id).unwrap().state, AttachmentState::Permanent);
        let edge = asm.break_attachment(id).unwrap();
        assert_eq!(edge.id, id);
        assert_eq!(asm.attachment_count(), 0);
        assert_eq!(asm.graph().open_edge_count(), 8);
    }

    #[test]
    fn place_realises_the_best_candidate() {
        let mut asm = assembly();
        let host = asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        let candidates = asm.propose_placements(4).unwrap();
        let (unit, attachment) = asm.place(&candidates[0]).unwrap();
        assert_eq!(asm.neighbors(host).unwrap().into_iter().collect::<Vec<_>>(), vec![unit]);
        let fold = &asm.attachment(attachment).unwrap().fold;
        assert!((fold.dihedral() - FRAC_PI_2).abs() < 1e-12);
        assert!((asm.attachment(attachment).unwrap().displacement.length() - 0.5f64.sqrt()).abs() < 1e-9);
        // The same candidate cannot be placed twice.
        assert!(matches!(
            asm.place(&candidates[0]),
            Err(EngineError::EdgeAlreadyAttached { .. })
        ));
        assert_eq!(asm.unit_count(), 2);
        asm.check_invariants().unwrap();
    }

    #[test]
    fn failed_placement_leaves_no_trace() {
        let mut asm = assembly();
        asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        let mut candidate = asm.propose_placements(4).unwrap().remove(0);
        // A fold for the wrong pair is rejected after the unit is added.
        candidate.fold = asm.fold_code(3, 3, DEFAULT_CONTEXT).unwrap();
        let before = asm.estimate();
        assert!(matches!(
            asm.place(&candidate),
            Err(EngineError::FoldCodeMismatch { .. })
        ));
        assert_eq!(asm.unit_count(), 1);
        assert_eq!(asm.graph().open_edge_count(), 4);
        let after = asm.estimate();
        assert!((after.s_total - before.s_total).abs() < 1e-9);
        assert!((after.ac - before.ac).abs() < 1e-9);
        asm.check_invariants().unwrap();
    }

    #[test]
    fn remove_units_is_all_or_nothing() {
        let mut asm = assembly();
        let a = asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        let b = asm.add_unit(4, DVec3::X, DQuat::IDENTITY).unwrap();
        asm.attach(a, 0, b, 2, "planar").unwrap();
        let ghost = UnitId::new(40, 0);
        assert!(matches!(
            asm.remove_units([a, ghost]),
            Err(EngineError::UnknownUnit(id)) if id == ghost
        ));
        assert_eq!(asm.unit_count(), 2);
        let removed = asm.remove_units([a, b]).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(asm.unit_count(), 0);
        assert_eq!(asm.graph().open_edge_count(), 0);
    }

    #[test]
    fn moving_and_registering_refresh_the_registry() {
        let mut asm = assembly();
        let a = asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        asm.move_unit(a, DVec3::new(5.0, 0.0, 0.0), DQuat::IDENTITY)
            .unwrap();
        let near = asm.query_near(DVec3::new(5.5, 0.0, 0.0), 0.1);
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].edge, 0);
        asm.register(a, 0).unwrap();
        assert_eq!(asm.graph().open_edge_count(), 4);
        assert_eq!(asm.query_compatible(DVec3::new(5.0, 0.0, 0.0), 1.0, 4).len(), 4);
        assert!(asm.estimate().s_total > 1.0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            registry_cell_size: 0.0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Assembly::with_config(Arc::new(RegularPolygons::new()), config),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn poisoned_assembly_refuses_mutations() {
        let mut asm = assembly();
        let a = asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        let result: Result<(), EngineError> =
            Err(EngineError::InvariantViolation("slot mismatch".to_string()));
        assert!(asm.guard(result).is_err());
        assert!(asm.is_poisoned());
        assert!(matches!(
            asm.add_unit(4, DVec3::X, DQuat::IDENTITY),
            Err(EngineError::Poisoned(_))
        ));
        assert!(matches!(asm.remove_unit(a), Err(EngineError::Poisoned(_))));
        assert!(matches!(asm.check_invariants(), Err(EngineError::Poisoned(_))));
        // Reads keep working.
        assert_eq!(asm.unit_count(), 1);
        assert!(!asm.decay().stable.is_empty());
    }

    #[test]
    fn shared_assembly_serialises_writers() {
        let shared = SharedAssembly::new(
            assembly().with_oracle(Arc::new(NoCollision)),
        );
        std::thread::scope(|scope| {
            for i in 0..4 {
                let shared = shared.clone();
                scope.spawn(move || {
                    shared
                        .with_write(|asm| asm.add_unit(4, DVec3::X * (3.0 * i as f64), DQuat::IDENTITY))
                        .unwrap();
                });
            }
        });
        assert_eq!(shared.with_read(|asm| asm.unit_count()).unwrap(), 4);
        let estimate = shared.with_read(|asm| asm.estimate()).unwrap();
        assert!((estimate.s_total - 625.0).abs() < 1e-6);
    }

    #[test]
    fn context_proposals_honour_min_fold_stability() {
        let config = EngineConfig {
            min_fold_stability: 0.5,
            ..EngineConfig::default()
        };
        let mut asm = Assembly::with_config(Arc::new(RegularPolygons::new()), config).unwrap();
        asm.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        assert!(asm.propose_placements_in(4, "planar").unwrap().is_empty());
        assert_eq!(asm.propose_placements(4).unwrap().len(), 4);
    }

    #[test]
    fn shared_fold_cache_keeps_each_threshold() {
        let folds = Arc::new(FoldCodeCache::new());
        let mut lax = assembly().with_fold_cache(folds.clone());
        let strict_config = EngineConfig {
            min_fold_stability: 0.9,
            ..EngineConfig::default()
        };
        let mut strict = Assembly::with_config(Arc::new(RegularPolygons::new()), strict_config)
            .unwrap()
            .with_fold_cache(folds.clone());
        lax.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        strict.add_unit(4, DVec3::ZERO, DQuat::IDENTITY).unwrap();
        assert!(!lax.propose_placements(6).unwrap().is_empty());
        assert!(strict.propose_placements(6).unwrap().is_empty());
        assert_eq!(strict.propose_placements(4).unwrap().len(), 4);
    }

    #[test]
    fn shared_fold_cache_is_reused_across_assemblies() {
        let folds = Arc::new(FoldCodeCache::new());
        let first = assembly().with_fold_cache(folds.clone());
        let second = assembly().with_fold_cache(folds.clone());
        let a = first.fold_code(4, 5, DEFAULT_CONTEXT).unwrap();
        let b = second.fold_code(5, 4, DEFAULT_CONTEXT).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(folds.solve_count(), 1);
    }
}
