//! The liaison graph: placed units and the attachments between their edges.
//!
//! Units live in a generational arena; each carries one slot per edge that is
//! either open or holds the id of the attachment occupying it. Every open slot
//! has exactly one entry in the open-edge registry and no attached slot has
//! one. Mutations validate all inputs before touching state, so an `Err`
//! leaves the graph unchanged.

use crate::arena::{Arena, AttachmentId, UnitId};
use crate::error::EngineError;
use crate::fold::FoldCode;
use crate::geometry::{PolygonTemplate, TypeSet, UnitBounds};
use crate::registry::{OpenEdgeEntry, OpenEdgeRegistry, SlotKey};
use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// State of one edge of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeSlot {
    Open,
    Attached(AttachmentId),
}

impl EdgeSlot {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, EdgeSlot::Open)
    }
}

/// World-space geometry of one edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldEdge {
    pub midpoint: DVec3,
    pub normal: DVec3,
    pub direction: DVec3,
    pub length: f64,
}

/// A placed polygon.
#[derive(Debug, Clone)]
pub struct Unit {
    template: Arc<PolygonTemplate>,
    position: DVec3,
    orientation: DQuat,
    slots: Vec<EdgeSlot>,
    compatible: TypeSet,
}

impl Unit {
    fn new(
        template: Arc<PolygonTemplate>,
        position: DVec3,
        orientation: DQuat,
        compatible: TypeSet,
    ) -> Self {
        let slots = vec![EdgeSlot::Open; template.edge_count()];
        Self {
            template,
            position,
            orientation: orientation.normalize(),
            slots,
            compatible,
        }
    }

    #[inline]
    pub fn polygon_type(&self) -> u8 {
        self.template.side_count
    }

    pub fn template(&self) -> &Arc<PolygonTemplate> {
        &self.template
    }

    #[inline]
    pub fn position(&self) -> DVec3 {
        self.position
    }

    #[inline]
    pub fn orientation(&self) -> DQuat {
        self.orientation
    }

    pub fn slots(&self) -> &[EdgeSlot] {
        &self.slots
    }

    pub fn slot(&self, edge: usize) -> Option<EdgeSlot> {
        self.slots.get(edge).copied()
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.slots.len()
    }

    pub fn attached_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_open()).count()
    }

    pub fn open_count(&self) -> usize {
        self.edge_count() - self.attached_count()
    }

    /// Indices of open edges in ascending order.
    pub fn open_edges(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_open())
            .map(|(k, _)| k)
    }

    /// Fraction of edges that are attached.
    pub fn stability(&self) -> f64 {
        if self.slots.is_empty() {
            return 0.0;
        }
        self.attached_count() as f64 / self.edge_count() as f64
    }

    /// Polygon types allowed to attach to this unit's open edges.
    pub fn compatible(&self) -> TypeSet {
        self.compatible
    }

    pub fn face_normal(&self) -> DVec3 {
        self.orientation * DVec3::Z
    }

    pub fn world_edge(&self, edge: usize) -> Option<WorldEdge> {
        let local = self.template.local_edge(edge)?;
        Some(WorldEdge {
            midpoint: self.position + self.orientation * local.midpoint,
            normal: self.orientation * local.normal,
            direction: self.orientation * local.direction,
            length: local.length,
        })
    }

    pub fn bounds(&self) -> UnitBounds {
        UnitBounds {
            center: self.position,
            normal: self.face_normal(),
            circumradius: self.template.circumradius(),
            inradius: self.template.apothem(),
        }
    }

    fn open_entry(&self, id: UnitId, edge: usize) -> Option<OpenEdgeEntry> {
        let world = self.world_edge(edge)?;
        Some(OpenEdgeEntry {
            unit: id,
            edge,
            polygon_type: self.polygon_type(),
            midpoint: world.midpoint,
            normal: world.normal,
            face_normal: self.face_normal(),
            length: world.length,
            compatible: self.compatible,
        })
    }
}

/// Whether an attachment has been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentState {
    Temporary,
    Permanent,
}

/// An attachment between two edge slots.
#[derive(Debug, Clone)]
pub struct AttachmentEdge {
    pub id: AttachmentId,
    pub source: SlotKey,
    pub target: SlotKey,
    /// Target centroid minus source centroid at attach time.
    pub displacement: DVec3,
    pub fold: Arc<FoldCode>,
    pub state: AttachmentState,
}

impl AttachmentEdge {
    pub fn touches(&self, unit: UnitId) -> bool {
        self.source.unit == unit || self.target.unit == unit
    }

    /// The slot on the far side from `unit`.
    pub fn other(&self, unit: UnitId) -> Option<SlotKey> {
        if self.source.unit == unit {
            Some(self.target)
        } else if self.target.unit == unit {
            Some(self.source)
        } else {
            None
        }
    }
}

/// A unit taken out of the graph together with the attachments it lost.
#[derive(Debug, Clone)]
pub struct RemovedUnit {
    pub id: UnitId,
    pub unit: Unit,
    pub detached: Vec<AttachmentEdge>,
}

#[derive(Debug, Clone)]
pub struct LiaisonGraph {
    units: Arena<UnitId, Unit>,
    attachments: Arena<AttachmentId, AttachmentEdge>,
    registry: OpenEdgeRegistry,
    tolerance: f64,
    revision: u64,
}

impl LiaisonGraph {
    /// Empty graph; `tolerance` is the relative edge-length tolerance.
    pub fn new(tolerance: f64, cell_size: f64, naive_threshold: usize) -> Self {
        Self {
            units: Arena::new(),
            attachments: Arena::new(),
            registry: OpenEdgeRegistry::new(cell_size, naive_threshold),
            tolerance,
            revision: 0,
        }
    }

    /// Places a unit with every edge open.
    pub fn add_unit(
        &mut self,
        template: Arc<PolygonTemplate>,
        position: DVec3,
        orientation: DQuat,
        compatible: TypeSet,
    ) -> UnitId {
        let id = self.units.allocate(Unit::new(template, position, orientation, compatible));
        if let Some(unit) = self.units.get(id) {
            for edge in 0..unit.edge_count() {
                if let Some(entry) = unit.open_entry(id, edge) {
                    self.registry.register(entry);
                }
            }
        }
        self.revision += 1;
        trace!(%id, "unit added");
        id
    }

    /// Realises an attachment between edge `edge_a` of `a` and edge `edge_b`
    /// of `b`.
    pub fn add_attachment(
        &mut self,
        a: UnitId,
        edge_a: usize,
        b: UnitId,
        edge_b: usize,
        fold: Arc<FoldCode>,
        state: AttachmentState,
    ) -> Result<AttachmentId, EngineError> {
        if a == b {
            return Err(EngineError::SelfAttachment(a));
        }
        let unit_a = self.units.get(a).ok_or(EngineError::UnknownUnit(a))?;
        let unit_b = self.units.get(b).ok_or(EngineError::UnknownUnit(b))?;
        let edge_a_geom = Self::open_slot_edge(a, unit_a, edge_a)?;
        let edge_b_geom = Self::open_slot_edge(b, unit_b, edge_b)?;

        let (type_a, type_b) = (unit_a.polygon_type(), unit_b.polygon_type());
        if !fold.key.joins(type_a, type_b) {
            return Err(EngineError::FoldCodeMismatch {
                a: type_a,
                b: type_b,
                found_a: fold.key.lo,
                found_b: fold.key.hi,
            });
        }
        let (la, lb) = (edge_a_geom.length, edge_b_geom.length);
        if (la - lb).abs() > self.tolerance * la.max(lb) {
            return Err(EngineError::IncompatibleEdgeLength {
                a: la,
                b: lb,
                tolerance: self.tolerance,
            });
        }

        let displacement = unit_b.position - unit_a.position;
        let source = SlotKey::new(a, edge_a);
        let target = SlotKey::new(b, edge_b);
        let id = self.attachments.allocate(AttachmentEdge {
            // Overwritten below once the arena has issued the id.
            id: AttachmentId::new(u32::MAX, u32::MAX),
            source,
            target,
            displacement,
            fold,
            state,
        });
        if let Some(edge) = self.attachments.get_mut(id) {
            edge.id = id;
        }
        self.set_slot(source, EdgeSlot::Attached(id))?;
        self.set_slot(target, EdgeSlot::Attached(id))?;
        self.revision += 1;
        self.verify_slot(source)?;
        self.verify_slot(target)?;
        trace!(%id, %a, edge_a, %b, edge_b, "attachment added");
        Ok(id)
    }

    /// Marks a temporary attachment permanent.
    pub fn confirm_attachment(&mut self, id: AttachmentId) -> Result<(), EngineError> {
        let edge = self
            .attachments
            .get_mut(id)
            .ok_or(EngineError::UnknownAttachment(id))?;
        edge.state = AttachmentState::Permanent;
        Ok(())
    }

    /// Removes an attachment and reopens both of its slots.
    pub fn detach(&mut self, id: AttachmentId) -> Result<AttachmentEdge, EngineError> {
        let edge = self
            .attachments
            .deallocate(id)
            .ok_or(EngineError::UnknownAttachment(id))?;
        for slot in [edge.source, edge.target] {
            self.set_slot(slot, EdgeSlot::Open)?;
        }
        self.revision += 1;
        for slot in [edge.source, edge.target] {
            self.verify_slot(slot)?;
        }
        trace!(%id, "attachment removed");
        Ok(edge)
    }

    /// Removes a unit, first detaching everything attached to it.
    pub fn remove_unit(&mut self, id: UnitId) -> Result<RemovedUnit, EngineError> {
        let attachment_ids = self.attachments_of(id)?;
        let mut detached = Vec::with_capacity(attachment_ids.len());
        for attachment in attachment_ids {
            detached.push(self.detach(attachment)?);
        }
        let unit = self.units.deallocate(id).ok_or(EngineError::UnknownUnit(id))?;
        for edge in 0..unit.edge_count() {
            self.registry.unregister(id, edge);
        }
        self.revision += 1;
        trace!(%id, detached = detached.len(), "unit removed");
        Ok(RemovedUnit {
            id,
            unit,
            detached,
        })
    }

    /// Repositions a unit that has no attachments.
    pub fn move_unit(
        &mut self,
        id: UnitId,
        position: DVec3,
        orientation: DQuat,
    ) -> Result<(), EngineError> {
        let unit = self.units.get_mut(id).ok_or(EngineError::UnknownUnit(id))?;
        if unit.attached_count() > 0 {
            return Err(EngineError::UnitPinned(id));
        }
        unit.position = position;
        unit.orientation = orientation.normalize();
        let edges = unit.edge_count();
        for edge in 0..edges {
            self.refresh_open_edge(id, edge)?;
        }
        self.revision += 1;
        Ok(())
    }

    /// Rebuilds the registry entry of an open slot from the unit's pose.
    pub fn refresh_open_edge(&mut self, id: UnitId, edge: usize) -> Result<(), EngineError> {
        let unit = self.units.get(id).ok_or(EngineError::UnknownUnit(id))?;
        let slot = unit
            .slot(edge)
            .ok_or(EngineError::EdgeOutOfRange { unit: id, edge })?;
        self.registry.unregister(id, edge);
        if slot.is_open() {
            if let Some(entry) = unit.open_entry(id, edge) {
                self.registry.register(entry);
            }
        }
        Ok(())
    }

    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(id)
    }

    pub fn attachment(&self, id: AttachmentId) -> Option<&AttachmentEdge> {
        self.attachments.get(id)
    }

    pub fn contains_unit(&self, id: UnitId) -> bool {
        self.units.contains(id)
    }

    /// Live units in id order.
    pub fn units(&self) -> impl Iterator<Item = (UnitId, &Unit)> {
        self.units.iter()
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.units.keys().collect();
        ids.sort_unstable();
        ids
    }

    /// Live attachments in id order.
    pub fn attachments(&self) -> impl Iterator<Item = (AttachmentId, &AttachmentEdge)> {
        self.attachments.iter()
    }

    /// Attachments touching `id`, sorted.
    pub fn attachments_of(&self, id: UnitId) -> Result<Vec<AttachmentId>, EngineError> {
        let unit = self.units.get(id).ok_or(EngineError::UnknownUnit(id))?;
        let mut ids: Vec<AttachmentId> = unit
            .slots
            .iter()
            .filter_map(|slot| match slot {
                EdgeSlot::Attached(a) => Some(*a),
                EdgeSlot::Open => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Units sharing an attachment with `id`.
    pub fn neighbors(&self, id: UnitId) -> Result<BTreeSet<UnitId>, EngineError> {
        Ok(self
            .attachments_of(id)?
            .into_iter()
            .filter_map(|a| self.attachments.get(a))
            .filter_map(|edge| edge.other(id))
            .map(|slot| slot.unit)
            .collect())
    }

    pub fn unit_count(&self) -> usize {
        self.units.live_count()
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.live_count()
    }

    pub fn open_edge_count(&self) -> usize {
        self.registry.len()
    }

    pub fn total_edge_count(&self) -> usize {
        self.units.iter().map(|(_, u)| u.edge_count()).sum()
    }

    /// Mean unit position, or the origin when empty.
    pub fn centroid(&self) -> DVec3 {
        let count = self.units.live_count();
        if count == 0 {
            return DVec3::ZERO;
        }
        self.units.iter().map(|(_, u)| u.position).sum::<DVec3>() / count as f64
    }

    /// Bumped by every structural change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn registry(&self) -> &OpenEdgeRegistry {
        &self.registry
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Full consistency check of slots, attachments and registry.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        let mut open = 0usize;
        for (id, unit) in self.units.iter() {
            for edge in 0..unit.edge_count() {
                let slot = SlotKey::new(id, edge);
                self.verify_slot(slot)?;
                if let Some(EdgeSlot::Attached(a)) = unit.slot(edge) {
                    let attachment = self.attachments.get(a).ok_or_else(|| {
                        EngineError::InvariantViolation(format!(
                            "{id} edge {edge} references missing {a}"
                        ))
                    })?;
                    if attachment.source != slot && attachment.target != slot {
                        return Err(EngineError::InvariantViolation(format!(
                            "{a} does not reference {id} edge {edge}"
                        )));
                    }
                } else {
                    open += 1;
                }
            }
        }
        if open != self.registry.len() {
            return Err(EngineError::InvariantViolation(format!(
                "{open} open slots but {} registry entries",
                self.registry.len()
            )));
        }
        for (id, attachment) in self.attachments.iter() {
            for slot in [attachment.source, attachment.target] {
                let held = self.units.get(slot.unit).and_then(|u| u.slot(slot.edge));
                if held != Some(EdgeSlot::Attached(id)) {
                    return Err(EngineError::InvariantViolation(format!(
                        "{id} endpoint {} edge {} is {held:?}",
                        slot.unit, slot.edge
                    )));
                }
            }
        }
        Ok(())
    }

    fn open_slot_edge(id: UnitId, unit: &Unit, edge: usize) -> Result<WorldEdge, EngineError> {
        match unit.slot(edge) {
            None => Err(EngineError::EdgeOutOfRange { unit: id, edge }),
            Some(EdgeSlot::Attached(_)) => Err(EngineError::EdgeAlreadyAttached { unit: id, edge }),
            Some(EdgeSlot::Open) => unit
                .world_edge(edge)
                .ok_or(EngineError::EdgeOutOfRange { unit: id, edge }),
        }
    }

    /// Writes a slot and keeps the registry in step with it.
    fn set_slot(&mut self, key: SlotKey, value: EdgeSlot) -> Result<(), EngineError> {
        let unit = self.units.get_mut(key.unit).ok_or_else(|| {
            EngineError::InvariantViolation(format!("slot owner {} is gone", key.unit))
        })?;
        let slot = unit.slots.get_mut(key.edge).ok_or_else(|| {
            EngineError::InvariantViolation(format!("{} has no slot {}", key.unit, key.edge))
        })?;
        *slot = value;
        match value {
            EdgeSlot::Attached(_) => {
                self.registry.unregister(key.unit, key.edge);
            }
            EdgeSlot::Open => {
                let entry = self
                    .units
                    .get(key.unit)
                    .and_then(|u| u.open_entry(key.unit, key.edge));
                if let Some(entry) = entry {
                    self.registry.register(entry);
                }
            }
        }
        Ok(())
    }

    /// A slot is open exactly when the registry holds it.
    fn verify_slot(&self, key: SlotKey) -> Result<(), EngineError> {
        let slot = self
            .units
            .get(key.unit)
            .and_then(|u| u.slot(key.edge))
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!("{} edge {} vanished", key.unit, key.edge))
            })?;
        let registered = self.registry.contains(key.unit, key.edge);
        if slot.is_open() != registered {
            return Err(EngineError::InvariantViolation(format!(
                "{} edge {} is {slot:?} but registered = {registered}",
                key.unit, key.edge
            )));
        }
        Ok(())
    }
}
