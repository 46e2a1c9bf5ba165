//! AND/OR decomposition of the liaison graph and the decay operation.
//!
//! The tree is built bottom-up with a disjoint-set forest, never by recursive
//! traversal. Every unit starts as a leaf. Attachments are merged in
//! descending fold stability (ties by id); an attachment joining two distinct
//! sub-assemblies creates an AND node over them, while one closing a cycle is
//! credited to the lowest common ancestor of its endpoints. The resulting
//! connected components hang under a single OR root when there is more than
//! one.
//!
//! Nodes are stored so that children always precede parents, which lets every
//! aggregate be computed in one forward pass.

use crate::arena::{AttachmentId, UnitId};
use crate::liaison::LiaisonGraph;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Disjoint-set forest over `0..n` with union by size and path halving.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merges the sets of `a` and `b`; returns the surviving root.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        ra
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf(UnitId),
    /// Sub-assemblies joined by an attachment; all children are needed.
    And,
    /// Disconnected alternatives; any child may be retained.
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionNode {
    pub kind: NodeKind,
    /// Covered units, sorted.
    pub units: Vec<UnitId>,
    pub children: Vec<usize>,
    pub parent: Option<usize>,
    /// Attachments inside this subtree.
    pub contacts: usize,
    /// Open edge slots inside this subtree.
    pub open_edges: usize,
    /// `contacts / (contacts + open_edges + ε)`.
    pub stability: f64,
}

impl DecompositionNode {
    fn leaf(unit: UnitId, open_edges: usize) -> Self {
        Self {
            kind: NodeKind::Leaf(unit),
            units: vec![unit],
            children: Vec::new(),
            parent: None,
            contacts: 0,
            open_edges,
            stability: 0.0,
        }
    }

    fn internal(kind: NodeKind, children: Vec<usize>) -> Self {
        Self {
            kind,
            units: Vec::new(),
            children,
            parent: None,
            contacts: 0,
            open_edges: 0,
            stability: 0.0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn min_unit(&self) -> Option<UnitId> {
        self.units.first().copied()
    }
}

/// `contacts / (contacts + open + ε)`.
#[inline]
pub fn stability_score(contacts: usize, open_edges: usize, epsilon: f64) -> f64 {
    let contacts = contacts as f64;
    contacts / (contacts + open_edges as f64 + epsilon)
}

#[derive(Debug, Clone, Default)]
pub struct DecompositionTree {
    nodes: Vec<DecompositionNode>,
    components: Vec<usize>,
    root: Option<usize>,
    leaves: BTreeMap<UnitId, usize>,
}

impl DecompositionTree {
    pub fn build(graph: &LiaisonGraph, epsilon: f64) -> Self {
        let mut nodes: Vec<DecompositionNode> = Vec::with_capacity(2 * graph.unit_count());
        let mut leaves = BTreeMap::new();
        for id in graph.unit_ids() {
            let open = graph.unit(id).map_or(0, |u| u.open_count());
            leaves.insert(id, nodes.len());
            nodes.push(DecompositionNode::leaf(id, open));
        }

        let mut attachments: Vec<(AttachmentId, UnitId, UnitId, f64)> = graph
            .attachments()
            .map(|(id, edge)| (id, edge.source.unit, edge.target.unit, edge.fold.stability))
            .collect();
        attachments.sort_by(|a, b| b.3.total_cmp(&a.3).then_with(|| a.0.cmp(&b.0)));

        let mut sets = DisjointSet::new(nodes.len());
        // Set root (a leaf index) -> current top node of that set.
        let mut top: Vec<usize> = (0..nodes.len()).collect();
        let mut own_contacts: Vec<usize> = vec![0; nodes.len()];

        for (_, a, b, _) in attachments {
            let (Some(&la), Some(&lb)) = (leaves.get(&a), leaves.get(&b)) else {
                continue;
            };
            let (ra, rb) = (sets.find(la), sets.find(lb));
            if ra == rb {
                let lca = lowest_common_ancestor(&nodes, la, lb);
                own_contacts[lca] += 1;
                continue;
            }
            let (ta, tb) = (top[ra], top[rb]);
            let mut children = vec![ta, tb];
            children.sort_by_key(|&c| min_leaf_unit(&nodes, c));
            let index = nodes.len();
            nodes.push(DecompositionNode::internal(NodeKind::And, children));
            own_contacts.push(1);
            nodes[ta].parent = Some(index);
            nodes[tb].parent = Some(index);
            let root = sets.union(ra, rb);
            top[root] = index;
        }

        let mut components: Vec<usize> = (0..leaves.len())
            .filter(|&leaf| sets.find(leaf) == leaf)
            .map(|leaf| top[leaf])
            .collect();

        aggregate(&mut nodes, &own_contacts, epsilon);
        components.sort_by_key(|&c| nodes[c].min_unit());

        let root = match components.len() {
            0 => None,
            1 => Some(components[0]),
            _ => {
                let index = nodes.len();
                let mut or = DecompositionNode::internal(NodeKind::Or, components.clone());
                for &c in &components {
                    nodes[c].parent = Some(index);
                    or.contacts += nodes[c].contacts;
                    or.open_edges += nodes[c].open_edges;
                    or.units.extend_from_slice(&nodes[c].units);
                }
                or.units.sort_unstable();
                or.stability = stability_score(or.contacts, or.open_edges, epsilon);
                nodes.push(or);
                Some(index)
            }
        };

        debug!(
            nodes = nodes.len(),
            components = components.len(),
            "decomposition built"
        );
        Self {
            nodes,
            components,
            root,
            leaves,
        }
    }

    pub fn nodes(&self) -> &[DecompositionNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&DecompositionNode> {
        self.nodes.get(index)
    }

    pub fn root(&self) -> Option<usize> {
        self.root
    }

    /// Top node of each maximal connected sub-assembly, ordered by lowest
    /// unit id.
    pub fn components(&self) -> &[usize] {
        &self.components
    }

    pub fn leaf(&self, unit: UnitId) -> Option<usize> {
        self.leaves.get(&unit).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Folds values bottom-up: a node takes `lookup`'s value when it returns
    /// one, else 1 for a leaf and the product of its children otherwise.
    /// Returns the root's value, or 1 for an empty tree.
    pub fn cascade(&self, mut lookup: impl FnMut(usize, &DecompositionNode) -> Option<f64>) -> f64 {
        let mut values = vec![1.0; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            let value = match lookup(index, node) {
                Some(value) => value,
                None => node.children.iter().map(|&c| values[c]).product(),
            };
            values[index] = value;
        }
        self.root.map_or(1.0, |root| values[root])
    }
}

fn min_leaf_unit(nodes: &[DecompositionNode], mut index: usize) -> Option<UnitId> {
    // Units are only filled in by `aggregate`; descend the first child chain.
    loop {
        let node = &nodes[index];
        match node.kind {
            NodeKind::Leaf(unit) => return Some(unit),
            _ => index = *node.children.first()?,
        }
    }
}

fn lowest_common_ancestor(nodes: &[DecompositionNode], a: usize, b: usize) -> usize {
    let mut ancestors = BTreeSet::new();
    let mut cursor = Some(a);
    while let Some(index) = cursor {
        ancestors.insert(index);
        cursor = nodes[index].parent;
    }
    let mut cursor = b;
    loop {
        if ancestors.contains(&cursor) {
            return cursor;
        }
        match nodes[cursor].parent {
            Some(parent) => cursor = parent,
            None => return cursor,
        }
    }
}

fn aggregate(nodes: &mut [DecompositionNode], own_contacts: &[usize], epsilon: f64) {
    for index in 0..nodes.len() {
        if nodes[index].is_leaf() {
            let node = &mut nodes[index];
            node.contacts = own_contacts[index];
            node.stability = stability_score(node.contacts, node.open_edges, epsilon);
            continue;
        }
        let children = nodes[index].children.clone();
        let mut contacts = own_contacts[index];
        let mut open_edges = 0;
        let mut units = Vec::new();
        for c in children {
            contacts += nodes[c].contacts;
            open_edges += nodes[c].open_edges;
            units.extend_from_slice(&nodes[c].units);
        }
        units.sort_unstable();
        let node = &mut nodes[index];
        node.contacts = contacts;
        node.open_edges = open_edges;
        node.units = units;
        node.stability = stability_score(contacts, open_edges, epsilon);
    }
}

/// Result of [`decay`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecayOutcome {
    /// The retained sub-assembly; internally connected.
    pub stable: BTreeSet<UnitId>,
    /// Every other unit.
    pub removal: BTreeSet<UnitId>,
    /// Score of the retained sub-assembly.
    pub score: f64,
}

impl DecayOutcome {
    /// `true` when nothing needs to be removed.
    pub fn is_noop(&self) -> bool {
        self.removal.is_empty()
    }
}

/// Picks the best maximal connected sub-assembly and lists the rest for
/// removal.
///
/// Higher score wins; equal scores prefer more units, then the lower smallest
/// unit id.
pub fn decay(graph: &LiaisonGraph, epsilon: f64) -> DecayOutcome {
    DecompositionTree::build(graph, epsilon).decay()
}

impl DecompositionTree {
    /// [`decay`] over an already built tree.
    pub fn decay(&self) -> DecayOutcome {
        let best = self.components.iter().copied().min_by(|&a, &b| {
            let (na, nb) = (&self.nodes[a], &self.nodes[b]);
            nb.stability
                .total_cmp(&na.stability)
                .then_with(|| nb.units.len().cmp(&na.units.len()))
                .then_with(|| na.min_unit().cmp(&nb.min_unit()))
        });
        let Some(best) = best else {
            return DecayOutcome::default();
        };
        let keep = &self.nodes[best];
        let stable: BTreeSet<UnitId> = keep.units.iter().copied().collect();
        let removal = self
            .leaves
            .keys()
            .filter(|id| !stable.contains(id))
            .copied()
            .collect();
        DecayOutcome {
            stable,
            removal,
            score: keep.stability,
        }
    }
}
