//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between reactive values and computations.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent sources (vars, event sources) or computations (signals,
//!   event streams)
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//!
//! Every node carries a level. Between turns the level of a node is strictly
//! greater than the level of each of its dependencies, which lets the engine
//! evaluate a turn by draining a [`TopoQueue`] in level order.
//!
//! # Design Decisions
//!
//! 1. Nodes live in an arena addressed by [`NodeId`] (slot + generation), so
//!    edges can be added and removed mid-turn without invalidating anything
//!    the engine is iterating over.
//!
//! 2. We maintain both forward (dependencies) and reverse (dependents) edges.
//!    The reverse edges are plain ids and never keep a node alive.
//!
//! 3. Levels only ever grow. Removing an edge leaves the level where it is;
//!    the invariant is an inequality, so an over-high level is harmless.

mod node;
mod queue;

pub use node::{
    DependencyMode, DirtyState, Evaluator, Node, NodeId, NodeInfo, NodeKind, Pulse, Value,
};
pub use queue::TopoQueue;

use std::collections::{HashMap, VecDeque};

use indexmap::IndexSet;

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena of nodes plus the edge and level bookkeeping between them.
#[derive(Debug, Default)]
pub struct Graph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph, reusing a free slot when one exists.
    pub fn insert(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId::new(index, 0)
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node and retires its id.
    pub fn remove(&mut self, node_id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(node_id.index() as usize)?;
        if slot.generation != node_id.generation() {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(node_id.index());
        self.live -= 1;

        for dep_id in node.dependencies() {
            if let Some(dep) = self.get_mut(*dep_id) {
                dep.remove_dependent(node_id);
            }
        }
        for dependent_id in node.dependents() {
            if let Some(dependent) = self.get_mut(*dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }
        Some(node)
    }

    /// Get a reference to a live node.
    pub fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.slots
            .get(node_id.index() as usize)
            .filter(|slot| slot.generation == node_id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    /// Get a mutable reference to a live node.
    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(node_id.index() as usize)
            .filter(|slot| slot.generation == node_id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.get(node_id).is_some()
    }

    /// Add a dependency edge: `dependent` reads `dependency`.
    ///
    /// Returns `false` if the edge already existed or either node is gone.
    /// Levels are not touched; see [`Graph::raise_level`].
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) -> bool {
        if !self.contains(dependency) || !self.contains(dependent) {
            return false;
        }
        let added = self
            .get_mut(dependent)
            .map(|node| node.add_dependency(dependency))
            .unwrap_or(false);
        if let Some(dep_node) = self.get_mut(dependency) {
            dep_node.add_dependent(dependent);
        }
        added
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) -> bool {
        if let Some(dep_node) = self.get_mut(dependency) {
            dep_node.remove_dependent(dependent);
        }
        self.get_mut(dependent)
            .map(|node| node.remove_dependency(dependency))
            .unwrap_or(false)
    }

    /// The lowest level `node_id` may sit at given its current dependencies.
    pub fn required_level(&self, node_id: NodeId) -> u32 {
        self.get(node_id)
            .map(|node| {
                node.dependencies()
                    .iter()
                    .filter_map(|dep| self.get(*dep))
                    .map(|dep| dep.level() + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Lift `origin` to at least `min_level` and push its dependents up so
    /// the level invariant holds again.
    ///
    /// Returns every node whose level changed, in the order first raised.
    /// If the propagation comes back around to `origin` the graph has a cycle
    /// and the raised nodes are returned as the error.
    pub fn raise_level(
        &mut self,
        origin: NodeId,
        min_level: u32,
    ) -> Result<IndexSet<NodeId>, Vec<NodeId>> {
        let mut raised = IndexSet::new();
        let mut stack = vec![(origin, min_level)];
        let budget = self.live.saturating_mul(self.live).saturating_add(self.live);
        let mut steps = 0usize;

        while let Some((id, level)) = stack.pop() {
            let Some(node) = self.get_mut(id) else {
                continue;
            };
            if node.level() >= level {
                continue;
            }
            steps += 1;
            if (id == origin && raised.contains(&origin)) || steps > budget {
                raised.insert(origin);
                return Err(raised.into_iter().collect());
            }
            node.set_level(level);
            raised.insert(id);
            let next = level.saturating_add(1);
            stack.extend(node.dependents().iter().rev().map(|d| (*d, next)));
        }
        Ok(raised)
    }

    /// Find a chain `from -> ... -> to` following dependent edges.
    pub fn dependent_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        if from == to {
            return Some(vec![from]);
        }
        let mut parents: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::from([from]);

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.get(id) else {
                continue;
            };
            for &next in node.dependents() {
                if next == from || parents.contains_key(&next) {
                    continue;
                }
                parents.insert(next, id);
                if next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(parent) = parents.get(&cursor) {
                        path.push(*parent);
                        cursor = *parent;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// If adding `dependency -> dependent` would close a cycle, return the
    /// nodes that would take part in it.
    pub fn cycle_through(&self, dependency: NodeId, dependent: NodeId) -> Option<Vec<NodeId>> {
        self.dependent_path(dependent, dependency)
    }

    /// Ids of all live nodes, in slot order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node
                .as_ref()
                .map(|_| NodeId::new(index as u32, slot.generation))
        })
    }

    /// Get the total number of live nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.live
    }
}
