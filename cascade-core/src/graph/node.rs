//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;

use crate::engine::EvalContext;
use crate::error::EvalError;

/// A type-erased node value.
///
/// Values are shared rather than cloned when dependents read them, so a
/// large value costs one reference-count bump per read.
pub type Value = Arc<dyn Any + Send + Sync>;

/// The recomputation function of a derived node.
pub type Evaluator = Box<dyn FnMut(&mut EvalContext<'_>) -> Result<Pulse, EvalError> + Send>;

/// Stable identifier for a node in the dependency graph.
///
/// The identifier is an arena slot plus a generation counter. When a node is
/// disposed its slot may be reused, but the generation is bumped so stale
/// identifiers never alias the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this node was created.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A continuous source. Holds a value between turns and changes only
    /// through external stimuli.
    Var,

    /// A discrete source. Fires only in the turn it was emitted to.
    EventSource,

    /// A continuous derived node. Caches its computed value.
    Signal,

    /// A discrete derived node. Fires in a turn only when its evaluator
    /// produces a value.
    Events,
}

impl NodeKind {
    /// Sources receive stimuli; they have no evaluator.
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::Var | NodeKind::EventSource)
    }

    /// Discrete nodes only expose their value in the turn they fired.
    pub fn is_discrete(&self) -> bool {
        matches!(self, NodeKind::EventSource | NodeKind::Events)
    }
}

/// How a derived node's dependency set evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyMode {
    /// Declared dependencies are kept for the node's lifetime. Reads of
    /// undeclared nodes still add edges.
    #[default]
    Static,

    /// The dependency set is replaced by whatever the node read during its
    /// last successful evaluation.
    Dynamic,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is final for the current turn (or between turns).
    Clean,

    /// The node has been invalidated this turn and has not yet evaluated.
    Dirty,

    /// The node's evaluator failed this turn. It keeps its previous value and
    /// returns to `Clean` when the turn completes.
    Failed,
}

/// Result of evaluating a node.
pub enum Pulse {
    /// The node produced a new value; dependents are invalidated.
    Changed(Value),

    /// The node evaluated but its observable value did not change.
    Unchanged,
}

impl Pulse {
    /// Wrap a concrete value.
    pub fn changed<T: Any + Send + Sync>(value: T) -> Self {
        Pulse::Changed(Arc::new(value))
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, Pulse::Changed(_))
    }
}

impl fmt::Debug for Pulse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pulse::Changed(_) => f.write_str("Changed(..)"),
            Pulse::Unchanged => f.write_str("Unchanged"),
        }
    }
}

/// A node in the dependency graph.
pub struct Node {
    kind: NodeKind,
    mode: DependencyMode,
    label: Option<String>,

    /// Topological height. Strictly greater than the level of every
    /// dependency between turns.
    level: u32,

    dirty: DirtyState,

    /// Last computed (or emitted) value.
    value: Option<Value>,

    /// Value handed in by a stimulus, committed when the source evaluates.
    pending: Option<Value>,

    /// Turn in which the node last changed.
    pulsed: Option<u64>,

    /// Nodes that this node reads from (parents in the DAG).
    dependencies: IndexSet<NodeId>,

    /// Nodes that read from this node (children in the DAG). A back-reference
    /// only; never implies ownership.
    dependents: IndexSet<NodeId>,

    /// Taken out of the node while it runs so the evaluator can reach the
    /// graph through its context.
    evaluator: Option<Evaluator>,
}

impl Node {
    /// Create a new source node with an optional initial value.
    pub fn source(kind: NodeKind, initial: Option<Value>) -> Self {
        debug_assert!(kind.is_source());
        Self {
            kind,
            mode: DependencyMode::Static,
            label: None,
            level: 0,
            dirty: DirtyState::Clean,
            value: initial,
            pending: None,
            pulsed: None,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
            evaluator: None,
        }
    }

    /// Create a new derived node. Derived nodes start dirty until their first
    /// evaluation.
    pub fn derived(kind: NodeKind, mode: DependencyMode, evaluator: Evaluator) -> Self {
        debug_assert!(!kind.is_source());
        Self {
            kind,
            mode,
            label: None,
            level: 0,
            dirty: DirtyState::Dirty,
            value: None,
            pending: None,
            pulsed: None,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
            evaluator: Some(evaluator),
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn with_value(mut self, value: Option<Value>) -> Self {
        self.value = value;
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn mode(&self) -> DependencyMode {
        self.mode
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub(crate) fn set_level(&mut self, level: u32) {
        self.level = level;
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty == DirtyState::Dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.dirty = DirtyState::Failed;
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub(crate) fn replace_value(&mut self, value: Option<Value>) -> Option<Value> {
        std::mem::replace(&mut self.value, value)
    }

    pub(crate) fn set_pending(&mut self, value: Value) {
        self.pending = Some(value);
    }

    pub(crate) fn take_pending(&mut self) -> Option<Value> {
        self.pending.take()
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = None;
    }

    pub fn pulsed(&self) -> Option<u64> {
        self.pulsed
    }

    pub(crate) fn set_pulsed(&mut self, turn: Option<u64>) {
        self.pulsed = turn;
    }

    /// Whether the node changed in the given turn.
    pub fn pulsed_in(&self, turn: u64) -> bool {
        self.pulsed == Some(turn)
    }

    pub(crate) fn take_evaluator(&mut self) -> Option<Evaluator> {
        self.evaluator.take()
    }

    pub(crate) fn restore_evaluator(&mut self, evaluator: Evaluator) {
        self.evaluator = Some(evaluator);
    }

    pub(crate) fn add_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.insert(node_id)
    }

    pub(crate) fn remove_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.shift_remove(&node_id)
    }

    pub fn dependencies(&self) -> &IndexSet<NodeId> {
        &self.dependencies
    }

    pub(crate) fn add_dependent(&mut self, node_id: NodeId) -> bool {
        self.dependents.insert(node_id)
    }

    pub(crate) fn remove_dependent(&mut self, node_id: NodeId) -> bool {
        self.dependents.shift_remove(&node_id)
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("level", &self.level)
            .field("dirty", &self.dirty)
            .field("has_value", &self.value.is_some())
            .field("dependencies", &self.dependencies)
            .field("dependents", &self.dependents)
            .finish()
    }
}

/// A read-only snapshot of a node, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: Option<String>,
    pub level: u32,
    pub dirty: DirtyState,
    pub has_value: bool,
    pub pulsed: Option<u64>,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
}

impl NodeInfo {
    pub(crate) fn capture(id: NodeId, node: &Node) -> Self {
        Self {
            id,
            kind: node.kind,
            label: node.label.clone(),
            level: node.level,
            dirty: node.dirty,
            has_value: node.value.is_some(),
            pulsed: node.pulsed,
            dependencies: node.dependencies.iter().copied().collect(),
            dependents: node.dependents.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Evaluator {
        Box::new(|_| Ok(Pulse::Unchanged))
    }

    #[test]
    fn source_node_starts_clean() {
        let node = Node::source(NodeKind::Var, Some(Arc::new(1)));
        assert_eq!(node.kind(), NodeKind::Var);
        assert_eq!(node.dirty_state(), DirtyState::Clean);
        assert_eq!(node.level(), 0);
    }

    #[test]
    fn derived_node_starts_dirty() {
        let node = Node::derived(NodeKind::Signal, DependencyMode::Static, noop());
        assert_eq!(node.kind(), NodeKind::Signal);
        assert!(node.is_dirty());
        assert!(node.value().is_none());
    }

    #[test]
    fn kind_classification() {
        assert!(NodeKind::Var.is_source());
        assert!(NodeKind::EventSource.is_source());
        assert!(!NodeKind::Signal.is_source());
        assert!(NodeKind::Events.is_discrete());
        assert!(!NodeKind::Var.is_discrete());
    }

    #[test]
    fn dependency_management_keeps_insertion_order() {
        let mut node = Node::derived(NodeKind::Signal, DependencyMode::Static, noop());
        let dep1 = NodeId::new(1, 0);
        let dep2 = NodeId::new(2, 0);
        let dep3 = NodeId::new(3, 0);

        node.add_dependency(dep2);
        node.add_dependency(dep1);
        node.add_dependency(dep3);
        assert!(!node.add_dependency(dep1));

        node.remove_dependency(dep1);
        let order: Vec<_> = node.dependencies().iter().copied().collect();
        assert_eq!(order, vec![dep2, dep3]);
    }

    #[test]
    fn dirty_state_transitions() {
        let mut node = Node::derived(NodeKind::Events, DependencyMode::Dynamic, noop());
        node.mark_clean();
        assert_eq!(node.dirty_state(), DirtyState::Clean);
        node.mark_dirty();
        assert!(node.is_dirty());
        node.mark_failed();
        assert_eq!(node.dirty_state(), DirtyState::Failed);
    }

    #[test]
    fn pulse_tracking() {
        let mut node = Node::source(NodeKind::EventSource, None);
        assert!(!node.pulsed_in(1));
        node.set_pulsed(Some(1));
        assert!(node.pulsed_in(1));
        assert!(!node.pulsed_in(2));
    }

    #[test]
    fn node_id_display() {
        assert_eq!(NodeId::new(4, 2).to_string(), "#4.2");
    }
}
