//! Engine state and the per-turn journal.
//!
//! Everything here runs with the state borrowed and never calls user code.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::subscriber::{Subscriber, SubscriberRegistry};
use super::Stimulus;
use crate::config::EngineConfig;
use crate::error::ReactError;
use crate::graph::{DirtyState, Evaluator, Graph, Node, NodeId, TopoQueue, Value};

/// Where the engine is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No turn is running.
    Idle,
    /// The drain loop is evaluating nodes.
    Draining,
    /// The drain loop finished; subscription callbacks are running.
    Notifying,
}

/// Pre-turn state of a node, captured the first time a turn touches it.
struct Snapshot {
    value: Option<Value>,
    pulsed: Option<u64>,
    dependencies: Vec<NodeId>,
}

/// Bookkeeping for the running turn.
#[derive(Default)]
pub(crate) struct Journal {
    snapshots: IndexMap<NodeId, Snapshot>,
    created: Vec<NodeId>,
    deferrals: HashMap<NodeId, u32>,
    pub evaluated: Vec<NodeId>,
    pub changed: Vec<NodeId>,
    pub failures: Vec<ReactError>,
    /// A fatal error raised outside the evaluator's own return value, e.g. an
    /// ordering violation caught by `Engine::read`.
    pub fatal: Option<ReactError>,
}

impl Journal {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn touched(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.snapshots.keys().copied().chain(self.created.iter().copied())
    }
}

/// What the drain loop should do next.
pub(crate) enum NextStep {
    Done,
    Continue,
    Fatal(ReactError),
    Evaluate {
        node: NodeId,
        evaluator: Evaluator,
    },
}

pub(crate) struct EngineState {
    pub graph: Graph,
    pub queue: TopoQueue<NodeId>,
    pub subscribers: SubscriberRegistry,
    pub phase: Phase,
    /// Number of the running turn, or of the last completed one.
    pub turn: u64,
    /// Stimulus batches waiting for a turn of their own.
    pub pending: VecDeque<Vec<Stimulus>>,
    pub journal: Journal,
    /// Nodes whose evaluators are on the call stack, innermost last.
    pub eval_stack: Vec<NodeId>,
    pub config: EngineConfig,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            graph: Graph::new(),
            queue: TopoQueue::new(),
            subscribers: SubscriberRegistry::default(),
            phase: Phase::Idle,
            turn: 0,
            pending: VecDeque::new(),
            journal: Journal::default(),
            eval_stack: Vec::new(),
            config,
        }
    }

    pub fn in_turn(&self) -> bool {
        self.phase == Phase::Draining
    }

    /// Record the pre-turn state of `id` if the running turn has not yet
    /// touched it.
    pub fn touch(&mut self, id: NodeId) {
        if !self.in_turn() || self.journal.snapshots.contains_key(&id) {
            return;
        }
        if self.journal.created.contains(&id) {
            return;
        }
        if let Some(node) = self.graph.get(id) {
            self.journal.snapshots.insert(
                id,
                Snapshot {
                    value: node.value().cloned(),
                    pulsed: node.pulsed(),
                    dependencies: node.dependencies().iter().copied().collect(),
                },
            );
        }
    }

    /// Raise `id` to at least `level`, keeping queued nodes at their new
    /// levels.
    pub fn lift(&mut self, id: NodeId, level: u32) -> Result<(), ReactError> {
        let raised = self
            .graph
            .raise_level(id, level)
            .map_err(|nodes| ReactError::CycleDetected { nodes })?;
        for node in raised {
            if self.queue.contains(node) {
                if let Some(level) = self.graph.get(node).map(|n| n.level()) {
                    self.queue.insert(node, level);
                }
            }
        }
        Ok(())
    }

    pub fn begin_turn(&mut self) -> u64 {
        self.turn += 1;
        self.phase = Phase::Draining;
        self.journal.reset();
        self.turn
    }

    /// Install a stimulus: the source gets a pending value and is queued.
    pub fn seed(&mut self, stimulus: Stimulus) {
        let Stimulus { node: id, value } = stimulus;
        let is_source = match self.graph.get(id) {
            Some(node) => node.kind().is_source(),
            None => {
                tracing::warn!(node = %id, "stimulus for disposed node dropped");
                self.journal.failures.push(ReactError::DisposedNode(id));
                return;
            }
        };
        if !is_source {
            self.journal.failures.push(ReactError::NotASource(id));
            return;
        }
        self.touch(id);
        if let Some(node) = self.graph.get_mut(id) {
            node.set_pending(value);
            node.mark_dirty();
            let level = node.level();
            self.queue.insert(id, level);
        }
    }

    /// Track a node created while the turn is draining. It evaluates in this
    /// turn once its dependencies have.
    pub fn schedule_created(&mut self, id: NodeId) {
        self.journal.created.push(id);
        if let Some(level) = self.graph.get(id).map(|n| n.level()) {
            self.queue.insert(id, level);
        }
    }

    /// Pull the next node off the queue and either handle it in place or hand
    /// its evaluator out to be run without the state borrowed.
    pub fn next_step(&mut self, turn: u64) -> NextStep {
        let Some((id, queued_level)) = self.queue.extract_min() else {
            return NextStep::Done;
        };
        let (level, is_source) = match self.graph.get(id) {
            Some(node) if node.is_dirty() => (node.level(), node.kind().is_source()),
            _ => return NextStep::Continue,
        };

        let required = self.graph.required_level(id).max(level);
        if required > queued_level {
            if let Err(err) = self.lift(id, required) {
                return NextStep::Fatal(err);
            }
            self.queue.insert(id, required);
            return NextStep::Continue;
        }

        if is_source {
            self.commit_source(id, turn);
            return NextStep::Continue;
        }

        let Some(evaluator) = self.graph.get_mut(id).and_then(|n| n.take_evaluator()) else {
            if let Some(node) = self.graph.get_mut(id) {
                node.mark_clean();
            }
            return NextStep::Continue;
        };
        self.eval_stack.push(id);
        NextStep::Evaluate {
            node: id,
            evaluator,
        }
    }

    fn commit_source(&mut self, id: NodeId, turn: u64) {
        let Some(node) = self.graph.get_mut(id) else {
            return;
        };
        let pending = node.take_pending();
        node.mark_clean();
        self.journal.evaluated.push(id);
        if let Some(value) = pending {
            node.replace_value(Some(value));
            node.set_pulsed(Some(turn));
            self.propagate(id);
        }
    }

    /// Invalidate and enqueue every dependent of a node that just changed.
    pub fn propagate(&mut self, id: NodeId) {
        self.journal.changed.push(id);
        let dependents: SmallVec<[NodeId; 8]> = match self.graph.get(id) {
            Some(node) => node.dependents().iter().copied().collect(),
            None => return,
        };
        for dependent in dependents {
            self.touch(dependent);
            if let Some(node) = self.graph.get_mut(dependent) {
                node.mark_dirty();
                let level = node.level();
                if !self.queue.contains(dependent) {
                    self.queue.insert(dependent, level);
                }
            }
        }
    }

    /// Count a deferral of `id`; fails once the node exceeds its budget.
    pub fn note_deferral(&mut self, id: NodeId, dependency: NodeId) -> Result<(), ReactError> {
        let count = self.journal.deferrals.entry(id).or_insert(0);
        *count += 1;
        if *count > self.config.max_deferrals_per_node {
            return Err(ReactError::CycleDetected {
                nodes: vec![id, dependency],
            });
        }
        Ok(())
    }

    /// Nodes left dirty once the queue ran dry.
    pub fn stuck_nodes(&self) -> Vec<NodeId> {
        self.journal
            .touched()
            .filter(|id| self.graph.get(*id).map(|n| n.is_dirty()).unwrap_or(false))
            .collect()
    }

    /// Failed nodes keep their old value and go back to clean.
    pub fn settle_failed(&mut self) {
        let touched: Vec<NodeId> = self.journal.touched().collect();
        for id in touched {
            if let Some(node) = self.graph.get_mut(id) {
                if node.dirty_state() == DirtyState::Failed {
                    node.mark_clean();
                }
            }
        }
    }

    /// Undo every change the running turn made to values, pulses and edges.
    ///
    /// Nodes created during the turn are removed again and handed back with
    /// their subscribers, to be dropped once the state is released. Levels
    /// are not lowered again; they are re-checked against the restored edges
    /// instead.
    pub fn rollback(&mut self) -> Vec<(Node, Vec<Subscriber>)> {
        self.queue.clear();
        let snapshots = std::mem::take(&mut self.journal.snapshots);
        let restored: Vec<NodeId> = snapshots.keys().copied().collect();

        for (id, snapshot) in snapshots {
            let current: Vec<NodeId> = match self.graph.get(id) {
                Some(node) => node.dependencies().iter().copied().collect(),
                None => continue,
            };
            for dep in current.iter().filter(|d| !snapshot.dependencies.contains(d)) {
                self.graph.remove_edge(*dep, id);
            }
            for dep in snapshot.dependencies.iter().filter(|d| !current.contains(d)) {
                self.graph.add_edge(*dep, id);
            }
            if let Some(node) = self.graph.get_mut(id) {
                node.replace_value(snapshot.value);
                node.set_pulsed(snapshot.pulsed);
                node.clear_pending();
                node.mark_clean();
            }
        }

        for id in restored {
            let required = self.graph.required_level(id);
            if let Err(nodes) = self.graph.raise_level(id, required) {
                tracing::error!(?nodes, "level repair after rollback found a cycle");
            }
        }

        let mut discarded = Vec::new();
        for id in std::mem::take(&mut self.journal.created) {
            if let Some(node) = self.graph.remove(id) {
                tracing::debug!(node = %id, "node created in rolled-back turn removed");
                discarded.push((node, self.subscribers.remove_node(id)));
            }
        }
        self.journal.changed.clear();
        self.journal.evaluated.clear();
        discarded
    }
}
