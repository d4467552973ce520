//! Evaluation Context
//!
//! The context handed to an evaluator while it runs. Every read goes through
//! it, which is how the engine learns a node's dependencies and how it keeps
//! a node from observing a value that has not settled yet.
//!
//! # Reading rules
//!
//! - Reading a node registers it as a dependency if it was not one already.
//! - If the dependency sits at or above the reader's level it may still change
//!   this turn. The reader is lifted above it and the evaluation is deferred:
//!   the read returns [`EvalError::Deferred`], the evaluator should bail out
//!   with `?`, and the scheduler runs it again once the dependency settled.
//! - A dependency below the reader's level is final for the turn, unless it
//!   is still queued (for example because it was created during the turn).
//!   Then the reader is deferred until it ran.
//!
//! The context also serves a node's very first evaluation at creation time,
//! outside any turn. There every node is clean, so a high dependency just
//! lifts the new node and the read succeeds.

use std::any::type_name;
use std::cell::RefCell;

use smallvec::SmallVec;

use super::state::EngineState;
use super::Engine;
use crate::error::{EvalError, ReactError};
use crate::graph::{NodeId, Pulse, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvalMode {
    /// Scheduled evaluation inside a turn.
    Turn,
    /// First evaluation while the node is created.
    Create,
}

/// What the scheduler needs to know after an evaluator returned.
pub(crate) struct EvalOutcome {
    pub reads: SmallVec<[NodeId; 4]>,
    pub deferred: Option<NodeId>,
    pub fatal: Option<ReactError>,
}

/// Dependency-tracking view of the engine for one evaluation.
pub struct EvalContext<'a> {
    engine: &'a Engine,
    state: &'a RefCell<EngineState>,
    node: NodeId,
    turn: u64,
    mode: EvalMode,
    reads: SmallVec<[NodeId; 4]>,
    deferred: Option<NodeId>,
    fatal: Option<ReactError>,
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        state: &'a RefCell<EngineState>,
        node: NodeId,
        turn: u64,
        mode: EvalMode,
    ) -> Self {
        Self {
            engine,
            state,
            node,
            turn,
            mode,
            reads: SmallVec::new(),
            deferred: None,
            fatal: None,
        }
    }

    pub(crate) fn finish(self) -> EvalOutcome {
        EvalOutcome {
            reads: self.reads,
            deferred: self.deferred,
            fatal: self.fatal,
        }
    }

    /// The node being evaluated.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The running turn (the last completed turn during creation).
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Whether this is the node's initial evaluation at creation time.
    pub fn is_initial(&self) -> bool {
        self.mode == EvalMode::Create
    }

    /// The engine, for creating or disposing nodes from inside an evaluator.
    pub fn engine(&self) -> &Engine {
        self.engine
    }

    /// Read the current value of `dep`, registering it as a dependency.
    ///
    /// For discrete nodes this is the last value they fired with, whether or
    /// not that happened in this turn.
    pub fn read(&mut self, dep: NodeId) -> Result<Value, EvalError> {
        let (value, _) = self.access(dep)?;
        value.ok_or_else(|| ReactError::Uninitialized(dep).into())
    }

    /// The value `dep` changed to in this turn, or `None` if it did not
    /// change. Registers `dep` as a dependency either way.
    pub fn event(&mut self, dep: NodeId) -> Result<Option<Value>, EvalError> {
        let (value, pulsed) = self.access(dep)?;
        Ok(if pulsed { value } else { None })
    }

    /// Typed [`read`](Self::read).
    pub fn get<T>(&mut self, dep: NodeId) -> Result<T, EvalError>
    where
        T: Clone + 'static,
    {
        let value = self.read(dep)?;
        downcast::<T>(dep, &value)
    }

    /// Typed [`event`](Self::event).
    pub fn get_event<T>(&mut self, dep: NodeId) -> Result<Option<T>, EvalError>
    where
        T: Clone + 'static,
    {
        match self.event(dep)? {
            Some(value) => downcast::<T>(dep, &value).map(Some),
            None => Ok(None),
        }
    }

    /// This node's own value from before the evaluation.
    pub fn previous(&self) -> Option<Value> {
        self.state
            .borrow()
            .graph
            .get(self.node)
            .and_then(|node| node.value().cloned())
    }

    /// Typed [`previous`](Self::previous).
    pub fn previous_as<T>(&self) -> Result<Option<T>, EvalError>
    where
        T: Clone + 'static,
    {
        match self.previous() {
            Some(value) => downcast::<T>(self.node, &value).map(Some),
            None => Ok(None),
        }
    }

    /// `Pulse::Changed(value)` unless `value` equals the previous value.
    pub fn changed_if_different<T>(&self, value: T) -> Pulse
    where
        T: PartialEq + Send + Sync + 'static,
    {
        let same = self
            .previous()
            .and_then(|prev| prev.downcast_ref::<T>().map(|prev| *prev == value))
            .unwrap_or(false);
        if same {
            Pulse::Unchanged
        } else {
            Pulse::changed(value)
        }
    }

    fn access(&mut self, dep: NodeId) -> Result<(Option<Value>, bool), EvalError> {
        if let Some(dep) = self.deferred {
            return Err(EvalError::Deferred(dep));
        }
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone().into());
        }

        let mut state = self.state.borrow_mut();
        let dep_level = state
            .graph
            .get(dep)
            .map(|node| node.level())
            .ok_or(ReactError::DisposedNode(dep))?;
        let (my_level, known) = state
            .graph
            .get(self.node)
            .map(|node| (node.level(), node.dependencies().contains(&dep)))
            .ok_or(ReactError::DisposedNode(self.node))?;

        if !known {
            if dep_level >= my_level {
                if let Some(nodes) = state.graph.cycle_through(dep, self.node) {
                    let err = ReactError::CycleDetected { nodes };
                    self.fatal = Some(err.clone());
                    return Err(err.into());
                }
            }
            state.touch(self.node);
            state.graph.add_edge(dep, self.node);
        }
        if !self.reads.contains(&dep) {
            self.reads.push(dep);
        }

        if dep_level >= my_level {
            if let Err(err) = state.lift(self.node, dep_level + 1) {
                self.fatal = Some(err.clone());
                return Err(err.into());
            }
            if self.mode == EvalMode::Turn {
                tracing::trace!(node = %self.node, dependency = %dep, "evaluation deferred");
                self.deferred = Some(dep);
                return Err(EvalError::Deferred(dep));
            }
        }

        let dep_dirty = state.graph.get(dep).is_some_and(|node| node.is_dirty());
        if self.mode == EvalMode::Turn && dep_dirty && state.queue.contains(dep) {
            // A dependency created or invalidated this turn that has not run
            // yet. It is below the reader, so the reader just waits for it.
            if let Err(err) = state.lift(self.node, my_level.max(dep_level + 1)) {
                self.fatal = Some(err.clone());
                return Err(err.into());
            }
            tracing::trace!(node = %self.node, dependency = %dep, "evaluation deferred");
            self.deferred = Some(dep);
            return Err(EvalError::Deferred(dep));
        }

        let Some(dep_node) = state.graph.get(dep) else {
            return Err(ReactError::DisposedNode(dep).into());
        };
        if self.mode == EvalMode::Turn && dep_node.is_dirty() {
            let err = ReactError::OrderingViolation {
                node: dep,
                turn: self.turn,
            };
            self.fatal = Some(err.clone());
            return Err(err.into());
        }
        let pulsed = self.mode == EvalMode::Turn && dep_node.pulsed_in(self.turn);
        Ok((dep_node.value().cloned(), pulsed))
    }
}

pub(crate) fn downcast<T>(node: NodeId, value: &Value) -> Result<T, EvalError>
where
    T: Clone + 'static,
{
    downcast_value::<T>(node, value).map_err(EvalError::from)
}

/// Downcast a type-erased value, reporting the expected type on mismatch.
pub(crate) fn downcast_value<T>(node: NodeId, value: &Value) -> Result<T, ReactError>
where
    T: Clone + 'static,
{
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or(ReactError::TypeMismatch {
            node,
            expected: type_name::<T>(),
        })
}
