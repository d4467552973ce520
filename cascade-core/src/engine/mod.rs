//! Propagation Engine
//!
//! The engine owns the dependency graph and runs turns over it.
//!
//! # Overview
//!
//! External code talks to the graph through a handful of operations:
//!
//! - [`Engine::create`] (and the `create_*` shorthands) adds a node
//! - [`Engine::dispose_node`] removes one
//! - [`Engine::emit`] and [`Engine::batch`] feed stimuli to sources, each
//!   call running one turn
//! - [`Engine::subscribe`] attaches a callback that runs after every turn
//!   in which a node changed
//! - [`Engine::read`] returns a node's current value
//!
//! # Concurrency
//!
//! The engine state sits behind a reentrant lock. A call from another thread
//! blocks until the running turn, and every follow-up turn it drives, is
//! done. Calls made on the driving thread from inside an evaluator or a
//! callback are let through: reads, node creation and disposal,
//! subscriptions and edge changes apply right away, while `emit` and `batch`
//! are queued and run as the next turns.
//!
//! # Design Decisions
//!
//! 1. User code (evaluators, callbacks, dispose hooks) never runs while the
//!    state is borrowed. Evaluators and callbacks are taken out of the graph
//!    for the duration of the call and put back afterwards.
//!
//! 2. Turns are synchronous: `emit` returns once its turn has drained and
//!    notified.

mod context;
mod state;
mod subscriber;
mod turn;

pub use context::EvalContext;
pub use state::Phase;
pub use subscriber::{Subscription, SubscriptionId};
pub use turn::TurnReport;

pub(crate) use context::downcast_value;
pub(crate) use subscriber::{ChangeCallback, DisposeHook};

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

use self::context::EvalMode;
use self::state::EngineState;
use self::subscriber::Subscriber;
use crate::config::EngineConfig;
use crate::error::{EvalError, ReactError, Result, TurnError};
use crate::graph::{DependencyMode, Evaluator, Node, NodeId, NodeInfo, NodeKind, Pulse, Value};
use crate::reactive::{EventSource, Var};

pub(crate) struct Shared {
    pub(crate) state: ReentrantMutex<RefCell<EngineState>>,
    /// Subscriptions dropped while the state was borrowed. Removed after the
    /// running turn.
    orphaned: Mutex<Vec<SubscriptionId>>,
}

/// An external stimulus: a new value for a source node.
#[derive(Clone)]
pub struct Stimulus {
    pub node: NodeId,
    pub value: Value,
}

impl Stimulus {
    pub fn new<T>(node: NodeId, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            node,
            value: Arc::new(value),
        }
    }
}

impl fmt::Debug for Stimulus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stimulus").field("node", &self.node).finish()
    }
}

/// Simultaneous stimuli collected for one turn by [`Engine::batch`].
///
/// Emitting to the same source twice keeps the last value.
#[derive(Debug, Default)]
pub struct Batch {
    stimuli: Vec<Stimulus>,
}

impl Batch {
    pub fn emit(&mut self, node: NodeId, value: Value) -> &mut Self {
        self.stimuli.push(Stimulus { node, value });
        self
    }

    /// Set a var.
    pub fn set<T>(&mut self, var: &Var<T>, value: T) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.stimuli.push(Stimulus::new(var.id(), value));
        self
    }

    /// Fire an event source.
    pub fn fire<T>(&mut self, source: &EventSource<T>, value: T) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.stimuli.push(Stimulus::new(source.id(), value));
        self
    }

    pub fn len(&self) -> usize {
        self.stimuli.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimuli.is_empty()
    }
}

/// Description of a node to create.
pub struct NodeSpec {
    kind: NodeKind,
    mode: DependencyMode,
    evaluator: Option<Evaluator>,
    dependencies: Vec<NodeId>,
    initial: Option<Value>,
    label: Option<String>,
}

impl NodeSpec {
    fn derived<F>(kind: NodeKind, evaluator: F) -> Self
    where
        F: FnMut(&mut EvalContext<'_>) -> std::result::Result<Pulse, EvalError> + Send + 'static,
    {
        Self {
            kind,
            mode: DependencyMode::Static,
            evaluator: Some(Box::new(evaluator)),
            dependencies: Vec::new(),
            initial: None,
            label: None,
        }
    }

    /// A continuous derived node.
    pub fn signal<F>(evaluator: F) -> Self
    where
        F: FnMut(&mut EvalContext<'_>) -> std::result::Result<Pulse, EvalError> + Send + 'static,
    {
        Self::derived(NodeKind::Signal, evaluator)
    }

    /// A discrete derived node.
    pub fn events<F>(evaluator: F) -> Self
    where
        F: FnMut(&mut EvalContext<'_>) -> std::result::Result<Pulse, EvalError> + Send + 'static,
    {
        Self::derived(NodeKind::Events, evaluator)
    }

    /// A continuous source.
    pub fn var(initial: Option<Value>) -> Self {
        Self {
            kind: NodeKind::Var,
            mode: DependencyMode::Static,
            evaluator: None,
            dependencies: Vec::new(),
            initial,
            label: None,
        }
    }

    /// A discrete source.
    pub fn event_source() -> Self {
        Self {
            kind: NodeKind::EventSource,
            ..Self::var(None)
        }
    }

    /// Declare dependencies up front. They are registered before the first
    /// evaluation, so the node starts at the right level.
    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = NodeId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    /// Replace the dependency set with whatever each evaluation reads.
    pub fn dynamic(mut self) -> Self {
        self.mode = DependencyMode::Dynamic;
        self
    }

    /// Starting value, visible to the first evaluation through
    /// [`EvalContext::previous`].
    pub fn initial(mut self, value: Value) -> Self {
        self.initial = Some(value);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("dependencies", &self.dependencies)
            .field("label", &self.label)
            .finish()
    }
}

/// Handle to a propagation engine. Cloning shares the engine.
#[derive(Clone)]
pub struct Engine {
    pub(crate) shared: Arc<Shared>,
}

impl Engine {
    /// Create an engine with the default configuration.
    pub fn new() -> Self {
        Self::from_state(EngineState::new(EngineConfig::default()))
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_state(EngineState::new(config)))
    }

    fn from_state(state: EngineState) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: ReentrantMutex::new(RefCell::new(state)),
                orphaned: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Upgrade a handle's engine reference. Once every `Engine` is gone the
    /// handle's node is gone with it.
    pub(crate) fn upgrade(weak: &Weak<Shared>, node: NodeId) -> Result<Self> {
        weak.upgrade()
            .map(Self::from_shared)
            .ok_or(ReactError::DisposedNode(node))
    }

    pub fn config(&self) -> EngineConfig {
        self.shared.state.lock().borrow().config.clone()
    }

    // ---- Node lifecycle ----

    /// Create a node.
    ///
    /// Outside a turn a derived node evaluates once right away; if that
    /// evaluation fails the node is removed again and the error returned.
    /// Inside a turn the node is scheduled into it instead.
    pub fn create(&self, spec: NodeSpec) -> Result<NodeId> {
        let NodeSpec {
            kind,
            mode,
            evaluator,
            dependencies,
            initial,
            label,
        } = spec;
        let guard = self.shared.state.lock();

        let (id, mut evaluator) = {
            let mut state = guard.borrow_mut();
            if let Some(stale) = dependencies.iter().find(|d| !state.graph.contains(**d)) {
                return Err(ReactError::DisposedNode(*stale));
            }
            let node = match evaluator {
                None => Node::source(kind, initial),
                Some(evaluator) => Node::derived(kind, mode, evaluator).with_value(initial),
            };
            let id = state.graph.insert(node.with_label(label));
            for dependency in dependencies {
                state.graph.add_edge(dependency, id);
            }
            let level = state.graph.required_level(id);
            if let Some(node) = state.graph.get_mut(id) {
                node.set_level(level);
            }
            tracing::debug!(node = %id, ?kind, level, "node created");

            if kind.is_source() {
                return Ok(id);
            }
            if state.in_turn() {
                state.schedule_created(id);
                return Ok(id);
            }
            match state.graph.get_mut(id).and_then(|n| n.take_evaluator()) {
                Some(evaluator) => (id, evaluator),
                None => return Ok(id),
            }
        };

        let turn = guard.borrow().turn;
        let mut ctx = EvalContext::new(self, &guard, id, turn, EvalMode::Create);
        let result = evaluator(&mut ctx);
        let outcome = ctx.finish();

        let failure = match (result, outcome.fatal) {
            (_, Some(fatal)) => Some(fatal),
            (Err(err), None) => Some(into_react_error(id, err)),
            (Ok(pulse), None) => {
                let mut state = guard.borrow_mut();
                state.prune_unread(id, &outcome.reads);
                match state.graph.get_mut(id) {
                    Some(node) => {
                        node.restore_evaluator(evaluator);
                        node.mark_clean();
                        if let Pulse::Changed(value) = pulse {
                            if !kind.is_discrete() {
                                node.replace_value(Some(value));
                            }
                        }
                        return Ok(id);
                    }
                    None => Some(ReactError::DisposedNode(id)),
                }
            }
        };

        let removed = guard.borrow_mut().graph.remove(id);
        drop(removed);
        drop(evaluator);
        let err = failure.unwrap_or(ReactError::DisposedNode(id));
        tracing::warn!(node = %id, error = %err, "initial evaluation failed, node removed");
        Err(err)
    }

    /// Create a static continuous node over `dependencies`.
    pub fn create_node<F>(&self, evaluator: F, dependencies: &[NodeId]) -> Result<NodeId>
    where
        F: FnMut(&mut EvalContext<'_>) -> std::result::Result<Pulse, EvalError> + Send + 'static,
    {
        self.create(NodeSpec::signal(evaluator).depends_on(dependencies.iter().copied()))
    }

    /// Create a var holding `initial`.
    pub fn create_var<T>(&self, initial: T) -> NodeId
    where
        T: Any + Send + Sync,
    {
        self.insert_source(NodeKind::Var, Some(Arc::new(initial)))
    }

    pub fn create_event_source(&self) -> NodeId {
        self.insert_source(NodeKind::EventSource, None)
    }

    fn insert_source(&self, kind: NodeKind, initial: Option<Value>) -> NodeId {
        let guard = self.shared.state.lock();
        let id = guard.borrow_mut().graph.insert(Node::source(kind, initial));
        tracing::debug!(node = %id, ?kind, "node created");
        id
    }

    /// Remove a node with all of its edges and subscriptions.
    ///
    /// Returns `false` if the node was already gone. Dependents lose the edge
    /// but are otherwise untouched.
    pub fn dispose_node(&self, id: NodeId) -> bool {
        let guard = self.shared.state.lock();
        let (node, subscribers) = {
            let mut state = guard.borrow_mut();
            let Some(node) = state.graph.remove(id) else {
                return false;
            };
            state.queue.remove(id);
            let subscribers = state.subscribers.remove_node(id);
            (node, subscribers)
        };
        tracing::debug!(node = %id, subscribers = subscribers.len(), "node disposed");

        for subscriber in subscribers {
            if let Some(hook) = subscriber.on_dispose {
                hook();
            }
        }
        drop(node);
        drop(guard);
        self.reap_orphans();
        true
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.shared.state.lock().borrow().graph.contains(id)
    }

    // ---- Stimuli ----

    /// Emit a value to a source node and run the resulting turn.
    pub fn emit(&self, node: NodeId, value: Value) -> std::result::Result<TurnReport, TurnError> {
        self.drive(vec![Stimulus { node, value }])
    }

    /// Run one turn seeded with every stimulus `build` adds.
    pub fn batch<F>(&self, build: F) -> std::result::Result<TurnReport, TurnError>
    where
        F: FnOnce(&mut Batch),
    {
        let mut batch = Batch::default();
        build(&mut batch);
        self.drive(batch.stimuli)
    }

    // ---- Subscriptions ----

    /// Run `callback` with the node's value after every turn in which the
    /// node changed.
    pub fn subscribe<F>(&self, node: NodeId, callback: F) -> Result<Subscription>
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.subscribe_with_hooks(node, Box::new(callback), None)
    }

    /// Subscribe with an extra hook that runs if the node is disposed while
    /// the subscription is still registered.
    pub(crate) fn subscribe_with_hooks(
        &self,
        node: NodeId,
        on_change: ChangeCallback,
        on_dispose: Option<DisposeHook>,
    ) -> Result<Subscription> {
        self.reap_orphans();
        let guard = self.shared.state.lock();
        let mut subscriber = Some(Subscriber {
            node,
            since_turn: 0,
            on_change: Some(on_change),
            on_dispose,
        });
        let id = SubscriptionId::new();
        {
            let mut state = guard.borrow_mut();
            if state.graph.contains(node) {
                if let Some(mut subscriber) = subscriber.take() {
                    subscriber.since_turn = state.turn;
                    state.subscribers.insert(id, subscriber);
                }
            }
        }
        if subscriber.is_some() {
            drop(guard);
            drop(subscriber);
            return Err(ReactError::DisposedNode(node));
        }
        tracing::trace!(node = %node, subscription = ?id, "subscribed");
        Ok(Subscription::new(id, node, self.downgrade()))
    }

    /// Remove a subscription. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let guard = self.shared.state.lock();
        let removed = match guard.try_borrow_mut() {
            Ok(mut state) => state.subscribers.remove(id),
            Err(_) => {
                self.shared.orphaned.lock().push(id);
                return true;
            }
        };
        let found = removed.is_some();
        drop(removed);
        found
    }

    pub(crate) fn release_subscription(&self, id: SubscriptionId) {
        self.unsubscribe(id);
    }

    fn reap_orphans(&self) {
        let orphaned = std::mem::take(&mut *self.shared.orphaned.lock());
        if orphaned.is_empty() {
            return;
        }
        let guard = self.shared.state.lock();
        let removed: Vec<Subscriber> = match guard.try_borrow_mut() {
            Ok(mut state) => orphaned
                .iter()
                .filter_map(|id| state.subscribers.remove(*id))
                .collect(),
            Err(_) => {
                self.shared.orphaned.lock().extend(orphaned);
                return;
            }
        };
        drop(removed);
    }

    pub fn subscriber_count(&self, node: NodeId) -> usize {
        self.shared.state.lock().borrow().subscribers.count_for(node)
    }

    // ---- Reads and edges ----

    /// Current value of a node.
    ///
    /// During a turn, reading a node that has not settled yet is an ordering
    /// violation. It fails here and aborts the running turn.
    pub fn read(&self, id: NodeId) -> Result<Option<Value>> {
        let guard = self.shared.state.lock();
        let mut borrow = guard.borrow_mut();
        let state = &mut *borrow;
        let (level, dirty, value) = match state.graph.get(id) {
            Some(node) => (node.level(), node.is_dirty(), node.value().cloned()),
            None => return Err(ReactError::DisposedNode(id)),
        };
        if state.in_turn() {
            let reader_level = state
                .eval_stack
                .last()
                .filter(|reader| **reader != id)
                .and_then(|reader| state.graph.get(*reader))
                .map(|reader| reader.level());
            if dirty || reader_level.is_some_and(|reader| reader <= level) {
                let err = ReactError::OrderingViolation {
                    node: id,
                    turn: state.turn,
                };
                tracing::error!(node = %id, turn = state.turn, "read of unsettled node");
                state.journal.fatal.get_or_insert(err.clone());
                return Err(err);
            }
        }
        Ok(value)
    }

    /// Typed [`read`](Self::read).
    pub fn read_as<T>(&self, id: NodeId) -> Result<T>
    where
        T: Clone + 'static,
    {
        match self.read(id)? {
            Some(value) => downcast_value::<T>(id, &value),
            None => Err(ReactError::Uninitialized(id)),
        }
    }

    /// Register `dependent -> dependency` and lift the dependent (and its own
    /// dependents) above the dependency.
    ///
    /// Fails with `CycleDetected` if `dependency` already depends on
    /// `dependent`.
    pub fn connect(&self, dependency: NodeId, dependent: NodeId) -> Result<()> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        let dep_level = state
            .graph
            .get(dependency)
            .map(|n| n.level())
            .ok_or(ReactError::DisposedNode(dependency))?;
        if !state.graph.contains(dependent) {
            return Err(ReactError::DisposedNode(dependent));
        }
        if let Some(nodes) = state.graph.cycle_through(dependency, dependent) {
            tracing::error!(?nodes, "edge rejected, it would close a cycle");
            return Err(ReactError::CycleDetected { nodes });
        }
        state.touch(dependent);
        state.graph.add_edge(dependency, dependent);
        state.lift(dependent, dep_level + 1)
    }

    /// Remove an edge. Levels stay where they are.
    pub fn disconnect(&self, dependency: NodeId, dependent: NodeId) -> Result<bool> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        for id in [dependency, dependent] {
            if !state.graph.contains(id) {
                return Err(ReactError::DisposedNode(id));
            }
        }
        state.touch(dependent);
        Ok(state.graph.remove_edge(dependency, dependent))
    }

    // ---- Diagnostics ----

    pub fn inspect(&self, id: NodeId) -> Option<NodeInfo> {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.graph.get(id).map(|node| NodeInfo::capture(id, node))
    }

    pub fn node_count(&self) -> usize {
        self.shared.state.lock().borrow().graph.node_count()
    }

    /// Number of the running turn, or of the last completed one.
    pub fn current_turn(&self) -> u64 {
        self.shared.state.lock().borrow().turn
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().borrow().phase
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.state.lock();
        let mut debug = f.debug_struct("Engine");
        if let Ok(state) = guard.try_borrow() {
            debug
                .field("nodes", &state.graph.node_count())
                .field("subscriptions", &state.subscribers.len())
                .field("turn", &state.turn)
                .field("phase", &state.phase);
        }
        debug.finish_non_exhaustive()
    }
}

fn into_react_error(node: NodeId, err: EvalError) -> ReactError {
    match err {
        EvalError::Engine(err) => err,
        other => ReactError::Evaluator {
            node,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn int(value: &Value) -> i32 {
        *value.downcast_ref::<i32>().unwrap()
    }

    fn doubled(engine: &Engine, src: NodeId) -> NodeId {
        engine
            .create_node(
                move |ctx| {
                    let v: i32 = ctx.get(src)?;
                    Ok(Pulse::changed(v * 2))
                },
                &[src],
            )
            .unwrap()
    }

    #[test]
    fn derived_node_evaluates_on_creation() {
        let engine = Engine::new();
        let src = engine.create_var(21);
        let node = doubled(&engine, src);

        assert_eq!(engine.read_as::<i32>(node).unwrap(), 42);
        assert_eq!(engine.inspect(node).unwrap().level, 1);
    }

    #[test]
    fn emit_runs_a_turn() {
        let engine = Engine::new();
        let src = engine.create_var(1);
        let node = doubled(&engine, src);

        let report = engine.emit(src, Arc::new(5)).unwrap();
        assert_eq!(report.turn, 1);
        assert_eq!(report.evaluated, vec![src, node]);
        assert_eq!(report.changed, vec![src, node]);
        assert_eq!(engine.read_as::<i32>(node).unwrap(), 10);
    }

    #[test]
    fn subscription_fires_once_per_changing_turn() {
        let engine = Engine::new();
        let src = engine.create_var(1);
        let node = doubled(&engine, src);

        let seen = Arc::new(AtomicI32::new(0));
        let seen_clone = seen.clone();
        let sub = engine
            .subscribe(node, move |value| {
                seen_clone.store(int(value), Ordering::SeqCst);
            })
            .unwrap();

        engine.emit(src, Arc::new(4)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 8);

        assert!(sub.unsubscribe());
        engine.emit(src, Arc::new(7)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn dropping_a_subscription_unsubscribes() {
        let engine = Engine::new();
        let src = engine.create_var(0);
        let sub = engine.subscribe(src, |_| {}).unwrap();
        assert_eq!(engine.subscriber_count(src), 1);
        drop(sub);
        assert_eq!(engine.subscriber_count(src), 0);
    }

    #[test]
    fn failed_initial_evaluation_removes_the_node() {
        let engine = Engine::new();
        let src = engine.create_var(0);
        let before = engine.node_count();

        let err = engine
            .create_node(|_| Err(EvalError::failed("no")), &[src])
            .unwrap_err();
        assert!(matches!(err, ReactError::Evaluator { .. }));
        assert_eq!(engine.node_count(), before);
    }

    #[test]
    fn dispose_is_idempotent() {
        let engine = Engine::new();
        let src = engine.create_var(0);
        let node = doubled(&engine, src);

        assert!(engine.dispose_node(node));
        assert!(!engine.dispose_node(node));
        assert!(engine.inspect(src).unwrap().dependents.is_empty());
        assert_eq!(engine.read(node).unwrap_err(), ReactError::DisposedNode(node));
    }

    #[test]
    fn emit_to_a_derived_node_is_rejected() {
        let engine = Engine::new();
        let src = engine.create_var(0);
        let node = doubled(&engine, src);

        let err = engine.emit(node, Arc::new(1)).unwrap_err();
        assert_eq!(err.failures, vec![ReactError::NotASource(node)]);
    }

    #[test]
    fn connect_rejects_cycles() {
        let engine = Engine::new();
        let src = engine.create_var(0);
        let a = doubled(&engine, src);
        let b = doubled(&engine, a);

        let err = engine.connect(b, a).unwrap_err();
        assert!(matches!(err, ReactError::CycleDetected { .. }));
        assert!(!engine.inspect(a).unwrap().dependencies.contains(&b));
    }

    #[test]
    fn connect_lifts_the_dependent() {
        let engine = Engine::new();
        let src = engine.create_var(0);
        let a = doubled(&engine, src);
        let b = doubled(&engine, a);
        let other = engine.create_var(0);
        let c = doubled(&engine, other);

        engine.connect(b, c).unwrap();
        assert_eq!(engine.inspect(c).unwrap().level, 3);
        assert!(engine.disconnect(b, c).unwrap());
        assert!(!engine.disconnect(b, c).unwrap());
        assert_eq!(engine.inspect(c).unwrap().level, 3);
    }

    #[test]
    fn batch_keeps_the_last_value_per_source() {
        let engine = Engine::new();
        let src = engine.create_var(0);
        let node = doubled(&engine, src);

        let report = engine
            .batch(|b| {
                b.emit(src, Arc::new(1));
                b.emit(src, Arc::new(3));
            })
            .unwrap();
        assert_eq!(report.evaluated, vec![src, node]);
        assert_eq!(engine.read_as::<i32>(node).unwrap(), 6);
    }

    #[test]
    fn rollback_disposes_nodes_created_in_the_turn() {
        let engine = Engine::new();
        let src = engine.create_var(1);
        let peer = doubled(&engine, src);
        let hooks = Arc::new(AtomicI32::new(0));
        let hooks_in = hooks.clone();

        engine
            .create_node(
                move |ctx| {
                    let v: i32 = ctx.get(src)?;
                    if !ctx.is_initial() {
                        let engine = ctx.engine();
                        let child = doubled(engine, src);
                        let hooks = hooks_in.clone();
                        engine
                            .subscribe_with_hooks(
                                child,
                                Box::new(|_| {}),
                                Some(Box::new(move || {
                                    hooks.fetch_add(1, Ordering::SeqCst);
                                })),
                            )?
                            .detach();
                        engine.read(peer)?;
                    }
                    Ok(Pulse::changed(v))
                },
                &[src],
            )
            .unwrap();
        let before = engine.node_count();

        let err = engine.emit(src, Arc::new(2)).unwrap_err();
        assert!(err.rolled_back);
        assert_eq!(engine.node_count(), before);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(engine.read_as::<i32>(src).unwrap(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            max_deferrals_per_node: 0,
            ..EngineConfig::default()
        };
        assert!(Engine::with_config(config).is_err());
    }
}
