//! Reactors
//!
//! A reactor runs a sequential process over several turns. The process is a
//! [`Program`]: a state machine that, each time it runs, either names the
//! nodes it wants to wait for or says it is done. The reactor subscribes to
//! those nodes and resumes the program after the first turn in which one of
//! them changes.
//!
//! # Turn discipline
//!
//! A resumption runs inside the notification phase of the turn that woke it
//! and must finish there. Anything it emits is queued for the next turn, and
//! the nodes it awaits next are only watched from the next turn on, so a
//! program can never be resumed twice in one turn.
//!
//! # Scripts
//!
//! Most processes are a fixed list of "wait for X, then do Y" steps.
//! [`Script`] builds such a program from a builder chain, keeping a program
//! counter and the caller's state.
//!
//! ```rust,ignore
//! let handle = Reactor::run(
//!     &engine,
//!     Script::new(Vec::new())
//!         .await_change(login.id())
//!         .then(|log, _, wake| { log.push("logged in"); Ok(()) })
//!         .await_change(logout.id())
//!         .then(|log, _, _| { log.push("logged out"); Ok(()) }),
//! )?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::engine::{downcast_value, Engine, Subscription};
use crate::error::{ReactError, Result};
use crate::graph::{NodeId, Value};

/// What a program wants to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Resume once any of these nodes changes.
    Await(Vec<NodeId>),
    Done,
}

/// The change that resumed a program.
#[derive(Debug, Clone, Copy)]
pub struct Wake<'a> {
    node: NodeId,
    value: &'a Value,
}

impl<'a> Wake<'a> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn value(&self) -> &'a Value {
        self.value
    }

    pub fn value_as<T>(&self) -> Result<T>
    where
        T: Clone + 'static,
    {
        downcast_value::<T>(self.node, self.value)
    }
}

/// A resumable sequential process.
pub trait Program: Send + 'static {
    /// Run up to the first await point.
    fn start(&mut self, engine: &Engine) -> Result<Step>;

    /// Run from the last await point to the next one.
    fn resume(&mut self, engine: &Engine, wake: Wake<'_>) -> Result<Step>;
}

/// Where a reactor is in its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorState {
    /// Suspended until one of `awaiting` changes.
    Waiting { awaiting: Vec<NodeId> },
    Finished,
    Cancelled,
    /// The program failed, or a node it waited on was disposed.
    Failed(ReactError),
}

impl ReactorState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReactorState::Waiting { .. })
    }
}

struct ReactorInner {
    engine: Engine,
    /// Taken out while the program runs.
    program: Mutex<Option<Box<dyn Program>>>,
    state: Mutex<ReactorState>,
    awaits: Mutex<Vec<Subscription>>,
    resumptions: AtomicU64,
}

impl ReactorInner {
    fn advance(self: &Arc<Self>, step: Result<Step>) {
        if self.state.lock().is_terminal() {
            return;
        }
        let nodes = match step {
            Ok(Step::Await(nodes)) if !nodes.is_empty() => nodes,
            Ok(Step::Await(_)) => {
                return self.finish(ReactorState::Failed(ReactError::Config(
                    "reactor awaited an empty set of nodes".into(),
                )))
            }
            Ok(Step::Done) => return self.finish(ReactorState::Finished),
            Err(err) => return self.finish(ReactorState::Failed(err)),
        };

        let mut subscriptions = Vec::with_capacity(nodes.len());
        for &node in &nodes {
            let on_change = {
                let weak = Arc::downgrade(self);
                move |value: &Value| {
                    if let Some(inner) = weak.upgrade() {
                        inner.wake(node, value);
                    }
                }
            };
            let on_dispose = {
                let weak: Weak<ReactorInner> = Arc::downgrade(self);
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.finish(ReactorState::Failed(ReactError::DisposedNode(node)));
                    }
                }
            };
            match self.engine.subscribe_with_hooks(
                node,
                Box::new(on_change),
                Some(Box::new(on_dispose)),
            ) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(err) => {
                    drop(subscriptions);
                    return self.finish(ReactorState::Failed(err));
                }
            }
        }
        tracing::trace!(awaiting = ?nodes, "reactor suspended");
        *self.awaits.lock() = subscriptions;
        *self.state.lock() = ReactorState::Waiting { awaiting: nodes };
    }

    fn wake(self: &Arc<Self>, node: NodeId, value: &Value) {
        if self.state.lock().is_terminal() {
            return;
        }
        let Some(mut program) = self.program.lock().take() else {
            return;
        };
        let awaits = std::mem::take(&mut *self.awaits.lock());
        drop(awaits);

        let count = self.resumptions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(node = %node, resumption = count, "reactor resumed");
        let step = program.resume(&self.engine, Wake { node, value });

        if !self.state.lock().is_terminal() {
            *self.program.lock() = Some(program);
        }
        self.advance(step);
    }

    /// Move to a terminal state and release the program and its awaits.
    fn finish(&self, state: ReactorState) {
        {
            let mut current = self.state.lock();
            if current.is_terminal() {
                return;
            }
            match &state {
                ReactorState::Failed(err) => tracing::warn!(error = %err, "reactor failed"),
                other => tracing::debug!(state = ?other, "reactor stopped"),
            }
            *current = state;
        }
        let program = self.program.lock().take();
        let awaits = std::mem::take(&mut *self.awaits.lock());
        drop(awaits);
        drop(program);
    }
}

/// Entry point for running programs.
pub struct Reactor;

impl Reactor {
    /// Start `program` and return a handle to it.
    ///
    /// The program runs up to its first await point before this returns.
    /// Dropping the handle stops the reactor.
    pub fn run<P>(engine: &Engine, mut program: P) -> Result<ReactorHandle>
    where
        P: Program,
    {
        let step = program.start(engine)?;
        let inner = Arc::new(ReactorInner {
            engine: engine.clone(),
            program: Mutex::new(Some(Box::new(program))),
            state: Mutex::new(ReactorState::Waiting {
                awaiting: Vec::new(),
            }),
            awaits: Mutex::new(Vec::new()),
            resumptions: AtomicU64::new(0),
        });
        inner.advance(Ok(step));
        if let ReactorState::Failed(err) = inner.state.lock().clone() {
            return Err(err);
        }
        Ok(ReactorHandle { inner })
    }
}

/// Handle to a running reactor.
pub struct ReactorHandle {
    inner: Arc<ReactorInner>,
}

impl ReactorHandle {
    pub fn state(&self) -> ReactorState {
        self.inner.state.lock().clone()
    }

    /// Cancel the reactor. Its awaits are dropped and it never resumes
    /// again. No effect once the reactor reached a terminal state.
    pub fn stop(&self) {
        self.inner.finish(ReactorState::Cancelled);
    }

    /// How many times the program has been resumed.
    pub fn resumptions(&self) -> u64 {
        self.inner.resumptions.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.state.lock() == ReactorState::Finished
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        self.inner.finish(ReactorState::Cancelled);
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("state", &self.state())
            .field("resumptions", &self.resumptions())
            .finish()
    }
}

type Action<S> = Box<dyn FnMut(&mut S, &Engine, Option<&Wake<'_>>) -> Result<()> + Send>;

enum ScriptStep<S> {
    Await(Vec<NodeId>),
    Then(Action<S>),
}

/// A [`Program`] written as a linear list of await points and actions.
///
/// Actions see the state, the engine and the change that woke the script
/// (`None` for actions before the first await).
pub struct Script<S> {
    state: S,
    steps: Vec<ScriptStep<S>>,
    pc: usize,
    repeat: bool,
}

impl<S> Script<S>
where
    S: Send + 'static,
{
    pub fn new(state: S) -> Self {
        Self {
            state,
            steps: Vec::new(),
            pc: 0,
            repeat: false,
        }
    }

    /// Wait until `node` changes.
    pub fn await_change(self, node: NodeId) -> Self {
        self.await_any([node])
    }

    /// Wait until any of `nodes` changes.
    pub fn await_any(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.steps.push(ScriptStep::Await(nodes.into_iter().collect()));
        self
    }

    pub fn then<F>(mut self, action: F) -> Self
    where
        F: FnMut(&mut S, &Engine, Option<&Wake<'_>>) -> Result<()> + Send + 'static,
    {
        self.steps.push(ScriptStep::Then(Box::new(action)));
        self
    }

    /// Start over from the first step after the last one. Ignored for
    /// scripts without an await step, which would otherwise never yield.
    pub fn repeat(mut self) -> Self {
        self.repeat = true;
        self
    }

    fn run(&mut self, engine: &Engine, wake: Option<&Wake<'_>>) -> Result<Step> {
        let loops = self.repeat && self.steps.iter().any(|s| matches!(s, ScriptStep::Await(_)));
        loop {
            if self.pc == self.steps.len() {
                if !loops {
                    return Ok(Step::Done);
                }
                self.pc = 0;
            }
            let pc = self.pc;
            self.pc += 1;
            match &mut self.steps[pc] {
                ScriptStep::Await(nodes) => return Ok(Step::Await(nodes.clone())),
                ScriptStep::Then(action) => action(&mut self.state, engine, wake)?,
            }
        }
    }
}

impl<S> Program for Script<S>
where
    S: Send + 'static,
{
    fn start(&mut self, engine: &Engine) -> Result<Step> {
        self.run(engine, None)
    }

    fn resume(&mut self, engine: &Engine, wake: Wake<'_>) -> Result<Step> {
        self.run(engine, Some(&wake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{EventSource, Var};
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: &str) -> Action<()> {
        let log = log.clone();
        let entry = entry.to_string();
        Box::new(move |_, _, _| {
            log.lock().push(entry.clone());
            Ok(())
        })
    }

    #[test]
    fn awaits_run_in_order() {
        let engine = Engine::new();
        let a = EventSource::<u8>::new(&engine);
        let b = EventSource::<u8>::new(&engine);
        let log: Log = Arc::default();

        let handle = Reactor::run(
            &engine,
            Script::new(())
                .then(record(&log, "start"))
                .await_change(a.id())
                .then(record(&log, "a"))
                .await_change(b.id())
                .then(record(&log, "b")),
        )
        .unwrap();
        assert_eq!(handle.state(), ReactorState::Waiting { awaiting: vec![a.id()] });

        b.fire(1).unwrap();
        assert_eq!(*log.lock(), vec!["start"]);
        a.fire(1).unwrap();
        b.fire(2).unwrap();
        assert_eq!(*log.lock(), vec!["start", "a", "b"]);
        assert!(handle.is_finished());
        assert_eq!(handle.resumptions(), 2);
        assert_eq!(engine.subscriber_count(b.id()), 0);
    }

    #[test]
    fn one_turn_resumes_once() {
        let engine = Engine::new();
        let a = EventSource::<u8>::new(&engine);
        let b = EventSource::<u8>::new(&engine);
        let handle = Reactor::run(
            &engine,
            Script::new(()).await_any([a.id(), b.id()]).repeat(),
        )
        .unwrap();

        engine
            .batch(|batch| {
                batch.fire(&a, 1).fire(&b, 2);
            })
            .unwrap();
        assert_eq!(handle.resumptions(), 1);
    }

    #[test]
    fn stop_cancels_pending_awaits() {
        let engine = Engine::new();
        let a = EventSource::<u8>::new(&engine);
        let log: Log = Arc::default();
        let handle = Reactor::run(
            &engine,
            Script::new(()).await_change(a.id()).then(record(&log, "a")),
        )
        .unwrap();

        handle.stop();
        a.fire(1).unwrap();
        assert_eq!(handle.state(), ReactorState::Cancelled);
        assert!(log.lock().is_empty());
        assert_eq!(engine.subscriber_count(a.id()), 0);
    }

    #[test]
    fn repeat_loops_over_the_steps() {
        let engine = Engine::new();
        let ticks = EventSource::<u32>::new(&engine);
        let total = Arc::new(AtomicUsize::new(0));
        let handle = Reactor::run(
            &engine,
            Script::new(total.clone())
                .await_change(ticks.id())
                .then(|total, _, wake| {
                    let n = wake.map(|w| w.value_as::<u32>()).transpose()?.unwrap_or(0);
                    total.fetch_add(n as usize, Ordering::SeqCst);
                    Ok(())
                })
                .repeat(),
        )
        .unwrap();

        for n in 1..=4 {
            ticks.fire(n).unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 10);
        assert_eq!(handle.resumptions(), 4);
        assert!(!handle.state().is_terminal());
    }

    #[test]
    fn disposing_an_awaited_node_fails_the_reactor() {
        let engine = Engine::new();
        let a = EventSource::<u8>::new(&engine);
        let handle = Reactor::run(&engine, Script::new(()).await_change(a.id())).unwrap();

        a.dispose();
        assert_eq!(
            handle.state(),
            ReactorState::Failed(ReactError::DisposedNode(a.id()))
        );
    }

    struct Countdown {
        source: NodeId,
        remaining: u32,
    }

    impl Program for Countdown {
        fn start(&mut self, _engine: &Engine) -> Result<Step> {
            Ok(Step::Await(vec![self.source]))
        }

        fn resume(&mut self, _engine: &Engine, wake: Wake<'_>) -> Result<Step> {
            self.remaining = self.remaining.saturating_sub(wake.value_as::<u32>()?);
            Ok(if self.remaining == 0 {
                Step::Done
            } else {
                Step::Await(vec![self.source])
            })
        }
    }

    #[test]
    fn hand_written_programs() {
        let engine = Engine::new();
        let var = Var::new(&engine, 0u32);
        let handle = Reactor::run(
            &engine,
            Countdown {
                source: var.id(),
                remaining: 5,
            },
        )
        .unwrap();

        var.set(2).unwrap();
        assert!(!handle.is_finished());
        var.set(3).unwrap();
        assert!(handle.is_finished());
    }

    #[test]
    fn resumption_emits_run_in_the_next_turn() {
        let engine = Engine::new();
        let ping = EventSource::<u8>::new(&engine);
        let pong = EventSource::<u8>::new(&engine);
        let pong_handle = pong.clone();
        let _handle = Reactor::run(
            &engine,
            Script::new(())
                .await_change(ping.id())
                .then(move |_, _, _| {
                    let report = pong_handle.fire(9).map_err(|e| e.failures[0].clone())?;
                    assert!(report.is_queued());
                    Ok(())
                }),
        )
        .unwrap();

        let report = ping.fire(1).unwrap();
        assert_eq!(report.followup_turns, 1);
        assert_eq!(pong.last().unwrap(), Some(9));
    }

    #[test]
    fn awaiting_a_disposed_node_fails_to_start() {
        let engine = Engine::new();
        let a = EventSource::<u8>::new(&engine);
        a.dispose();
        let err = Reactor::run(&engine, Script::new(()).await_change(a.id())).unwrap_err();
        assert_eq!(err, ReactError::DisposedNode(a.id()));
    }
}
