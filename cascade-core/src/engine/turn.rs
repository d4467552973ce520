//! Turn Execution
//!
//! A turn is one glitch-free propagation pass:
//!
//! 1. **Seed**: each stimulus gives its source a pending value and queues
//!    the source at its level.
//! 2. **Drain**: repeatedly take the lowest-level node off the queue. If its
//!    dependencies demand a higher level, lift it and queue it again.
//!    Otherwise evaluate it. Sources commit their pending value; derived
//!    nodes run their evaluator, which may discover new dependencies and be
//!    deferred. A node that changed marks its dependents dirty and queues
//!    them.
//! 3. **Complete**: once the queue is empty no node may be dirty. A dirty
//!    node at this point, or a cycle found while draining, aborts the turn
//!    and rolls it back.
//! 4. **Notify**: subscription callbacks of every changed node run, in
//!    evaluation order.
//!
//! Stimuli raised while a turn is running (from evaluators or callbacks) are
//! queued and become the following turns of the same call.

use std::cell::RefCell;

use super::context::{EvalContext, EvalMode, EvalOutcome};
use super::state::{EngineState, NextStep, Phase};
use super::{Engine, Stimulus};
use crate::error::{EvalError, ReactError, TurnError};
use crate::graph::{DependencyMode, Evaluator, NodeId, Pulse};

/// What a successful call to `emit` or `batch` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnReport {
    /// Number of the turn started by the call. Zero when the stimuli were
    /// queued behind the running turn.
    pub turn: u64,

    /// The stimuli were queued behind a running turn and will be processed
    /// by the caller driving that turn.
    pub queued: bool,

    /// Nodes that evaluated, in order.
    pub evaluated: Vec<NodeId>,

    /// Nodes whose value changed, in order.
    pub changed: Vec<NodeId>,

    /// Turns driven after the first one, for stimuli raised during it.
    pub followup_turns: usize,
}

impl TurnReport {
    pub(crate) fn queued() -> Self {
        Self {
            queued: true,
            ..Self::default()
        }
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    /// Whether `node` evaluated in the reported turn.
    pub fn evaluated_node(&self, node: NodeId) -> bool {
        self.evaluated.contains(&node)
    }
}

struct TurnOutcome {
    report: TurnReport,
    failures: Vec<ReactError>,
    rolled_back: bool,
}

impl Engine {
    /// Run `stimuli` as a turn, plus every turn queued while it runs.
    pub(crate) fn drive(&self, stimuli: Vec<Stimulus>) -> Result<TurnReport, TurnError> {
        let guard = self.shared.state.lock();
        {
            let mut state = guard.borrow_mut();
            if state.phase != Phase::Idle {
                tracing::trace!(turn = state.turn, "stimuli queued behind running turn");
                state.pending.push_back(stimuli);
                return Ok(TurnReport::queued());
            }
            state.pending.push_back(stimuli);
        }

        let mut report: Option<TurnReport> = None;
        let mut failures = Vec::new();
        let mut failed_turn = None;
        let mut rolled_back = false;
        let mut followups = 0;

        loop {
            let next = guard.borrow_mut().pending.pop_front();
            let Some(stimuli) = next else {
                break;
            };
            let outcome = self.run_turn(&guard, stimuli);
            if !outcome.failures.is_empty() && failed_turn.is_none() {
                failed_turn = Some(outcome.report.turn);
            }
            failures.extend(outcome.failures);
            rolled_back |= outcome.rolled_back;
            if report.is_none() {
                report = Some(outcome.report);
            } else {
                followups += 1;
            }
        }
        drop(guard);
        self.reap_orphans();

        let mut report = report.unwrap_or_default();
        report.followup_turns = followups;
        match failed_turn {
            None => Ok(report),
            Some(turn) => Err(TurnError {
                turn,
                failures,
                report,
                rolled_back,
            }),
        }
    }

    fn run_turn(&self, cell: &RefCell<EngineState>, stimuli: Vec<Stimulus>) -> TurnOutcome {
        let turn = {
            let mut state = cell.borrow_mut();
            let turn = state.begin_turn();
            tracing::debug!(turn, stimuli = stimuli.len(), "turn started");
            for stimulus in stimuli {
                state.seed(stimulus);
            }
            turn
        };

        let fatal = self.drain(cell, turn);

        let mut state = cell.borrow_mut();
        let fatal = fatal.or_else(|| state.journal.fatal.take()).or_else(|| {
            let stuck = state.stuck_nodes();
            (!stuck.is_empty()).then_some(ReactError::CycleDetected { nodes: stuck })
        });

        if let Some(err) = fatal {
            tracing::error!(turn, error = %err, "turn aborted, rolling back");
            let discarded = state.rollback();
            state.eval_stack.clear();
            state.phase = Phase::Idle;
            let mut failures = std::mem::take(&mut state.journal.failures);
            failures.push(err);
            drop(state);
            for (node, subscribers) in discarded {
                for hook in subscribers.into_iter().filter_map(|s| s.on_dispose) {
                    hook();
                }
                drop(node);
            }
            return TurnOutcome {
                report: TurnReport {
                    turn,
                    ..TurnReport::default()
                },
                failures,
                rolled_back: true,
            };
        }

        state.settle_failed();
        state.phase = Phase::Notifying;
        let report = TurnReport {
            turn,
            queued: false,
            evaluated: std::mem::take(&mut state.journal.evaluated),
            changed: std::mem::take(&mut state.journal.changed),
            followup_turns: 0,
        };
        let failures = std::mem::take(&mut state.journal.failures);
        drop(state);

        self.notify(cell, turn, &report.changed);

        cell.borrow_mut().phase = Phase::Idle;
        tracing::debug!(
            turn,
            evaluated = report.evaluated.len(),
            changed = report.changed.len(),
            failures = failures.len(),
            "turn finished"
        );
        TurnOutcome {
            report,
            failures,
            rolled_back: false,
        }
    }

    /// The drain loop. Returns the fatal error that stopped it, if any.
    fn drain(&self, cell: &RefCell<EngineState>, turn: u64) -> Option<ReactError> {
        loop {
            let step = cell.borrow_mut().next_step(turn);
            match step {
                NextStep::Done => return None,
                NextStep::Continue => continue,
                NextStep::Fatal(err) => return Some(err),
                NextStep::Evaluate {
                    node,
                    mut evaluator,
                } => {
                    let mut ctx = EvalContext::new(self, cell, node, turn, EvalMode::Turn);
                    let result = evaluator(&mut ctx);
                    let outcome = ctx.finish();
                    let leftover = {
                        let mut state = cell.borrow_mut();
                        state.finish_evaluation(node, evaluator, result, outcome, turn)
                    };
                    match leftover {
                        Ok(None) => {}
                        Ok(Some(dropped)) => drop(dropped),
                        Err(fatal) => return Some(fatal),
                    }
                }
            }
        }
    }

    /// Run the callbacks of every node that changed in `turn`.
    fn notify(&self, cell: &RefCell<EngineState>, turn: u64, changed: &[NodeId]) {
        for &node in changed {
            let due = cell.borrow().subscribers.due(node, turn);
            for id in due {
                let taken = {
                    let mut state = cell.borrow_mut();
                    match state.graph.get(node).and_then(|n| n.value().cloned()) {
                        Some(value) => state.subscribers.take_callback(id).map(|cb| (value, cb)),
                        None => None,
                    }
                };
                let Some((value, mut callback)) = taken else {
                    continue;
                };
                callback(&value);
                let leftover = cell.borrow_mut().subscribers.restore_callback(id, callback);
                drop(leftover);
            }
        }
    }
}

impl EngineState {
    /// Record the result of one evaluator run.
    ///
    /// Hands the evaluator back when its node was disposed while it ran, so
    /// it is dropped with the state released.
    pub(crate) fn finish_evaluation(
        &mut self,
        id: NodeId,
        evaluator: Evaluator,
        result: Result<Pulse, EvalError>,
        outcome: EvalOutcome,
        turn: u64,
    ) -> Result<Option<Evaluator>, ReactError> {
        self.eval_stack.pop();
        let Some(node) = self.graph.get_mut(id) else {
            return Ok(Some(evaluator));
        };
        node.restore_evaluator(evaluator);

        if let Some(fatal) = outcome.fatal.or_else(|| self.journal.fatal.take()) {
            return Err(fatal);
        }
        let deferred = outcome.deferred.or(match &result {
            Err(EvalError::Deferred(dep)) => Some(*dep),
            _ => None,
        });
        if let Some(dep) = deferred {
            self.note_deferral(id, dep)?;
            if let Some(level) = self.graph.get(id).map(|n| n.level()) {
                self.queue.insert(id, level);
            }
            return Ok(None);
        }

        match result {
            Ok(pulse) => {
                if self.config.trace_evaluations {
                    tracing::trace!(turn, node = %id, changed = pulse.is_changed(), "evaluated");
                }
                self.prune_unread(id, &outcome.reads);
                self.journal.evaluated.push(id);
                if let Some(node) = self.graph.get_mut(id) {
                    node.mark_clean();
                    if let Pulse::Changed(value) = pulse {
                        node.replace_value(Some(value));
                        node.set_pulsed(Some(turn));
                        self.propagate(id);
                    }
                }
                Ok(None)
            }
            Err(err) => {
                if let EvalError::Engine(engine_err) = &err {
                    if engine_err.is_fatal() {
                        return Err(engine_err.clone());
                    }
                }
                tracing::warn!(turn, node = %id, error = %err, "evaluator failed");
                if let Some(node) = self.graph.get_mut(id) {
                    node.mark_failed();
                }
                self.journal.failures.push(ReactError::Evaluator {
                    node: id,
                    message: err.to_string(),
                });
                Ok(None)
            }
        }
    }

    /// Dynamic nodes drop the dependencies they did not read this time.
    pub(crate) fn prune_unread(&mut self, id: NodeId, reads: &[NodeId]) {
        let stale: Vec<NodeId> = match self.graph.get(id) {
            Some(node) if node.mode() == DependencyMode::Dynamic => node
                .dependencies()
                .iter()
                .filter(|dep| !reads.contains(dep))
                .copied()
                .collect(),
            _ => return,
        };
        if !stale.is_empty() {
            self.touch(id);
        }
        for dep in stale {
            self.graph.remove_edge(dep, id);
        }
    }
}
