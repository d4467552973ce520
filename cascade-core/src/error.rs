//! Error types for the engine, evaluators and turns.

use std::fmt;

use thiserror::Error;

use crate::engine::TurnReport;
use crate::graph::NodeId;

/// Errors reported by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactError {
    /// A node was read before it settled in the running turn.
    #[error("ordering violation: node {node} read before it settled in turn {turn}")]
    OrderingViolation { node: NodeId, turn: u64 },

    /// A dependency cycle. Fatal for the turn that ran into it.
    #[error("dependency cycle detected through nodes {}", format_ids(.nodes))]
    CycleDetected { nodes: Vec<NodeId> },

    /// The node has been disposed; its id is stale.
    #[error("node {0} has been disposed")]
    DisposedNode(NodeId),

    /// An evaluator reported a domain failure.
    #[error("evaluator of node {node} failed: {message}")]
    Evaluator { node: NodeId, message: String },

    /// Stimuli can only be emitted to source nodes.
    #[error("node {0} is not a source and cannot receive stimuli")]
    NotASource(NodeId),

    /// A typed handle found a value of another type in the node.
    #[error("node {node} does not hold a value of type {expected}")]
    TypeMismatch { node: NodeId, expected: &'static str },

    /// The node has not produced a value yet.
    #[error("node {0} has no value yet")]
    Uninitialized(NodeId),

    /// A handle from one engine was combined with nodes of another.
    #[error("node {0} belongs to a different engine")]
    ForeignNode(NodeId),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReactError {
    /// The node the error is about, when there is a single one.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            ReactError::OrderingViolation { node, .. }
            | ReactError::Evaluator { node, .. }
            | ReactError::TypeMismatch { node, .. } => Some(*node),
            ReactError::DisposedNode(node)
            | ReactError::NotASource(node)
            | ReactError::Uninitialized(node)
            | ReactError::ForeignNode(node) => Some(*node),
            ReactError::CycleDetected { .. } | ReactError::Config(_) => None,
        }
    }

    /// Fatal errors abort the turn they occur in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReactError::OrderingViolation { .. } | ReactError::CycleDetected { .. }
        )
    }
}

fn format_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(NodeId::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors an evaluator returns to the scheduler.
///
/// Evaluators normally produce these through `?` on
/// [`EvalContext`](crate::engine::EvalContext) reads; a domain failure is
/// built with [`EvalError::failed`].
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// A dependency has not settled yet. The scheduler re-levels the node and
    /// runs it again later in the same turn.
    #[error("evaluation deferred until node {0} settles")]
    Deferred(NodeId),

    #[error(transparent)]
    Engine(#[from] ReactError),

    #[error("{0}")]
    Failed(String),
}

impl EvalError {
    pub fn failed(message: impl fmt::Display) -> Self {
        EvalError::Failed(message.to_string())
    }
}

/// Every failure encountered while driving one or more turns.
///
/// Partial progress is kept: nodes that converged stay updated. The only
/// exception is a cycle, which rolls the whole turn back.
#[derive(Debug, Clone, Error)]
#[error("turn {turn} finished with {} failure(s): {}", .failures.len(), format_failures(.failures))]
pub struct TurnError {
    /// The first turn driven by the call that failed.
    pub turn: u64,
    pub failures: Vec<ReactError>,
    /// What did converge.
    pub report: TurnReport,
    /// Whether a turn was rolled back to its pre-turn state.
    pub rolled_back: bool,
}

impl TurnError {
    /// Nodes whose evaluators failed.
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.failures
            .iter()
            .filter_map(|failure| match failure {
                ReactError::Evaluator { node, .. } => Some(*node),
                _ => None,
            })
            .collect()
    }

    pub fn has_cycle(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| matches!(failure, ReactError::CycleDetected { .. }))
    }
}

impl From<ReactError> for TurnError {
    /// A call rejected before any turn ran.
    fn from(err: ReactError) -> Self {
        TurnError {
            turn: 0,
            failures: vec![err],
            report: TurnReport::default(),
            rolled_back: false,
        }
    }
}

fn format_failures(failures: &[ReactError]) -> String {
    failures
        .iter()
        .map(ReactError::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ReactError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_nodes() {
        let err = ReactError::CycleDetected {
            nodes: vec![NodeId::new(1, 0), NodeId::new(2, 0)],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected through nodes #1.0 -> #2.0"
        );
        assert!(err.is_fatal());
        assert_eq!(err.node(), None);
    }

    #[test]
    fn eval_error_wraps_engine_errors() {
        let node = NodeId::new(3, 1);
        let err: EvalError = ReactError::DisposedNode(node).into();
        assert_eq!(err.to_string(), "node #3.1 has been disposed");
        assert!(matches!(EvalError::failed("boom"), EvalError::Failed(m) if m == "boom"));
    }

    #[test]
    fn turn_error_collects_failed_nodes() {
        let a = NodeId::new(0, 0);
        let err = TurnError {
            turn: 4,
            failures: vec![
                ReactError::Evaluator {
                    node: a,
                    message: "bad input".into(),
                },
                ReactError::DisposedNode(NodeId::new(9, 0)),
            ],
            report: TurnReport::default(),
            rolled_back: false,
        };
        assert_eq!(err.failed_nodes(), vec![a]);
        assert!(!err.has_cycle());
        assert!(err.to_string().starts_with("turn 4 finished with 2 failure(s)"));
    }
}
