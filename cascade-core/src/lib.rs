//! Cascade Core
//!
//! This crate provides a glitch-free reactive dataflow engine. It implements:
//!
//! - A dependency graph of sources and derived nodes with dynamic rewiring
//! - Turn-based propagation in topological order, so no node ever observes
//!   a value that is not final for the turn
//! - Typed signals, event streams and combinators over the graph
//! - Flows, keyed routers and multi-turn reactors built on subscriptions
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: node storage, dependency edges, levels and the topological queue
//! - `engine`: the turn protocol and the public node/stimulus/subscription API
//! - `reactive`: typed handles (`Var`, `Signal`, `EventSource`, `Events`) and
//!   combinators
//! - `flow`, `router`, `reactor`: higher-level consumers of the engine
//! - `config`, `error`: configuration and error types
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_core::{Engine, Var};
//!
//! let engine = Engine::new();
//!
//! // Create a source
//! let count = Var::new(&engine, 0);
//!
//! // Create a derived value
//! let doubled = count.map(|n| n * 2)?;
//!
//! // Observe it
//! let _sub = doubled.observe(|n| println!("doubled: {n}"))?;
//!
//! // Update the source; one turn runs and prints "doubled: 10"
//! count.set(5)?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod graph;
pub mod reactive;
pub mod reactor;
pub mod router;

pub use config::{EngineConfig, RouterConfig};
pub use engine::{
    Batch, Engine, EvalContext, NodeSpec, Phase, Stimulus, Subscription, SubscriptionId,
    TurnReport,
};
pub use error::{EvalError, ReactError, Result, TurnError};
pub use flow::{Flow, TryNext};
pub use graph::{DependencyMode, DirtyState, NodeId, NodeInfo, NodeKind, Pulse, Value};
pub use reactive::{EventSource, Events, MergePolicy, Signal, Var};
pub use reactor::{Program, Reactor, ReactorHandle, ReactorState, Script, Step, Wake};
pub use router::Router;
