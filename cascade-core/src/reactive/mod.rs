//! Reactive Primitives
//!
//! Typed handles over engine nodes and the combinators that build new ones.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a continuous value: it always holds one, and it changes
//! only in the turns one of its inputs changed. A [`Var`] is the source
//! flavour, set from outside the graph.
//!
//! ## Events
//!
//! An [`Events`] stream is discrete: it carries a value only in the turns it
//! fires. An [`EventSource`] is fired from outside the graph.
//!
//! ## Combinators
//!
//! Combinators (`map`, `filter`, `merge`, `fold`, `snapshot`, ...) each
//! create one node wired to their inputs. They only use public engine
//! operations, so user code can build its own the same way through
//! [`Engine::create`](crate::engine::Engine::create).
//!
//! # Implementation Notes
//!
//! Handles are thin: a node id plus a weak reference to the engine. Dropping
//! a handle does not dispose its node; call `dispose` for that. Dropping the
//! last [`Engine`](crate::engine::Engine) releases every node, including the
//! evaluators that captured handles.

mod combinators;
mod events;
mod signal;

pub use combinators::{
    combine, flatten, fold, hold, map2, merge, merge_with, snapshot, MergePolicy,
};
pub use events::{EventSource, Events};
pub use signal::{Signal, Var};
