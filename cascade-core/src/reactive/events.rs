//! Event Stream Handles
//!
//! Typed handles over discrete nodes. An event stream only carries a value
//! in the turns it fires; evaluators that read it in any other turn see
//! nothing.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::engine::{downcast_value, Engine, EvalContext, Shared, Subscription, TurnReport};
use crate::error::{EvalError, Result, TurnError};
use crate::graph::{NodeId, NodeInfo};

/// A discrete stream of values of type `T`.
pub struct Events<T> {
    id: NodeId,
    engine: Weak<Shared>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Events<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_node(engine: &Engine, id: NodeId) -> Self {
        Self {
            id,
            engine: engine.downgrade(),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The engine this stream belongs to, if it is still alive.
    pub fn engine(&self) -> Result<Engine> {
        Engine::upgrade(&self.engine, self.id)
    }

    /// The value this stream fired with most recently, in any turn.
    pub fn last(&self) -> Result<Option<T>> {
        match self.engine()?.read(self.id)? {
            Some(value) => downcast_value::<T>(self.id, &value).map(Some),
            None => Ok(None),
        }
    }

    /// The value fired in the running turn, if any. Registers this stream as
    /// a dependency of the node being evaluated.
    pub fn track(&self, ctx: &mut EvalContext<'_>) -> std::result::Result<Option<T>, EvalError> {
        ctx.get_event::<T>(self.id)
    }

    /// Run `callback` with every value the stream fires.
    pub fn observe<F>(&self, mut callback: F) -> Result<Subscription>
    where
        F: FnMut(T) + Send + 'static,
    {
        let id = self.id;
        self.engine()?.subscribe(id, move |value| match downcast_value::<T>(id, value) {
            Ok(value) => callback(value),
            Err(err) => tracing::warn!(node = %id, error = %err, "observer skipped"),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.engine().is_ok_and(|engine| engine.is_alive(self.id))
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.engine().ok()?.inspect(self.id)
    }

    pub fn dispose(&self) -> bool {
        self.engine().is_ok_and(|engine| engine.dispose_node(self.id))
    }
}

impl<T> Clone for Events<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            engine: self.engine.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Events<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.engine, &other.engine)
    }
}

impl<T> fmt::Debug for Events<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Events").field(&self.id).finish()
    }
}

/// A discrete source: an event stream fired from outside the graph.
pub struct EventSource<T> {
    events: Events<T>,
}

impl<T> EventSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(engine: &Engine) -> Self {
        Self {
            events: Events::from_node(engine, engine.create_event_source()),
        }
    }

    /// Fire the source and run the resulting turn.
    pub fn fire(&self, value: T) -> std::result::Result<TurnReport, TurnError> {
        self.events.engine()?.emit(self.events.id, Arc::new(value))
    }

    /// This source as a plain event stream handle.
    pub fn as_events(&self) -> Events<T> {
        self.events.clone()
    }
}

impl<T> Deref for EventSource<T> {
    type Target = Events<T>;

    fn deref(&self) -> &Events<T> {
        &self.events
    }
}

impl<T> Clone for EventSource<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<T> fmt::Debug for EventSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSource").field(&self.events.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReactError;
    use parking_lot::Mutex;

    #[test]
    fn fire_reaches_observers() {
        let engine = Engine::new();
        let source = EventSource::<String>::new(&engine);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = source
            .observe(move |value| seen_clone.lock().push(value))
            .unwrap();

        source.fire("a".to_string()).unwrap();
        source.fire("a".to_string()).unwrap();
        assert_eq!(*seen.lock(), vec!["a".to_string(), "a".to_string()]);
    }

    #[test]
    fn last_keeps_the_latest_value() {
        let engine = Engine::new();
        let source = EventSource::<u32>::new(&engine);
        assert_eq!(source.last().unwrap(), None);

        source.fire(7).unwrap();
        engine.create_var(0u32);
        assert_eq!(source.last().unwrap(), Some(7));
    }

    #[test]
    fn stream_outliving_its_engine_reports_disposal() {
        let engine = Engine::new();
        let source = EventSource::<u32>::new(&engine);
        let doubled = source.map(|n| n * 2).unwrap();

        drop(engine);
        assert!(!source.is_alive());
        assert!(matches!(doubled.last(), Err(ReactError::DisposedNode(_))));
        let err = source.fire(1).unwrap_err();
        assert_eq!(err.failures, vec![ReactError::DisposedNode(source.id())]);
    }
}
