//! Signal and Var Handles
//!
//! Typed handles over continuous nodes. A [`Signal`] always has a value; a
//! [`Var`] is a signal whose value is set from outside the graph.
//!
//! # Reading
//!
//! - [`Signal::get`] reads the settled value from outside an evaluator.
//! - [`Signal::track`] reads it from inside an evaluator and registers the
//!   dependency on the way.
//!
//! # Thread Safety
//!
//! Handles are `Send + Sync` whatever `T` is; the value itself lives in the
//! engine and every access goes through the engine's lock.
//!
//! # Ownership
//!
//! A handle does not keep its engine alive, so handles captured by
//! evaluators never form a cycle with the graph that owns them. Once every
//! [`Engine`] is dropped, operations on a handle fail with
//! `ReactError::DisposedNode`.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::engine::{
    downcast_value, Engine, EvalContext, NodeSpec, Shared, Subscription, TurnReport,
};
use crate::error::{EvalError, Result, TurnError};
use crate::graph::{NodeId, NodeInfo};

/// A continuous derived value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = Var::new(&engine, 2);
/// let doubled = count.map(|n| n * 2)?;
///
/// count.set(5)?;
/// assert_eq!(doubled.get()?, 10);
/// ```
pub struct Signal<T> {
    id: NodeId,
    engine: Weak<Shared>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Signal<T>
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

    /// Build a signal from an arbitrary evaluator.
    ///
    /// The dependency set is whatever the last evaluation read through the
    /// context, so branches may read different nodes each turn. Dependents
    /// are only notified when the result differs from the previous one.
    pub fn derive<F>(engine: &Engine, mut compute: F) -> Result<Self>
    where
        T: PartialEq,
        F: FnMut(&mut EvalContext<'_>) -> std::result::Result<T, EvalError> + Send + 'static,
    {
        let spec = NodeSpec::signal(move |ctx| {
            let value = compute(ctx)?;
            Ok(ctx.changed_if_different(value))
        })
        .dynamic();
        let id = engine.create(spec)?;
        Ok(Self::from_node(engine, id))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The engine this signal belongs to, if it is still alive.
    pub fn engine(&self) -> Result<Engine> {
        Engine::upgrade(&self.engine, self.id)
    }

    /// Get the current value.
    pub fn get(&self) -> Result<T> {
        self.engine()?.read_as::<T>(self.id)
    }

    /// Get the current value from inside an evaluator, registering this
    /// signal as a dependency of the node being evaluated.
    pub fn track(&self, ctx: &mut EvalContext<'_>) -> std::result::Result<T, EvalError> {
        ctx.get::<T>(self.id)
    }

    /// Run `callback` with the new value after every turn in which the signal
    /// changed.
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

    /// Dispose the underlying node. Other handles to it go stale.
    pub fn dispose(&self) -> bool {
        self.engine().is_ok_and(|engine| engine.dispose_node(self.id))
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            engine: self.engine.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.engine, &other.engine)
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&self.id).finish()
    }
}

/// A continuous source: a signal whose value is set by stimuli.
pub struct Var<T> {
    signal: Signal<T>,
}

impl<T> Var<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new var with the given initial value.
    pub fn new(engine: &Engine, initial: T) -> Self {
        let id = engine.create_var(initial);
        Self {
            signal: Signal::from_node(engine, id),
        }
    }

    /// Set a new value and run the resulting turn.
    pub fn set(&self, value: T) -> std::result::Result<TurnReport, TurnError> {
        self.signal.engine()?.emit(self.signal.id, Arc::new(value))
    }

    /// Set a value computed from the current one.
    pub fn update<F>(&self, f: F) -> std::result::Result<TurnReport, TurnError>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.signal.get()?;
        self.set(f(&current))
    }

    /// This var as a plain signal handle.
    pub fn as_signal(&self) -> Signal<T> {
        self.signal.clone()
    }
}

impl<T> Deref for Var<T> {
    type Target = Signal<T>;

    fn deref(&self) -> &Signal<T> {
        &self.signal
    }
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T> fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Var").field(&self.signal.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReactError;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn var_get_and_set() {
        let engine = Engine::new();
        let var = Var::new(&engine, 0);
        assert_eq!(var.get().unwrap(), 0);

        var.set(42).unwrap();
        assert_eq!(var.get().unwrap(), 42);
    }

    #[test]
    fn var_update() {
        let engine = Engine::new();
        let var = Var::new(&engine, 10);
        var.update(|n| n + 5).unwrap();
        assert_eq!(var.get().unwrap(), 15);
    }

    #[test]
    fn observe_sees_each_change() {
        let engine = Engine::new();
        let var = Var::new(&engine, 0);
        let last = Arc::new(AtomicI32::new(-1));
        let last_clone = last.clone();
        let _sub = var
            .observe(move |value: i32| last_clone.store(value, Ordering::SeqCst))
            .unwrap();

        var.set(3).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn derive_switches_dependencies() {
        let engine = Engine::new();
        let use_left = Var::new(&engine, true);
        let left = Var::new(&engine, 1);
        let right = Var::new(&engine, 2);

        let (flag, l, r) = (use_left.as_signal(), left.as_signal(), right.as_signal());
        let picked = Signal::derive(&engine, move |ctx| {
            if flag.track(ctx)? {
                l.track(ctx)
            } else {
                r.track(ctx)
            }
        })
        .unwrap();

        assert_eq!(picked.get().unwrap(), 1);
        assert!(picked.info().unwrap().dependencies.contains(&left.id()));

        use_left.set(false).unwrap();
        assert_eq!(picked.get().unwrap(), 2);
        let deps = picked.info().unwrap().dependencies;
        assert!(deps.contains(&right.id()));
        assert!(!deps.contains(&left.id()));
    }

    #[test]
    fn wrong_type_is_reported() {
        let engine = Engine::new();
        let var = Var::new(&engine, 1u8);
        let wrong: Signal<String> = Signal::from_node(&engine, var.id());
        assert!(matches!(wrong.get(), Err(ReactError::TypeMismatch { .. })));
    }

    #[test]
    fn captured_handles_do_not_keep_the_engine_alive() {
        let engine = Engine::new();
        let weak = engine.downgrade();
        let a = Var::new(&engine, 1);
        let a2 = a.as_signal();
        let doubled = Signal::derive(&engine, move |ctx| Ok(a2.track(ctx)? * 2)).unwrap();
        let _sub = doubled.observe(|_| {}).unwrap();

        drop(engine);
        assert!(weak.upgrade().is_none());
        assert!(!doubled.is_alive());
        assert!(matches!(doubled.get(), Err(ReactError::DisposedNode(_))));
        assert!(a.set(2).is_err());
    }

    #[test]
    fn handles_compare_by_node() {
        let engine = Engine::new();
        let a = Var::new(&engine, 1);
        let b = Var::new(&engine, 1);
        assert_eq!(a.as_signal(), *a);
        assert_ne!(a.as_signal(), b.as_signal());
    }
}
