//! Combinators
//!
//! Constructors that wire a new node to existing ones. Each one registers its
//! dependencies up front through [`NodeSpec::depends_on`], so the new node
//! starts at the right level, except `flatten`, whose dependencies follow
//! the inner signal it currently points at.
//!
//! # Change detection
//!
//! Continuous combinators (`map`, `map2`, `combine`, `hold`, `flatten`)
//! compare their result with the previous value and stay quiet when it is
//! equal. Discrete combinators fire exactly in the turns their input fires
//! and the result passes (`filter` and `filter_map` may swallow it).

use std::sync::Arc;

use super::events::Events;
use super::signal::Signal;
use crate::engine::{downcast_value, Engine, NodeSpec};
use crate::error::{ReactError, Result};
use crate::graph::{NodeId, Pulse};

/// Which value a merged stream carries when both inputs fire in one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Keep the left input's value.
    #[default]
    LeftBiased,
    /// Keep the right input's value.
    RightBiased,
}

fn same_engine(engine: &Engine, other: &Engine, node: NodeId) -> Result<()> {
    if Arc::ptr_eq(&engine.shared, &other.shared) {
        Ok(())
    } else {
        Err(ReactError::ForeignNode(node))
    }
}

fn signal_node<U>(engine: &Engine, spec: NodeSpec) -> Result<Signal<U>>
where
    U: Clone + Send + Sync + 'static,
{
    let id = engine.create(spec)?;
    Ok(Signal::from_node(engine, id))
}

fn events_node<U>(engine: &Engine, spec: NodeSpec) -> Result<Events<U>>
where
    U: Clone + Send + Sync + 'static,
{
    let id = engine.create(spec)?;
    Ok(Events::from_node(engine, id))
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A signal holding `f` of this signal's value.
    pub fn map<U, F>(&self, mut f: F) -> Result<Signal<U>>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let src = self.id();
        let spec = NodeSpec::signal(move |ctx| {
            let value = f(ctx.get::<T>(src)?);
            Ok(ctx.changed_if_different(value))
        })
        .depends_on([src]);
        signal_node(&self.engine()?, spec)
    }

    /// An event stream firing the new value in every turn this signal
    /// changes.
    pub fn changes(&self) -> Result<Events<T>> {
        let src = self.id();
        let spec = NodeSpec::events(move |ctx| {
            Ok(match ctx.event(src)? {
                Some(value) => Pulse::Changed(value),
                None => Pulse::Unchanged,
            })
        })
        .depends_on([src]);
        events_node(&self.engine()?, spec)
    }
}

impl<T> Events<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn map<U, F>(&self, mut f: F) -> Result<Events<U>>
    where
        U: Clone + Send + Sync + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let src = self.id();
        let spec = NodeSpec::events(move |ctx| {
            Ok(match ctx.get_event::<T>(src)? {
                Some(value) => Pulse::changed(f(value)),
                None => Pulse::Unchanged,
            })
        })
        .depends_on([src]);
        events_node(&self.engine()?, spec)
    }

    /// A stream firing only the values `predicate` accepts.
    ///
    /// The filter still evaluates in every turn its input fires; rejected
    /// values are simply not passed on.
    pub fn filter<P>(&self, mut predicate: P) -> Result<Events<T>>
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        let src = self.id();
        let spec = NodeSpec::events(move |ctx| {
            let Some(value) = ctx.event(src)? else {
                return Ok(Pulse::Unchanged);
            };
            let typed = downcast_value::<T>(src, &value)?;
            Ok(if predicate(&typed) {
                Pulse::Changed(value)
            } else {
                Pulse::Unchanged
            })
        })
        .depends_on([src]);
        events_node(&self.engine()?, spec)
    }

    pub fn filter_map<U, F>(&self, mut f: F) -> Result<Events<U>>
    where
        U: Clone + Send + Sync + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        let src = self.id();
        let spec = NodeSpec::events(move |ctx| {
            Ok(match ctx.get_event::<T>(src)?.and_then(&mut f) {
                Some(value) => Pulse::changed(value),
                None => Pulse::Unchanged,
            })
        })
        .depends_on([src]);
        events_node(&self.engine()?, spec)
    }
}

/// A signal computed from two signals.
pub fn map2<A, B, U, F>(a: &Signal<A>, b: &Signal<B>, mut f: F) -> Result<Signal<U>>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    U: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(A, B) -> U + Send + 'static,
{
    let engine = a.engine()?;
    same_engine(&engine, &b.engine()?, b.id())?;
    let (left, right) = (a.id(), b.id());
    let spec = NodeSpec::signal(move |ctx| {
        let a = ctx.get::<A>(left)?;
        let b = ctx.get::<B>(right)?;
        Ok(ctx.changed_if_different(f(a, b)))
    })
    .depends_on([left, right]);
    signal_node(&engine, spec)
}

/// A signal computed from any number of signals of one type. `f` receives
/// their values in the order given.
pub fn combine<T, U, F>(engine: &Engine, signals: &[Signal<T>], mut f: F) -> Result<Signal<U>>
where
    T: Clone + Send + Sync + 'static,
    U: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(&[T]) -> U + Send + 'static,
{
    for signal in signals {
        same_engine(engine, &signal.engine()?, signal.id())?;
    }
    let ids: Vec<NodeId> = signals.iter().map(Signal::id).collect();
    let deps = ids.clone();
    let spec = NodeSpec::signal(move |ctx| {
        let mut values = Vec::with_capacity(ids.len());
        for id in &ids {
            values.push(ctx.get::<T>(*id)?);
        }
        Ok(ctx.changed_if_different(f(&values)))
    })
    .depends_on(deps);
    signal_node(engine, spec)
}

/// A stream firing whenever either input fires. When both fire in the same
/// turn `policy` picks the value.
pub fn merge<T>(a: &Events<T>, b: &Events<T>, policy: MergePolicy) -> Result<Events<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let engine = a.engine()?;
    same_engine(&engine, &b.engine()?, b.id())?;
    let (left, right) = (a.id(), b.id());
    let spec = NodeSpec::events(move |ctx| {
        let l = ctx.event(left)?;
        let r = ctx.event(right)?;
        let value = match (l, r) {
            (Some(l), Some(r)) => match policy {
                MergePolicy::LeftBiased => l,
                MergePolicy::RightBiased => r,
            },
            (Some(value), None) | (None, Some(value)) => value,
            (None, None) => return Ok(Pulse::Unchanged),
        };
        Ok(Pulse::Changed(value))
    })
    .depends_on([left, right]);
    events_node(&engine, spec)
}

/// Like [`merge`], but simultaneous values are combined by `resolve`.
pub fn merge_with<T, F>(a: &Events<T>, b: &Events<T>, mut resolve: F) -> Result<Events<T>>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T, T) -> T + Send + 'static,
{
    let engine = a.engine()?;
    same_engine(&engine, &b.engine()?, b.id())?;
    let (left, right) = (a.id(), b.id());
    let spec = NodeSpec::events(move |ctx| {
        let l = ctx.get_event::<T>(left)?;
        let r = ctx.get_event::<T>(right)?;
        let value = match (l, r) {
            (Some(l), Some(r)) => resolve(l, r),
            (Some(value), None) | (None, Some(value)) => value,
            (None, None) => return Ok(Pulse::Unchanged),
        };
        Ok(Pulse::changed(value))
    })
    .depends_on([left, right]);
    events_node(&engine, spec)
}

/// A signal accumulating every value `events` fires, starting from `seed`.
///
/// Each firing produces `combine(&previous, value)`; the signal changes in
/// every turn the stream fires.
pub fn fold<T, S, F>(events: &Events<T>, seed: S, mut combine: F) -> Result<Signal<S>>
where
    T: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
    F: FnMut(&S, T) -> S + Send + 'static,
{
    let src = events.id();
    let spec = NodeSpec::signal(move |ctx| {
        let Some(value) = ctx.get_event::<T>(src)? else {
            return Ok(Pulse::Unchanged);
        };
        let previous = ctx
            .previous_as::<S>()?
            .ok_or(ReactError::Uninitialized(ctx.node()))?;
        Ok(Pulse::changed(combine(&previous, value)))
    })
    .depends_on([src])
    .initial(Arc::new(seed));
    signal_node(&events.engine()?, spec)
}

/// A signal holding the last value `events` fired, `initial` before that.
pub fn hold<T>(events: &Events<T>, initial: T) -> Result<Signal<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let src = events.id();
    let spec = NodeSpec::signal(move |ctx| {
        Ok(match ctx.get_event::<T>(src)? {
            Some(value) => ctx.changed_if_different(value),
            None => Pulse::Unchanged,
        })
    })
    .depends_on([src])
    .initial(Arc::new(initial));
    signal_node(&events.engine()?, spec)
}

/// A stream firing the value of `signal` whenever `trigger` fires.
///
/// The sampled value is the signal's final value for the turn, even when the
/// signal changes in the same turn as the trigger.
pub fn snapshot<E, S>(trigger: &Events<E>, signal: &Signal<S>) -> Result<Events<S>>
where
    E: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    let engine = trigger.engine()?;
    same_engine(&engine, &signal.engine()?, signal.id())?;
    let (trigger_id, signal_id) = (trigger.id(), signal.id());
    let spec = NodeSpec::events(move |ctx| {
        if ctx.event(trigger_id)?.is_none() {
            return Ok(Pulse::Unchanged);
        }
        Ok(Pulse::Changed(ctx.read(signal_id)?))
    })
    .depends_on([trigger_id, signal_id]);
    events_node(&engine, spec)
}

/// A signal following whichever signal `outer` currently holds.
///
/// The dependency on the previous inner signal is dropped when `outer`
/// switches.
pub fn flatten<T>(outer: &Signal<Signal<T>>) -> Result<Signal<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let outer_id = outer.id();
    let spec = NodeSpec::signal(move |ctx| {
        let inner = ctx.get::<Signal<T>>(outer_id)?;
        let value = ctx.get::<T>(inner.id())?;
        Ok(ctx.changed_if_different(value))
    })
    .depends_on([outer_id])
    .dynamic();
    signal_node(&outer.engine()?, spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{EventSource, Var};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collect<T>(events: &Events<T>) -> (Arc<Mutex<Vec<T>>>, crate::engine::Subscription)
    where
        T: Clone + Send + Sync + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = events.observe(move |value| sink.lock().push(value)).unwrap();
        (seen, sub)
    }

    #[test]
    fn map_skips_equal_results() {
        let engine = Engine::new();
        let var = Var::new(&engine, 1);
        let parity = var.map(|n: i32| n % 2).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let _sub = parity
            .observe(move |_| {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        var.set(3).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        var.set(4).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(parity.get().unwrap(), 0);
    }

    #[test]
    fn map2_and_combine() {
        let engine = Engine::new();
        let a = Var::new(&engine, 2);
        let b = Var::new(&engine, 3);
        let product = map2(&a, &b, |a: i32, b: i32| a * b).unwrap();
        let sum = combine(&engine, &[a.as_signal(), b.as_signal()], |v: &[i32]| {
            v.iter().sum::<i32>()
        })
        .unwrap();

        assert_eq!(product.get().unwrap(), 6);
        assert_eq!(sum.get().unwrap(), 5);
        engine
            .batch(|batch| {
                batch.set(&a, 4).set(&b, 5);
            })
            .unwrap();
        assert_eq!(product.get().unwrap(), 20);
        assert_eq!(sum.get().unwrap(), 9);
    }

    #[test]
    fn filter_suppresses_rejected_values() {
        let engine = Engine::new();
        let source = EventSource::<i32>::new(&engine);
        let even = source.filter(|n| n % 2 == 0).unwrap();
        let (seen, _sub) = collect(&even);

        for n in 1..=6 {
            let report = source.fire(n).unwrap();
            assert!(report.evaluated_node(even.id()));
            assert_eq!(report.changed.contains(&even.id()), n % 2 == 0);
        }
        assert_eq!(*seen.lock(), vec![2, 4, 6]);
    }

    #[test]
    fn events_map_and_filter_map() {
        let engine = Engine::new();
        let source = EventSource::<&'static str>::new(&engine);
        let lengths = source.map(|s| s.len()).unwrap();
        let numbers = source.filter_map(|s| s.parse::<u32>().ok()).unwrap();
        let (lens, _a) = collect(&lengths);
        let (nums, _b) = collect(&numbers);

        source.fire("12").unwrap();
        source.fire("abc").unwrap();
        assert_eq!(*lens.lock(), vec![2, 3]);
        assert_eq!(*nums.lock(), vec![12]);
    }

    #[test]
    fn merge_policies() {
        let engine = Engine::new();
        let left = EventSource::<&'static str>::new(&engine);
        let right = EventSource::<&'static str>::new(&engine);
        let left_wins = merge(&left, &right, MergePolicy::LeftBiased).unwrap();
        let right_wins = merge(&left, &right, MergePolicy::RightBiased).unwrap();
        let joined = merge_with(&left, &right, |l, r| if l < r { l } else { r }).unwrap();
        let (l_seen, _a) = collect(&left_wins);
        let (r_seen, _b) = collect(&right_wins);
        let (j_seen, _c) = collect(&joined);

        engine
            .batch(|batch| {
                batch.fire(&left, "x").fire(&right, "b");
            })
            .unwrap();
        right.fire("only").unwrap();

        assert_eq!(*l_seen.lock(), vec!["x", "only"]);
        assert_eq!(*r_seen.lock(), vec!["b", "only"]);
        assert_eq!(*j_seen.lock(), vec!["b", "only"]);
    }

    #[test]
    fn fold_accumulates() {
        let engine = Engine::new();
        let source = EventSource::<i32>::new(&engine);
        let total = fold(&source, 100, |acc, n| acc + n).unwrap();
        assert_eq!(total.get().unwrap(), 100);

        source.fire(5).unwrap();
        source.fire(-20).unwrap();
        assert_eq!(total.get().unwrap(), 85);
    }

    #[test]
    fn hold_and_changes() {
        let engine = Engine::new();
        let source = EventSource::<i32>::new(&engine);
        let held = hold(&source, 0).unwrap();
        let changes = held.changes().unwrap();
        let (seen, _sub) = collect(&changes);

        source.fire(1).unwrap();
        source.fire(1).unwrap();
        source.fire(2).unwrap();
        assert_eq!(held.get().unwrap(), 2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn snapshot_samples_the_settled_value() {
        let engine = Engine::new();
        let base = Var::new(&engine, 1);
        let scaled = base.map(|n: i32| n * 10).unwrap();
        let tick = EventSource::<()>::new(&engine);
        let sampled = snapshot(&tick, &scaled).unwrap();
        let (seen, _sub) = collect(&sampled);

        tick.fire(()).unwrap();
        base.set(2).unwrap();
        engine
            .batch(|batch| {
                batch.set(&base, 3).fire(&tick, ());
            })
            .unwrap();
        assert_eq!(*seen.lock(), vec![10, 30]);
    }

    #[test]
    fn flatten_switches_inner_signal() {
        let engine = Engine::new();
        let first = Var::new(&engine, 1);
        let second = Var::new(&engine, 2);
        let second_doubled = second.map(|n: i32| n * 2).unwrap();
        let outer = Var::new(&engine, first.as_signal());
        let flat = flatten(&outer).unwrap();
        assert_eq!(flat.get().unwrap(), 1);

        outer.set(second_doubled.clone()).unwrap();
        assert_eq!(flat.get().unwrap(), 4);
        let deps = flat.info().unwrap().dependencies;
        assert!(!deps.contains(&first.id()));
        assert!(deps.contains(&second_doubled.id()));

        first.set(10).unwrap();
        assert_eq!(flat.get().unwrap(), 4);
        second.set(5).unwrap();
        assert_eq!(flat.get().unwrap(), 10);

        let weak = engine.downgrade();
        drop(engine);
        assert!(weak.upgrade().is_none());
        assert!(!flat.is_alive());
    }

    #[test]
    fn combinators_reject_foreign_nodes() {
        let one = Engine::new();
        let two = Engine::new();
        let a = EventSource::<i32>::new(&one);
        let b = EventSource::<i32>::new(&two);
        let err = merge(&a, &b, MergePolicy::LeftBiased).unwrap_err();
        assert_eq!(err, ReactError::ForeignNode(b.id()));
    }
}
