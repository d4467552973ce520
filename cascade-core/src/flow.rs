//! Flows
//!
//! A [`Flow`] turns a node into a pull-based sequence: every value the node
//! changes to after the flow was created is buffered, and [`Flow::next`]
//! hands them out one at a time, waiting when the buffer is empty.
//!
//! # Backpressure
//!
//! The buffer is bounded. The producer is the engine's notification phase,
//! which must not block, so when the buffer is full the oldest pending value
//! is dropped to make room. [`Flow::dropped`] counts the losses.
//!
//! # End of flow
//!
//! A flow ends when its source node is disposed or when it is closed. Values
//! already buffered are still handed out; after that `next` returns `None`.
//! A flow never rewinds. Create a new one to start over from the present.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::{downcast_value, Engine, Subscription};
use crate::error::{ReactError, Result};
use crate::graph::NodeId;
use crate::reactive::{Events, Signal};

/// Result of a non-blocking [`Flow::try_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryNext<T> {
    Item(T),
    /// Nothing buffered right now.
    Empty,
    /// Nothing buffered and nothing more will arrive.
    Ended,
}

struct FlowShared<T> {
    buffer: Mutex<VecDeque<T>>,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    notify: Notify,
}

impl<T> FlowShared<T> {
    fn push(&self, value: T) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() == self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(value);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// A lazy, buffered sequence of the values a node changes to.
pub struct Flow<T> {
    shared: Arc<FlowShared<T>>,
    subscription: Option<Subscription>,
    source: NodeId,
}

impl<T> Flow<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Follow `source`, buffering up to `capacity` values.
    pub fn new(engine: &Engine, source: NodeId, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ReactError::Config("flow capacity must be at least 1".into()));
        }
        let shared = Arc::new(FlowShared {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });

        let writer = shared.clone();
        let on_change = move |value: &crate::graph::Value| match downcast_value::<T>(source, value) {
            Ok(value) => writer.push(value),
            Err(err) => tracing::warn!(node = %source, error = %err, "flow skipped value"),
        };
        let closer = shared.clone();
        let on_dispose = move || {
            tracing::debug!(node = %source, "flow source disposed");
            closer.close();
        };
        let subscription =
            engine.subscribe_with_hooks(source, Box::new(on_change), Some(Box::new(on_dispose)))?;

        Ok(Self {
            shared,
            subscription: Some(subscription),
            source,
        })
    }

    /// Wait for the next value. Returns `None` once the flow has ended and
    /// its buffer is drained.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            match self.try_next() {
                TryNext::Item(value) => return Some(value),
                TryNext::Ended => return None,
                TryNext::Empty => self.shared.notify.notified().await,
            }
        }
    }

    /// Take the next buffered value without waiting.
    pub fn try_next(&mut self) -> TryNext<T> {
        if let Some(value) = self.shared.buffer.lock().pop_front() {
            return TryNext::Item(value);
        }
        if self.shared.closed.load(Ordering::Acquire) {
            TryNext::Ended
        } else {
            TryNext::Empty
        }
    }

    /// Stop following the source. Buffered values can still be taken.
    pub fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.shared.close();
    }
}

impl<T> Flow<T> {
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Number of values dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Whether the flow has ended and every buffered value was taken.
    pub fn is_ended(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) && self.shared.buffer.lock().is_empty()
    }
}

impl<T> std::fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("source", &self.source)
            .field("buffered", &self.buffered())
            .field("dropped", &self.dropped())
            .finish()
    }
}

fn resolve_capacity(engine: &Engine, capacity: Option<usize>) -> usize {
    capacity.unwrap_or_else(|| engine.config().default_flow_capacity)
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A flow of the values this signal changes to from now on. `None` uses
    /// the engine's default capacity.
    pub fn to_flow(&self, capacity: Option<usize>) -> Result<Flow<T>> {
        let engine = self.engine()?;
        Flow::new(&engine, self.id(), resolve_capacity(&engine, capacity))
    }
}

impl<T> Events<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A flow of the values this stream fires from now on.
    pub fn to_flow(&self, capacity: Option<usize>) -> Result<Flow<T>> {
        let engine = self.engine()?;
        Flow::new(&engine, self.id(), resolve_capacity(&engine, capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{EventSource, Var};
    use std::time::Duration;

    #[test]
    fn values_arrive_in_order() {
        let engine = Engine::new();
        let source = EventSource::<u32>::new(&engine);
        let mut flow = source.to_flow(Some(8)).unwrap();

        assert_eq!(flow.try_next(), TryNext::Empty);
        for n in 1..=3 {
            source.fire(n).unwrap();
        }
        assert_eq!(flow.try_next(), TryNext::Item(1));
        assert_eq!(flow.try_next(), TryNext::Item(2));
        assert_eq!(flow.try_next(), TryNext::Item(3));
        assert_eq!(flow.try_next(), TryNext::Empty);
    }

    #[test]
    fn full_buffer_drops_the_oldest_value() {
        let engine = Engine::new();
        let var = Var::new(&engine, 0);
        let mut flow = var.to_flow(Some(2)).unwrap();

        for n in 1..=5 {
            var.set(n).unwrap();
        }
        assert_eq!(flow.dropped(), 3);
        assert_eq!(flow.try_next(), TryNext::Item(4));
        assert_eq!(flow.try_next(), TryNext::Item(5));
    }

    #[test]
    fn disposal_ends_the_flow_after_draining() {
        let engine = Engine::new();
        let source = EventSource::<u32>::new(&engine);
        let mut flow = source.to_flow(None).unwrap();
        assert_eq!(flow.capacity(), 64);

        source.fire(9).unwrap();
        source.dispose();
        assert!(!flow.is_ended());
        assert_eq!(flow.try_next(), TryNext::Item(9));
        assert_eq!(flow.try_next(), TryNext::Ended);
        assert!(flow.is_ended());
    }

    #[test]
    fn a_new_flow_starts_from_the_present() {
        let engine = Engine::new();
        let source = EventSource::<u32>::new(&engine);
        let mut first = source.to_flow(None).unwrap();
        source.fire(1).unwrap();

        let mut second = source.to_flow(None).unwrap();
        source.fire(2).unwrap();

        assert_eq!(first.try_next(), TryNext::Item(1));
        assert_eq!(first.try_next(), TryNext::Item(2));
        assert_eq!(second.try_next(), TryNext::Item(2));
        assert_eq!(second.try_next(), TryNext::Empty);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let engine = Engine::new();
        let source = EventSource::<u32>::new(&engine);
        assert!(matches!(source.to_flow(Some(0)), Err(ReactError::Config(_))));
    }

    #[tokio::test]
    async fn next_waits_for_a_value() {
        let engine = Engine::new();
        let source = EventSource::<String>::new(&engine);
        let mut flow = source.to_flow(None).unwrap();

        let producer = source.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.fire("late".to_string()).unwrap();
        });

        assert_eq!(flow.next().await, Some("late".to_string()));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn next_returns_none_after_close() {
        let engine = Engine::new();
        let source = EventSource::<u8>::new(&engine);
        let mut flow = source.to_flow(None).unwrap();

        source.fire(1).unwrap();
        flow.close();
        source.fire(2).unwrap();

        assert_eq!(flow.next().await, Some(1));
        assert_eq!(flow.next().await, None);
    }
}
