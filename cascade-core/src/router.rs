//! Keyed Routing
//!
//! A [`Router`] keeps one event source per key and creates them on demand:
//! the first update for a key creates its node, later updates are fired into
//! it. Routes are removed explicitly with [`Router::unroute`] or, when an
//! idle timeout is configured, by [`Router::evict_idle`]. Either way the node
//! is disposed through the engine so none of its edges leak.
//!
//! Updates can be pushed directly with [`Router::route`] or taken from a
//! tagged stream with [`Router::attach`]. Updates arriving through a stream
//! are fired in the turn after the one that produced them.

use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::RouterConfig;
use crate::engine::{Engine, Subscription, TurnReport};
use crate::error::{Result, TurnError};
use crate::reactive::{EventSource, Events};

type RouteHook<K, T> = Box<dyn FnMut(&K, &Events<T>) + Send>;

struct Route<T> {
    source: EventSource<T>,
    last_update: Instant,
}

struct RouterInner<K, T> {
    engine: Engine,
    config: RouterConfig,
    routes: DashMap<K, Route<T>>,
    on_new_route: Mutex<Option<RouteHook<K, T>>>,
    attachments: Mutex<Vec<Subscription>>,
}

/// Dynamic mapping from keys to per-key event sources.
pub struct Router<K, T> {
    inner: Arc<RouterInner<K, T>>,
}

impl<K, T> Router<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(engine: &Engine, config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                engine: engine.clone(),
                config,
                routes: DashMap::new(),
                on_new_route: Mutex::new(None),
                attachments: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Run `hook` whenever a key's node is created, before the key's first
    /// update is fired into it.
    pub fn on_new_route<F>(&self, hook: F)
    where
        F: FnMut(&K, &Events<T>) + Send + 'static,
    {
        *self.inner.on_new_route.lock() = Some(Box::new(hook));
    }

    /// Route every `(key, value)` pair `tagged` fires.
    pub fn attach(&self, tagged: &Events<(K, T)>) -> Result<()> {
        let weak: Weak<RouterInner<K, T>> = Arc::downgrade(&self.inner);
        let subscription = tagged.observe(move |(key, value)| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let router = Router { inner };
            if let Err(err) = router.route(key.clone(), value) {
                tracing::warn!(?key, error = %err, "routed update failed");
            }
        })?;
        self.inner.attachments.lock().push(subscription);
        Ok(())
    }

    /// Fire `value` into the node for `key`, creating the node first if the
    /// key is new.
    pub fn route(&self, key: K, value: T) -> std::result::Result<TurnReport, TurnError> {
        let source = self.source_for(&key);
        source.fire(value)
    }

    fn source_for(&self, key: &K) -> EventSource<T> {
        if let Some(mut route) = self.inner.routes.get_mut(key) {
            route.last_update = Instant::now();
            return route.source.clone();
        }

        // The node is created before the map entry is locked, so no shard
        // lock is ever held while waiting on the engine.
        let fresh = EventSource::<T>::new(&self.inner.engine);
        let existing = match self.inner.routes.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().last_update = Instant::now();
                Some(entry.get().source.clone())
            }
            Entry::Vacant(entry) => {
                entry.insert(Route {
                    source: fresh.clone(),
                    last_update: Instant::now(),
                });
                None
            }
        };
        if let Some(existing) = existing {
            fresh.dispose();
            return existing;
        }

        tracing::debug!(?key, node = %fresh.id(), "route created");
        let hook = self.inner.on_new_route.lock().take();
        if let Some(mut hook) = hook {
            hook(key, &fresh);
            let mut slot = self.inner.on_new_route.lock();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
        fresh
    }

    /// The node for `key`, if the key has been routed.
    pub fn node(&self, key: &K) -> Option<Events<T>> {
        self.inner
            .routes
            .get(key)
            .map(|route| route.source.as_events())
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner
            .routes
            .iter()
            .map(|route| route.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.routes.is_empty()
    }

    /// Remove the route for `key` and dispose its node.
    pub fn unroute(&self, key: &K) -> bool {
        match self.inner.routes.remove(key) {
            Some((_, route)) => {
                tracing::debug!(?key, node = %route.source.id(), "route removed");
                route.source.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every route idle for longer than the configured timeout.
    pub fn evict_idle(&self) -> Vec<K> {
        self.evict_idle_at(Instant::now())
    }

    /// [`evict_idle`](Self::evict_idle) with an explicit clock reading.
    pub fn evict_idle_at(&self, now: Instant) -> Vec<K> {
        let Some(timeout) = self.inner.config.idle_timeout else {
            return Vec::new();
        };
        let is_idle = |route: &Route<T>| now.saturating_duration_since(route.last_update) >= timeout;
        let candidates: Vec<K> = self
            .inner
            .routes
            .iter()
            .filter(|route| is_idle(route.value()))
            .map(|route| route.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for key in candidates {
            if let Some((key, route)) = self.inner.routes.remove_if(&key, |_, route| is_idle(route)) {
                tracing::debug!(?key, node = %route.source.id(), "idle route evicted");
                route.source.dispose();
                evicted.push(key);
            }
        }
        evicted
    }

    /// Detach from every tagged stream and dispose every route.
    pub fn dispose(&self) {
        let attachments = std::mem::take(&mut *self.inner.attachments.lock());
        drop(attachments);
        for key in self.keys() {
            self.unroute(&key);
        }
    }
}

impl<K, T> Clone for Router<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
