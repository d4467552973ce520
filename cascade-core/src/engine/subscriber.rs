//! Subscriber types for the engine.
//!
//! A subscriber is a callback attached to one node. It runs once per turn in
//! which the node changed, after the turn's drain loop has finished, so every
//! value it can observe is final.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use indexmap::{IndexMap, IndexSet};

use super::Shared;
use crate::graph::{NodeId, Value};

pub(crate) type ChangeCallback = Box<dyn FnMut(&Value) + Send>;
pub(crate) type DisposeHook = Box<dyn FnOnce() + Send>;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Subscriber {
    pub node: NodeId,
    /// Turn the subscription was registered in. It fires from the next turn on.
    pub since_turn: u64,
    /// Taken out while the callback runs.
    pub on_change: Option<ChangeCallback>,
    pub on_dispose: Option<DisposeHook>,
}

/// Subscribers indexed by id and by node.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    by_id: IndexMap<SubscriptionId, Subscriber>,
    by_node: HashMap<NodeId, IndexSet<SubscriptionId>>,
}

impl SubscriberRegistry {
    pub fn insert(&mut self, id: SubscriptionId, subscriber: Subscriber) {
        self.by_node.entry(subscriber.node).or_default().insert(id);
        self.by_id.insert(id, subscriber);
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscriber> {
        let subscriber = self.by_id.shift_remove(&id)?;
        if let Some(ids) = self.by_node.get_mut(&subscriber.node) {
            ids.shift_remove(&id);
            if ids.is_empty() {
                self.by_node.remove(&subscriber.node);
            }
        }
        Some(subscriber)
    }

    /// Remove every subscriber of a node that is going away.
    pub fn remove_node(&mut self, node: NodeId) -> Vec<Subscriber> {
        let ids = self.by_node.remove(&node).unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.by_id.shift_remove(&id))
            .collect()
    }

    /// Subscriptions of `node` that are due in `turn`, in registration order.
    pub fn due(&self, node: NodeId, turn: u64) -> Vec<SubscriptionId> {
        self.by_node
            .get(&node)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.by_id
                            .get(*id)
                            .map(|sub| sub.since_turn < turn)
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn take_callback(&mut self, id: SubscriptionId) -> Option<ChangeCallback> {
        self.by_id.get_mut(&id).and_then(|sub| sub.on_change.take())
    }

    /// Put a callback back after it ran. Hands it back if the subscription
    /// was removed in the meantime, so the caller can drop it.
    pub fn restore_callback(
        &mut self,
        id: SubscriptionId,
        callback: ChangeCallback,
    ) -> Option<ChangeCallback> {
        match self.by_id.get_mut(&id) {
            Some(sub) => {
                sub.on_change = Some(callback);
                None
            }
            None => Some(callback),
        }
    }

    pub fn count_for(&self, node: NodeId) -> usize {
        self.by_node.get(&node).map(IndexSet::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Handle to a registered subscription.
///
/// Dropping this handle unsubscribes. Call [`Subscription::detach`] to keep
/// the callback registered for as long as its node lives.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriptionId,
    node: NodeId,
    engine: Weak<Shared>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, node: NodeId, engine: Weak<Shared>) -> Self {
        Self {
            id,
            node,
            engine,
            active: true,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The node this subscription observes.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Unsubscribe now. Returns whether the subscription was still registered.
    pub fn unsubscribe(mut self) -> bool {
        self.active = false;
        match self.engine.upgrade() {
            Some(shared) => super::Engine::from_shared(shared).unsubscribe(self.id),
            None => false,
        }
    }

    /// Keep the subscription registered without holding the handle.
    pub fn detach(mut self) -> SubscriptionId {
        self.active = false;
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(shared) = self.engine.upgrade() {
            super::Engine::from_shared(shared).release_subscription(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("active", &self.active)
            .finish()
    }
}
