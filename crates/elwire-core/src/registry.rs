//! Caller-visible bookkeeping shared between caller tasks and the dispatch
//! worker: the pending request table, the subscription registry, and the
//! request id counter.
//!
//! `Interface` keeps one `Registry` behind a single `std::sync::Mutex`.
//! Nothing here invokes callbacks; lookups hand back cloned `Callback`
//! handles so the lock is released before any user code runs.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::{Callback, Message};

// ==============================================================================
// Pending Request Table
// ==============================================================================

/// An outbound call awaiting its correlated reply.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub method: String,
    pub params: Vec<Value>,
    pub callback: Callback,
}

/// Maps request ids to their originating call. Ids come from a counter
/// that only moves forward for the life of the table, across reconnects.
#[derive(Debug, Default)]
pub struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, PendingEntry>,
}

impl PendingTable {
    pub fn register(&mut self, method: String, params: Vec<Value>, callback: Callback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            PendingEntry {
                method,
                params,
                callback,
            },
        );
        id
    }

    /// Remove and return the entry for `id`. `None` means the id was already
    /// resolved or never issued here.
    pub fn resolve(&mut self, id: u64) -> Option<PendingEntry> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drop entries whose request never reached the wire.
    pub fn discard(&mut self, ids: &[u64]) {
        for id in ids {
            self.entries.remove(id);
        }
    }

    /// Forget every outstanding request, e.g. before reconnecting. Returns
    /// how many were abandoned.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

// ==============================================================================
// Subscription Registry
// ==============================================================================

/// `(method, params)` in a comparable, hashable form. `serde_json` keeps
/// object keys sorted, so the rendered params string is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey(String);

impl SubscriptionKey {
    fn new(method: &str, params: &[Value]) -> Self {
        Self(format!("{method}\u{0}{}", Value::Array(params.to_vec())))
    }
}

#[derive(Debug)]
struct Subscriber {
    callback: Callback,
    requests: Vec<Message>,
}

/// Routes notifications to the callback that subscribed to them.
///
/// Each callback appears once, with its requests in registration order.
/// When several callbacks hold the same pair, the earliest registered one
/// receives the notification.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribers: Vec<Subscriber>,
    index: HashMap<SubscriptionKey, usize>,
}

impl SubscriptionRegistry {
    /// Register `message` for `callback`. Returns `false` when the pair was
    /// already registered for that callback.
    pub fn subscribe(&mut self, callback: &Callback, message: &Message) -> bool {
        let position = match self
            .subscribers
            .iter()
            .position(|s| s.callback.same(callback))
        {
            Some(position) => position,
            None => {
                self.subscribers.push(Subscriber {
                    callback: callback.clone(),
                    requests: Vec::new(),
                });
                self.subscribers.len() - 1
            }
        };

        let subscriber = &mut self.subscribers[position];
        if subscriber.requests.contains(message) {
            return false;
        }
        subscriber.requests.push(message.clone());

        self.index
            .entry(SubscriptionKey::new(&message.method, &message.params))
            .or_insert(position);
        true
    }

    /// Forget `callback` and everything it subscribed to. Pairs it shared
    /// with later subscribers pass to the earliest remaining one.
    pub fn remove(&mut self, callback: &Callback) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| !s.callback.same(callback));
        if self.subscribers.len() == before {
            return false;
        }

        self.index.clear();
        for (position, subscriber) in self.subscribers.iter().enumerate() {
            for request in &subscriber.requests {
                self.index
                    .entry(SubscriptionKey::new(&request.method, &request.params))
                    .or_insert(position);
            }
        }
        true
    }

    pub fn route(&self, method: &str, params: &[Value]) -> Option<Callback> {
        self.index
            .get(&SubscriptionKey::new(method, params))
            .map(|&position| self.subscribers[position].callback.clone())
    }

    /// Requests registered by `callback`, in registration order.
    pub fn requests_of(&self, callback: &Callback) -> Vec<Message> {
        self.subscribers
            .iter()
            .find(|s| s.callback.same(callback))
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    /// Every subscriber with its requests, in registration order.
    pub fn entries(&self) -> Vec<(Callback, Vec<Message>)> {
        self.subscribers
            .iter()
            .map(|s| (s.callback.clone(), s.requests.clone()))
            .collect()
    }

    /// Clear the registry, returning every subscriber so the caller can
    /// send each one the closed signal.
    pub fn drain(&mut self) -> Vec<Callback> {
        self.index.clear();
        self.subscribers.drain(..).map(|s| s.callback).collect()
    }

    /// Number of distinct subscribed callbacks.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

// ==============================================================================
// Registry
// ==============================================================================

/// Both tables, guarded together by the interface's lock.
#[derive(Debug, Default)]
pub struct Registry {
    pub pending: PendingTable,
    pub subscriptions: SubscriptionRegistry,
}

impl Registry {
    /// Record subscription-flavored messages, then register every message
    /// as a pending request. Returns the assigned ids in input order.
    pub fn register_batch(&mut self, messages: &[Message], callback: &Callback) -> Vec<u64> {
        self.register_subscriptions(messages, callback);
        messages
            .iter()
            .map(|m| {
                self.pending
                    .register(m.method.clone(), m.params.clone(), callback.clone())
            })
            .collect()
    }

    pub fn register_subscriptions(&mut self, messages: &[Message], callback: &Callback) {
        for message in messages.iter().filter(|m| m.is_subscription()) {
            self.subscriptions.subscribe(callback, message);
        }
    }
}
