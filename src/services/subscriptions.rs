// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Registry of background subscriptions, at most one per (entity, flow).

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Identity of a subscription: the entity it watches and the flow it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub entity: String,
    pub flow: &'static str,
}

impl SubscriptionKey {
    pub fn new(entity: &str, flow: &'static str) -> Self {
        Self {
            entity: entity.to_string(),
            flow,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.flow, self.entity)
    }
}

/// A registered subscription. The token is cancelled when the subscription
/// is replaced or stopped.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: DashMap<SubscriptionKey, Subscription>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription under `key`, cancelling any previous one.
    pub fn replace(&self, key: SubscriptionKey) -> Subscription {
        let sub = Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Some(previous) = self.active.insert(key.clone(), sub.clone()) {
            tracing::debug!(key = %key, "Replacing existing subscription");
            previous.token.cancel();
        }
        sub
    }

    /// Cancel the subscription under `key`. Returns whether one existed.
    pub fn cancel(&self, key: &SubscriptionKey) -> bool {
        match self.active.remove(key) {
            Some((_, sub)) => {
                sub.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove `key` if it is still registered to subscription `id`. Called by
    /// a task that ends on its own; a replaced task must not evict its
    /// successor.
    pub fn release(&self, key: &SubscriptionKey, id: u64) {
        self.active.remove_if(key, |_, current| current.id == id);
    }

    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().token.cancel();
        }
        self.active.clear();
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
