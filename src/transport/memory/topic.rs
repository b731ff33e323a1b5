//! Pub/sub topic with fan-out to all subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use super::consumer::Consumer;
use crate::message::Envelope;
use crate::transport::Result;

/// Fan-out topic: every subscription receives every published envelope.
///
/// Per-subscription hand-off failures are isolated (logged, never fail
/// the publish). The published counter is monotonic; pending reflects
/// envelopes received by subscribers but not yet settled.
pub struct InMemoryTopic {
    name: String,
    subscriptions: Mutex<HashMap<String, Arc<Consumer>>>,
    published: AtomicU64,
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let topic = Arc::new(Self {
            name: name.into(),
            subscriptions: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
        });
        info!(topic = %topic.name, "Topic created");
        topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a named subscription.
    pub fn subscribe(&self, subscription: impl Into<String>, consumer: Arc<Consumer>) {
        let subscription = subscription.into();
        debug!(topic = %self.name, subscription = %subscription, "Subscription added");
        self.subscriptions
            .lock()
            .expect("subscription table poisoned")
            .insert(subscription, consumer);
    }

    /// Remove a subscription by name.
    pub fn unsubscribe(&self, subscription: &str) -> Option<Arc<Consumer>> {
        self.subscriptions
            .lock()
            .expect("subscription table poisoned")
            .remove(subscription)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("subscription table poisoned")
            .len()
    }

    /// Fan an envelope out to every subscription.
    pub fn publish(&self, envelope: Envelope) -> Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);

        let subscriptions: Vec<(String, Arc<Consumer>)> = {
            let table = self
                .subscriptions
                .lock()
                .expect("subscription table poisoned");
            table
                .iter()
                .map(|(name, consumer)| (name.clone(), Arc::clone(consumer)))
                .collect()
        };

        for (subscription, consumer) in subscriptions {
            if let Err(e) = consumer.deliver(envelope.clone()) {
                // One broken subscription never fails the publish.
                error!(
                    topic = %self.name,
                    subscription = %subscription,
                    error = %e,
                    "Subscription delivery failed"
                );
            }
        }
        Ok(())
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Envelopes handed to subscribers and not yet settled.
    pub fn pending(&self) -> u64 {
        let table = self
            .subscriptions
            .lock()
            .expect("subscription table poisoned");
        table
            .values()
            .map(|consumer| consumer.metrics().in_flight())
            .sum()
    }

    /// Drop all subscriptions (on transport disposal).
    pub fn clear(&self) {
        self.subscriptions
            .lock()
            .expect("subscription table poisoned")
            .clear();
    }
}
