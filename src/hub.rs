//! Per-source fan-out of published lines.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::subscribers::SubscriberSet;
use crate::Published;

/// Delivery loop for one source.
///
/// Consumes lines in publish order and offers each one to every subscriber
/// registered at that moment. Subscribers that fail delivery are removed in
/// the same pass and never see another line.
pub struct BroadcastHub {
    source: String,
    subscribers: Arc<SubscriberSet>,
    rx: mpsc::Receiver<Published>,
}

impl BroadcastHub {
    pub fn new(
        source: impl Into<String>,
        subscribers: Arc<SubscriberSet>,
        rx: mpsc::Receiver<Published>,
    ) -> Self {
        BroadcastHub {
            source: source.into(),
            subscribers,
            rx,
        }
    }

    /// Runs until the publishing side is dropped, then disconnects every
    /// remaining subscriber.
    pub async fn run(mut self) {
        while let Some(published) = self.rx.recv().await {
            broadcast(&self.source, &self.subscribers, &published);
        }

        let dropped = self.subscribers.close();
        info!(
            source = %self.source,
            subscribers = dropped,
            "publisher closed, broadcast stopped"
        );
    }
}

/// Offers `published` to every current member of `subscribers` and returns
/// how many accepted it.
pub fn broadcast(source: &str, subscribers: &SubscriberSet, published: &Published) -> usize {
    let mut delivered = 0;

    for subscriber in subscribers.snapshot() {
        match subscriber.deliver(published) {
            Ok(()) => delivered += 1,
            Err(e) => {
                subscribers.remove(subscriber.id());
                debug!(
                    source = %source,
                    subscriber = %subscriber.id(),
                    error = %e,
                    "dropping subscriber"
                );
            }
        }
    }

    delivered
}
