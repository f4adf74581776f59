// Rule change notifications

//! # Rule Change Bus
//!
//! Broadcasts [`RuleChange`] notifications from whatever edits rules (admin
//! tooling, an API layer) to the engine, which drops its rule cache and
//! dependency graph in response.

use tokio::sync::broadcast;
use tracing::debug;

use crate::models::RuleChange;

const DEFAULT_CAPACITY: usize = 256;

/// Event bus for rule change notifications
pub struct RuleChangeBus {
    sender: broadcast::Sender<RuleChange>,
}

impl RuleChangeBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a change to all current subscribers
    ///
    /// Returns how many subscribers received it. Having none is not an error.
    pub fn publish(&self, change: RuleChange) -> usize {
        debug!(rule_id = %change.rule_id(), kind = change.kind(), "Rule change published");
        self.sender.send(change).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuleChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RuleChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RuleChangeBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = RuleChangeBus::new();
        let mut rx = bus.subscribe();
        let clone = bus.clone();

        assert_eq!(clone.publish(RuleChange::updated("r1")), 1);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.rule_id().as_str(), "r1");
        assert_eq!(change.kind(), "updated");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = RuleChangeBus::new();
        assert_eq!(bus.publish(RuleChange::deleted("r1")), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
