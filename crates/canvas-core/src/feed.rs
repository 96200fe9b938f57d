//! Push-notification feed interface.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{PushEvent, ScopeKey};

/// Source of push notifications for durable writes.
#[async_trait]
pub trait PushFeed: Send + Sync {
    /// Opens a subscription for one scope.
    ///
    /// Fails with a transient error when the feed is temporarily unavailable.
    async fn subscribe(&self, scope: &ScopeKey) -> Result<PushSubscription>;
}

/// A live subscription. Dropping it tears the subscription down.
#[derive(Debug)]
pub struct PushSubscription {
    scope: ScopeKey,
    receiver: mpsc::Receiver<Result<PushEvent>>,
}

impl PushSubscription {
    pub fn new(scope: ScopeKey, receiver: mpsc::Receiver<Result<PushEvent>>) -> Self {
        Self { scope, receiver }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// Next delivery.
    ///
    /// - `Some(Ok(event))`: a notification
    /// - `Some(Err(_))`: delivery failure; the subscription should be re-established
    /// - `None`: the feed closed the subscription
    pub async fn next(&mut self) -> Option<Result<PushEvent>> {
        self.receiver.recv().await
    }
}
