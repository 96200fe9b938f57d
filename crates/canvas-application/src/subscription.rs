//! Push-feed subscription per conversation scope.
//!
//! The manager keeps at most one live subscription. Switching scope cancels
//! the running subscription task and waits for it to finish before the next
//! one starts, so two scopes never deliver into the conversation at once.

use canvas_core::config::SubscriptionConfig;
use canvas_core::feed::{PushFeed, PushSubscription};
use canvas_core::message::ScopeKey;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conversation::ConversationHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Observable status of the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub scope: Option<ScopeKey>,
    pub state: SubscriptionState,
    /// Consecutive failed establishment attempts.
    pub attempt: u32,
    pub last_error: Option<String>,
}

struct ActiveSubscription {
    scope: ScopeKey,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps the conversation subscribed to the push feed of one scope.
pub struct ContextSubscriptionManager {
    feed: Arc<dyn PushFeed>,
    conversation: ConversationHandle,
    config: SubscriptionConfig,
    jitter_seed: Option<u64>,
    active: Mutex<Option<ActiveSubscription>>,
    status: Arc<watch::Sender<SubscriptionStatus>>,
}

impl ContextSubscriptionManager {
    pub fn new(feed: Arc<dyn PushFeed>, conversation: ConversationHandle, config: SubscriptionConfig) -> Self {
        let (status, _) = watch::channel(SubscriptionStatus::default());
        Self {
            feed,
            conversation,
            config,
            jitter_seed: None,
            active: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    /// Makes retry jitter reproducible.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.subscribe()
    }

    /// Subscribes to `scope`, replacing any subscription to another scope.
    ///
    /// Subscribing to the scope that is already live is a no-op.
    pub async fn subscribe(&self, scope: ScopeKey) {
        let mut active = self.active.lock().await;
        let already_live = active
            .as_ref()
            .is_some_and(|current| current.scope == scope && !current.task.is_finished());
        if already_live {
            return;
        }

        if let Some(previous) = active.take() {
            Self::teardown(previous).await;
        }

        tracing::info!("[ContextSubscriptionManager] subscribing to {}", scope);
        let cancel = CancellationToken::new();
        let worker = SubscriptionWorker {
            feed: self.feed.clone(),
            conversation: self.conversation.clone(),
            config: self.config.clone(),
            scope: scope.clone(),
            cancel: cancel.clone(),
            status: self.status.clone(),
            rng: match self.jitter_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        };
        self.status.send_replace(SubscriptionStatus {
            scope: Some(scope.clone()),
            state: SubscriptionState::Subscribing,
            attempt: 0,
            last_error: None,
        });
        let task = tokio::spawn(worker.run());
        *active = Some(ActiveSubscription {
            scope,
            cancel,
            task,
        });
    }

    /// Tears down the live subscription, if any.
    pub async fn unsubscribe(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            Self::teardown(previous).await;
        }
        self.status.send_replace(SubscriptionStatus::default());
    }

    pub async fn current_scope(&self) -> Option<ScopeKey> {
        self.active.lock().await.as_ref().map(|a| a.scope.clone())
    }

    async fn teardown(previous: ActiveSubscription) {
        previous.cancel.cancel();
        if let Err(err) = previous.task.await {
            tracing::error!(
                "[ContextSubscriptionManager] subscription task for {} failed: {}",
                previous.scope,
                err
            );
        }
        tracing::debug!("[ContextSubscriptionManager] tore down {}", previous.scope);
    }
}

impl Drop for ContextSubscriptionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

/// Why a delivery loop ended.
enum DeliveryEnd {
    Cancelled,
    /// The feed dropped or failed the subscription; establish a new one.
    Interrupted(Option<String>),
    /// The conversation actor is gone; nothing left to deliver to.
    ConversationClosed,
}

struct SubscriptionWorker {
    feed: Arc<dyn PushFeed>,
    conversation: ConversationHandle,
    config: SubscriptionConfig,
    scope: ScopeKey,
    cancel: CancellationToken,
    status: Arc<watch::Sender<SubscriptionStatus>>,
    rng: StdRng,
}

impl SubscriptionWorker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            let established = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.feed.subscribe(&self.scope) => result,
            };

            let last_error = match established {
                Ok(subscription) => {
                    attempt = 0;
                    self.publish(SubscriptionState::Subscribed, 0, None);
                    tracing::info!("[ContextSubscriptionManager] subscribed to {}", self.scope);
                    match self.deliver(subscription).await {
                        DeliveryEnd::Cancelled => return,
                        DeliveryEnd::ConversationClosed => {
                            self.publish(SubscriptionState::Unsubscribed, 0, None);
                            return;
                        }
                        DeliveryEnd::Interrupted(reason) => reason,
                    }
                }
                Err(err) if !err.is_transient() => {
                    tracing::error!(
                        "[ContextSubscriptionManager] subscription to {} failed permanently: {}",
                        self.scope,
                        err
                    );
                    self.publish(SubscriptionState::Unsubscribed, attempt + 1, Some(err.to_string()));
                    return;
                }
                Err(err) => Some(err.to_string()),
            };

            attempt = attempt.saturating_add(1);
            if self.config.retries_exhausted(attempt) {
                tracing::error!(
                    "[ContextSubscriptionManager] giving up on {} after {} attempts",
                    self.scope,
                    attempt
                );
                self.publish(SubscriptionState::Unsubscribed, attempt, last_error);
                return;
            }

            let delay = self.next_delay(attempt);
            tracing::warn!(
                "[ContextSubscriptionManager] retrying {} in {:?} (attempt {}): {}",
                self.scope,
                delay,
                attempt,
                last_error.as_deref().unwrap_or("subscription closed")
            );
            self.publish(SubscriptionState::Subscribing, attempt, last_error);

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn deliver(&self, mut subscription: PushSubscription) -> DeliveryEnd {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return DeliveryEnd::Cancelled,
                next = subscription.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if self.conversation.forward_push(event).await.is_err() {
                        return DeliveryEnd::ConversationClosed;
                    }
                }
                Some(Err(err)) => return DeliveryEnd::Interrupted(Some(err.to_string())),
                None => return DeliveryEnd::Interrupted(None),
            }
        }
    }

    fn next_delay(&mut self, attempt: u32) -> Duration {
        let jitter_unit = self.rng.gen_range(0.0..=1.0);
        self.config.delay_for(attempt, jitter_unit)
    }

    fn publish(&self, state: SubscriptionState, attempt: u32, last_error: Option<String>) {
        self.status.send_replace(SubscriptionStatus {
            scope: Some(self.scope.clone()),
            state,
            attempt,
            last_error,
        });
    }
}
