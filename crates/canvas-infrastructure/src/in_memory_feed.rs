//! In-process push feed backed by a tokio broadcast channel.
//!
//! Every published event fans out to all subscriptions; each subscription
//! forwards only the events of its own scope. Tests can inject establishment
//! failures, interrupt live subscriptions and duplicate deliveries to mimic an
//! at-least-once feed.

use async_trait::async_trait;
use canvas_core::feed::{PushFeed, PushSubscription};
use canvas_core::message::{PushEvent, ScopeKey};
use canvas_core::{CanvasError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum FeedSignal {
    Event(PushEvent),
    Interrupt,
}

#[derive(Debug)]
struct FeedInner {
    signals: broadcast::Sender<FeedSignal>,
    capacity: usize,
    subscribe_failures: Mutex<VecDeque<CanvasError>>,
    duplicate_deliveries: AtomicBool,
    subscribe_calls: AtomicUsize,
}

/// Push feed kept in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryPushFeed {
    inner: Arc<FeedInner>,
}

impl InMemoryPushFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (signals, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(FeedInner {
                signals,
                capacity,
                subscribe_failures: Mutex::new(VecDeque::new()),
                duplicate_deliveries: AtomicBool::new(false),
                subscribe_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Delivers `event` to every subscription of its scope.
    ///
    /// Returns the number of live subscriptions the event was offered to.
    pub fn publish(&self, event: PushEvent) -> usize {
        self.inner
            .signals
            .send(FeedSignal::Event(event))
            .unwrap_or(0)
    }

    /// Makes the next `subscribe` call fail with `error`.
    pub fn fail_next_subscribe(&self, error: CanvasError) {
        if let Ok(mut failures) = self.inner.subscribe_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Fails every live subscription with a transient error.
    pub fn interrupt_all(&self) {
        let _ = self.inner.signals.send(FeedSignal::Interrupt);
    }

    /// Delivers every event twice while enabled.
    pub fn set_duplicate_deliveries(&self, enabled: bool) {
        self.inner
            .duplicate_deliveries
            .store(enabled, Ordering::SeqCst);
    }

    /// Live subscriptions, including ones whose consumer has not yet noticed a
    /// teardown.
    pub fn subscriber_count(&self) -> usize {
        self.inner.signals.receiver_count()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Option<CanvasError> {
        self.inner
            .subscribe_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front())
    }
}

impl Default for InMemoryPushFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushFeed for InMemoryPushFeed {
    async fn subscribe(&self, scope: &ScopeKey) -> Result<PushSubscription> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            tracing::debug!("[InMemoryPushFeed] injected subscribe failure: {}", error);
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let signals = self.inner.signals.subscribe();
        let inner = self.inner.clone();
        tokio::spawn(forward(signals, tx, scope.clone(), inner));
        tracing::debug!("[InMemoryPushFeed] subscribed {}", scope);
        Ok(PushSubscription::new(scope.clone(), rx))
    }
}

async fn forward(
    mut signals: broadcast::Receiver<FeedSignal>,
    tx: mpsc::Sender<Result<PushEvent>>,
    scope: ScopeKey,
    inner: Arc<FeedInner>,
) {
    loop {
        let signal = tokio::select! {
            _ = tx.closed() => break,
            signal = signals.recv() => signal,
        };
        match signal {
            Ok(FeedSignal::Event(event)) => {
                if !event.record.belongs_to(&scope) {
                    continue;
                }
                let copies = if inner.duplicate_deliveries.load(Ordering::SeqCst) {
                    2
                } else {
                    1
                };
                for _ in 0..copies {
                    if tx.send(Ok(event.clone())).await.is_err() {
                        return;
                    }
                }
            }
            Ok(FeedSignal::Interrupt) => {
                let _ = tx.send(Err(CanvasError::transient("push feed interrupted"))).await;
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let _ = tx
                    .send(Err(CanvasError::transient(format!(
                        "push feed lagged by {} events",
                        skipped
                    ))))
                    .await;
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("[InMemoryPushFeed] subscription {} closed", scope);
}
