//! In-process durable store.
//!
//! Assigns uuid ids and strictly increasing `created_at` timestamps, keeps
//! the draft's `client_ref`, and echoes every write to an attached
//! [`InMemoryPushFeed`].

use async_trait::async_trait;
use canvas_core::message::{Message, MessageDraft, MessagePatch, PushEvent, ScopeKey, ScopeType};
use canvas_core::store::MessageStore;
use canvas_core::{CanvasError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::in_memory_feed::InMemoryPushFeed;

/// Store operation targeted by failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Fetch,
    Update,
    Delete,
    Query,
}

/// Durable store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    records: RwLock<HashMap<String, Message>>,
    last_created_at: Mutex<Option<DateTime<Utc>>>,
    feed: Option<InMemoryPushFeed>,
    failures: Mutex<HashMap<StoreOp, VecDeque<CanvasError>>>,
    create_delay: Mutex<Option<Duration>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that echoes every write to `feed`.
    pub fn with_feed(feed: InMemoryPushFeed) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, error: CanvasError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.entry(op).or_default().push_back(error);
        }
    }

    /// Delays every `create` call, after the echo has been published.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        if let Ok(mut current) = self.create_delay.lock() {
            *current = delay;
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn injected(&self, op: StoreOp) -> Result<()> {
        let failure = self
            .failures
            .lock()
            .map_err(|_| CanvasError::internal("failure queue poisoned"))?
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(error) => {
                tracing::debug!("[InMemoryMessageStore] injected {:?} failure: {}", op, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn next_created_at(&self) -> Result<DateTime<Utc>> {
        let mut last = self
            .last_created_at
            .lock()
            .map_err(|_| CanvasError::internal("clock poisoned"))?;
        let now = Utc::now();
        let next = match *last {
            Some(previous) if now <= previous => previous + ChronoDuration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        Ok(next)
    }

    fn echo(&self, event: PushEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(event);
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, draft: &MessageDraft) -> Result<String> {
        self.injected(StoreOp::Create)?;

        let id = Uuid::new_v4().to_string();
        let record = Message::from_draft(id.clone(), draft, self.next_created_at()?);
        self.records.write().await.insert(id.clone(), record.clone());
        tracing::debug!("[InMemoryMessageStore] created '{}' ({:?})", id, record.client_ref);
        self.echo(PushEvent::insert(record));

        let delay = self.create_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Message>> {
        self.injected(StoreOp::Fetch)?;
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: &MessagePatch) -> Result<Message> {
        self.injected(StoreOp::Update)?;
        let updated = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| CanvasError::not_found("Message", id))?;
            patch.apply_to(record);
            record.clone()
        };
        self.echo(PushEvent::update(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.injected(StoreOp::Delete)?;
        let removed = self.records.write().await.remove(id);
        match removed {
            Some(record) => {
                self.echo(PushEvent::delete(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(&self, scope_type: ScopeType, scope_id: Option<&str>) -> Result<Vec<Message>> {
        self.injected(StoreOp::Query)?;
        let scope = ScopeKey::new(scope_type, scope_id.map(str::to_string));
        let mut records: Vec<Message> = self
            .records
            .read()
            .await
            .values()
            .filter(|m| m.belongs_to(&scope))
            .cloned()
            .collect();
        records.sort_by_key(|m| m.created_at);
        Ok(records)
    }
}
