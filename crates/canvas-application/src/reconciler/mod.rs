//! Identity reconciliation.
//!
//! `IdentityReconciler` owns the canonical message list of a conversation and
//! merges three racing write paths into it:
//!
//! - optimistic user writes, later confirmed by the durable store
//! - stream placeholders, later finalized into durable assistant replies
//! - the push feed, which echoes every durable write (including our own)
//!
//! Every event is idempotent. Duplicate or out-of-order events are no-ops, not
//! errors; the returned [`ReconcileOutcome`] says what happened. Whichever
//! event establishes a durable id first owns that id's slot in the list.

mod ledger;

pub use ledger::{BoundedIdSet, Settlement, SettlementKind, SettlementLedger};

use canvas_core::config::ReconcilerConfig;
use canvas_core::message::{Message, MessageDraft, PushEvent, PushOp, ScopeKey};
use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;

/// Which local write path created a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalKind {
    Optimistic,
    Stream,
}

/// Client-side key of an entry: a temporary id or a stream session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LocalRef {
    pub kind: LocalKind,
    pub id: String,
}

/// One row of the canonical list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalEntry {
    pub message: Message,
    pub local_ref: Option<LocalRef>,
    /// `false` while the entry is an optimistic write or a stream placeholder.
    pub durable: bool,
    #[serde(skip)]
    slot: u64,
    /// Durable id announced for a stream before it finished.
    #[serde(skip)]
    bound_id: Option<String>,
}

impl CanonicalEntry {
    fn is_local(&self, kind: LocalKind, id: &str) -> bool {
        self.local_ref
            .as_ref()
            .is_some_and(|r| r.kind == kind && r.id == id)
    }

    /// Whether a durable record with this id/client_ref belongs to this pending entry.
    fn adopts(&self, record: &Message) -> bool {
        if self.durable {
            return false;
        }
        let by_client_ref = match (&self.local_ref, &record.client_ref) {
            (Some(local), Some(client_ref)) => &local.id == client_ref,
            _ => false,
        };
        by_client_ref || self.bound_id.as_deref() == Some(record.id.as_str())
    }

    fn order_key(&self) -> (bool, chrono::DateTime<Utc>, u64) {
        // Durable entries first in created_at order, then pending entries in
        // the order they were added.
        if self.durable {
            (false, self.message.created_at, self.slot)
        } else {
            (true, chrono::DateTime::<Utc>::MIN_UTC, self.slot)
        }
    }
}

/// Why an event did not change the canonical list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IgnoreReason {
    /// The id is already in the list.
    AlreadyPresent,
    /// The id is inside its settlement window.
    Settled,
    /// The event belongs to an aborted stream session.
    Aborted,
    /// The record belongs to a scope this reconciler does not track.
    OutOfScope,
    /// Nothing in the list is keyed by the referenced id.
    UnknownKey,
    /// The record matches what is already in the list.
    Unchanged,
    /// The event contradicts an established identity and was dropped.
    Conflict,
}

/// What an event did to the canonical list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Inserted { id: String },
    Replaced { previous_id: String, id: String },
    Updated { id: String },
    Removed { id: String },
    Ignored { reason: IgnoreReason },
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Ignored { .. })
    }

    pub fn ignored(reason: IgnoreReason) -> Self {
        Self::Ignored { reason }
    }
}

/// Single owner of the canonical list and the settlement ledger.
#[derive(Debug)]
pub struct IdentityReconciler {
    /// `None` aggregates every scope.
    scope_filter: Option<ScopeKey>,
    entries: Vec<CanonicalEntry>,
    ledger: SettlementLedger,
    aborted: BoundedIdSet,
    next_slot: u64,
}

impl IdentityReconciler {
    pub fn new(scope_filter: Option<ScopeKey>, config: &ReconcilerConfig) -> Self {
        Self {
            scope_filter,
            entries: Vec::new(),
            ledger: SettlementLedger::new(config.settlement_window(), config.ledger_capacity),
            aborted: BoundedIdSet::new(config.aborted_capacity),
            next_slot: 0,
        }
    }

    // ============================================================================
    // Read access
    // ============================================================================

    pub fn scope_filter(&self) -> Option<&ScopeKey> {
        self.scope_filter.as_ref()
    }

    pub fn entries(&self) -> &[CanonicalEntry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries
            .iter()
            .find(|e| e.message.id == id)
            .map(|e| &e.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.durable).count()
    }

    pub fn is_aborted(&self, session_id: &str) -> bool {
        self.aborted.contains(session_id)
    }

    pub fn settled_count(&self) -> usize {
        self.ledger.len()
    }

    // ============================================================================
    // Optimistic writes
    // ============================================================================

    /// Appends a user draft under its temporary id.
    pub fn apply_optimistic(&mut self, temp_id: &str, draft: &MessageDraft) -> ReconcileOutcome {
        self.insert_pending(LocalKind::Optimistic, temp_id, draft)
    }

    /// Replaces the optimistic entry with the durable record.
    pub fn apply_durable_confirmation(&mut self, temp_id: &str, record: Message) -> ReconcileOutcome {
        self.settle_local(LocalKind::Optimistic, temp_id, record)
    }

    /// Rolls back an optimistic entry whose durable write failed.
    pub fn apply_durability_failure(&mut self, temp_id: &str) -> ReconcileOutcome {
        let outcome = self.remove_pending(LocalKind::Optimistic, temp_id);
        tracing::warn!(
            "[IdentityReconciler] durable write failed for '{}', rolled back: {:?}",
            temp_id,
            outcome
        );
        outcome
    }

    // ============================================================================
    // Stream placeholders
    // ============================================================================

    pub fn apply_stream_placeholder(&mut self, session_id: &str, draft: &MessageDraft) -> ReconcileOutcome {
        if self.aborted.contains(session_id) {
            return ReconcileOutcome::ignored(IgnoreReason::Aborted);
        }
        self.insert_pending(LocalKind::Stream, session_id, draft)
    }

    /// Mirrors the live stream buffer into the placeholder's content.
    pub fn apply_stream_progress(&mut self, session_id: &str, content: &str) -> ReconcileOutcome {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| !e.durable && e.is_local(LocalKind::Stream, session_id))
        else {
            return ReconcileOutcome::ignored(IgnoreReason::UnknownKey);
        };
        if entry.message.content == content {
            return ReconcileOutcome::ignored(IgnoreReason::Unchanged);
        }
        entry.message.content = content.to_string();
        ReconcileOutcome::Updated {
            id: session_id.to_string(),
        }
    }

    /// Records the durable id of a stream that is still generating.
    ///
    /// A push insert for `message_id` will then take over the placeholder
    /// instead of adding a second row.
    pub fn bind_stream_message_id(&mut self, session_id: &str, message_id: &str) -> ReconcileOutcome {
        let now = self.tick();
        if let Some(bound) = self.ledger.bound_message_id(session_id, now) {
            return if bound == message_id {
                ReconcileOutcome::ignored(IgnoreReason::Settled)
            } else {
                self.conflict(session_id, &bound.to_string(), message_id)
            };
        }

        let Some(pos) = self.position_local(LocalKind::Stream, session_id) else {
            return ReconcileOutcome::ignored(IgnoreReason::UnknownKey);
        };
        if let Some(existing) = self.entries[pos].bound_id.clone() {
            return if existing == message_id {
                ReconcileOutcome::ignored(IgnoreReason::Unchanged)
            } else {
                self.conflict(session_id, &existing, message_id)
            };
        }

        if self.position_id(message_id).is_some() {
            // The push feed delivered the record already; it owns the slot.
            self.entries.remove(pos);
            self.ledger.settle(Some(session_id), message_id, now);
            return ReconcileOutcome::Removed {
                id: session_id.to_string(),
            };
        }

        self.entries[pos].bound_id = Some(message_id.to_string());
        ReconcileOutcome::Updated {
            id: session_id.to_string(),
        }
    }

    pub fn apply_stream_finalization(&mut self, session_id: &str, record: Message) -> ReconcileOutcome {
        if self.aborted.contains(session_id) {
            return ReconcileOutcome::ignored(IgnoreReason::Aborted);
        }
        self.settle_local(LocalKind::Stream, session_id, record)
    }

    /// Removes the placeholder of an aborted stream and blacklists the session.
    pub fn apply_stream_abort(&mut self, session_id: &str) -> ReconcileOutcome {
        self.aborted.insert(session_id);
        self.remove_pending(LocalKind::Stream, session_id)
    }

    // ============================================================================
    // Local edits and deletes (acknowledged by the durable store)
    // ============================================================================

    pub fn apply_local_update(&mut self, record: Message) -> ReconcileOutcome {
        let now = self.tick();
        let outcome = self.update_in_place(record.clone());
        self.ledger.settle(None, &record.id, now);
        outcome
    }

    pub fn apply_local_delete(&mut self, message_id: &str) -> ReconcileOutcome {
        let now = self.tick();
        match self.position_id(message_id) {
            Some(pos) => {
                let removed = self.entries.remove(pos);
                let local_id = removed.local_ref.map(|r| r.id);
                self.ledger.tombstone(local_id.as_deref(), message_id, now);
                ReconcileOutcome::Removed {
                    id: message_id.to_string(),
                }
            }
            None => {
                self.ledger.tombstone(None, message_id, now);
                ReconcileOutcome::ignored(IgnoreReason::UnknownKey)
            }
        }
    }

    // ============================================================================
    // Push feed
    // ============================================================================

    pub fn apply_push_event(&mut self, event: PushEvent) -> ReconcileOutcome {
        let now = self.tick();
        let PushEvent { op, record } = event;

        if !self.in_scope(&record) {
            return ReconcileOutcome::ignored(IgnoreReason::OutOfScope);
        }
        if record
            .client_ref
            .as_deref()
            .is_some_and(|r| self.aborted.contains(r))
        {
            tracing::debug!(
                "[IdentityReconciler] discarding push {} for aborted session {:?}",
                op,
                record.client_ref
            );
            return ReconcileOutcome::ignored(IgnoreReason::Aborted);
        }

        let outcome = match op {
            PushOp::Insert | PushOp::Update => {
                if self.ledger.contains(&record.id, now) {
                    ReconcileOutcome::ignored(IgnoreReason::Settled)
                } else if self.position_id(&record.id).is_some() {
                    if op == PushOp::Insert {
                        ReconcileOutcome::ignored(IgnoreReason::AlreadyPresent)
                    } else {
                        self.update_in_place(record)
                    }
                } else if let Some(pos) = self.entries.iter().position(|e| e.adopts(&record)) {
                    self.adopt(pos, record, now)
                } else {
                    self.insert_durable(record)
                }
            }
            PushOp::Delete => self.push_delete(record, now),
        };

        tracing::debug!("[IdentityReconciler] push {} -> {:?}", op, outcome);
        outcome
    }

    /// Seeds the list with records loaded from the store.
    pub fn apply_history(&mut self, records: Vec<Message>) -> usize {
        records
            .into_iter()
            .map(|record| self.apply_push_event(PushEvent::insert(record)))
            .filter(ReconcileOutcome::is_applied)
            .count()
    }

    // ============================================================================
    // Internals
    // ============================================================================

    fn tick(&mut self) -> Instant {
        let now = Instant::now();
        self.ledger.purge(now);
        now
    }

    fn in_scope(&self, record: &Message) -> bool {
        self.scope_filter
            .as_ref()
            .is_none_or(|scope| record.belongs_to(scope))
    }

    fn position_id(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn position_local(&self, kind: LocalKind, local_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.durable && e.is_local(kind, local_id))
    }

    fn next_slot(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn insert_pending(&mut self, kind: LocalKind, local_id: &str, draft: &MessageDraft) -> ReconcileOutcome {
        let now = self.tick();
        if self.ledger.contains(local_id, now) {
            return ReconcileOutcome::ignored(IgnoreReason::Settled);
        }
        if self.position_id(local_id).is_some()
            || self.entries.iter().any(|e| e.is_local(kind, local_id))
        {
            return ReconcileOutcome::ignored(IgnoreReason::AlreadyPresent);
        }
        if self
            .scope_filter
            .as_ref()
            .is_some_and(|scope| &draft.scope != scope)
        {
            return ReconcileOutcome::ignored(IgnoreReason::OutOfScope);
        }

        let mut draft = draft.clone();
        draft.client_ref = Some(local_id.to_string());
        let slot = self.next_slot();
        self.entries.push(CanonicalEntry {
            message: Message::from_draft(local_id, &draft, Utc::now()),
            local_ref: Some(LocalRef {
                kind,
                id: local_id.to_string(),
            }),
            durable: false,
            slot,
            bound_id: None,
        });
        self.normalize();
        ReconcileOutcome::Inserted {
            id: local_id.to_string(),
        }
    }

    fn remove_pending(&mut self, kind: LocalKind, local_id: &str) -> ReconcileOutcome {
        match self.position_local(kind, local_id) {
            Some(pos) => {
                self.entries.remove(pos);
                ReconcileOutcome::Removed {
                    id: local_id.to_string(),
                }
            }
            None => ReconcileOutcome::ignored(IgnoreReason::UnknownKey),
        }
    }

    /// Resolves a local key to its durable record (confirmation/finalization).
    fn settle_local(&mut self, kind: LocalKind, local_id: &str, record: Message) -> ReconcileOutcome {
        let now = self.tick();

        let deleted = self
            .ledger
            .lookup(&record.id, now)
            .is_some_and(|s| s.kind == SettlementKind::Tombstone);
        if deleted {
            // The delete reached us before the confirmation; it stays deleted.
            if let Some(pos) = self.position_local(kind, local_id) {
                self.entries.remove(pos);
            }
            if let Some(pos) = self.position_id(&record.id) {
                self.entries.remove(pos);
            }
            self.ledger.tombstone(Some(local_id), &record.id, now);
            tracing::debug!(
                "[IdentityReconciler] '{}' resolved to deleted '{}', dropping",
                local_id,
                record.id
            );
            return ReconcileOutcome::ignored(IgnoreReason::Settled);
        }

        if let Some(bound) = self.ledger.bound_message_id(local_id, now) {
            if bound != record.id {
                let bound = bound.to_string();
                return self.conflict(local_id, &bound, &record.id);
            }
            // Already resolved (possibly by a push echo). The record fetched
            // for our own write is authoritative for content.
            return match self.position_id(&record.id) {
                Some(pos) if !self.entries[pos].message.same_payload(&record) => {
                    let id = record.id.clone();
                    self.entries[pos].message = record;
                    self.normalize();
                    ReconcileOutcome::Updated { id }
                }
                _ => ReconcileOutcome::ignored(IgnoreReason::Settled),
            };
        }

        let local_pos = self.position_local(kind, local_id);
        let early_bound = local_pos.and_then(|pos| self.entries[pos].bound_id.clone());
        if let Some(bound) = early_bound.filter(|bound| *bound != record.id) {
            return self.conflict(local_id, &bound, &record.id);
        }

        let outcome = match (local_pos, self.position_id(&record.id)) {
            (Some(pos), None) => {
                let entry = &mut self.entries[pos];
                entry.message = record.clone();
                entry.durable = true;
                ReconcileOutcome::Replaced {
                    previous_id: local_id.to_string(),
                    id: record.id.clone(),
                }
            }
            (Some(pos), Some(existing)) => {
                // The durable id reached the list first (push echo without a
                // client_ref); that row keeps its slot.
                self.entries[existing].message = record.clone();
                self.entries.remove(pos);
                ReconcileOutcome::Removed {
                    id: local_id.to_string(),
                }
            }
            (None, Some(existing)) => {
                if self.entries[existing].message.same_payload(&record) {
                    ReconcileOutcome::ignored(IgnoreReason::AlreadyPresent)
                } else {
                    self.entries[existing].message = record.clone();
                    ReconcileOutcome::Updated {
                        id: record.id.clone(),
                    }
                }
            }
            (None, None) => {
                if self.in_scope(&record) {
                    self.insert_durable(record.clone())
                } else {
                    ReconcileOutcome::ignored(IgnoreReason::OutOfScope)
                }
            }
        };

        self.ledger.settle(Some(local_id), &record.id, now);
        self.normalize();
        tracing::debug!(
            "[IdentityReconciler] settled {:?} '{}' -> '{}': {:?}",
            kind,
            local_id,
            record.id,
            outcome
        );
        outcome
    }

    fn adopt(&mut self, pos: usize, record: Message, now: Instant) -> ReconcileOutcome {
        let entry = &mut self.entries[pos];
        let previous_id = entry.message.id.clone();
        let local_id = entry.local_ref.as_ref().map(|r| r.id.clone());
        let id = record.id.clone();
        entry.message = record;
        entry.durable = true;
        self.ledger.settle(local_id.as_deref(), &id, now);
        self.normalize();
        ReconcileOutcome::Replaced { previous_id, id }
    }

    fn insert_durable(&mut self, record: Message) -> ReconcileOutcome {
        let id = record.id.clone();
        let slot = self.next_slot();
        self.entries.push(CanonicalEntry {
            message: record,
            local_ref: None,
            durable: true,
            slot,
            bound_id: None,
        });
        self.normalize();
        ReconcileOutcome::Inserted { id }
    }

    fn update_in_place(&mut self, record: Message) -> ReconcileOutcome {
        let Some(pos) = self.position_id(&record.id) else {
            return if self.in_scope(&record) {
                self.insert_durable(record)
            } else {
                ReconcileOutcome::ignored(IgnoreReason::OutOfScope)
            };
        };
        let current = &self.entries[pos].message;
        if current.same_payload(&record) && current.scope_version_ref == record.scope_version_ref {
            return ReconcileOutcome::ignored(IgnoreReason::Unchanged);
        }
        let id = record.id.clone();
        self.entries[pos].message = record;
        self.normalize();
        ReconcileOutcome::Updated { id }
    }

    fn push_delete(&mut self, record: Message, now: Instant) -> ReconcileOutcome {
        let removed = self
            .position_id(&record.id)
            .or_else(|| self.entries.iter().position(|e| e.adopts(&record)))
            .map(|pos| self.entries.remove(pos));

        let local_id = removed
            .as_ref()
            .and_then(|e| e.local_ref.as_ref())
            .map(|r| r.id.clone())
            .or(record.client_ref);
        self.ledger.tombstone(local_id.as_deref(), &record.id, now);

        match removed {
            Some(entry) => ReconcileOutcome::Removed {
                id: entry.message.id,
            },
            None => ReconcileOutcome::ignored(IgnoreReason::UnknownKey),
        }
    }

    fn conflict(&self, local_id: &str, existing: &str, incoming: &str) -> ReconcileOutcome {
        let err = canvas_core::CanvasError::IdentityConflict {
            local_id: local_id.to_string(),
            existing: existing.to_string(),
            incoming: incoming.to_string(),
        };
        tracing::warn!("[IdentityReconciler] dropping event: {}", err);
        ReconcileOutcome::ignored(IgnoreReason::Conflict)
    }

    /// Stable sort: durable rows by `created_at`, ties by insertion slot, then
    /// pending rows in insertion order.
    fn normalize(&mut self) {
        self.entries.sort_by_key(CanonicalEntry::order_key);
    }
}
