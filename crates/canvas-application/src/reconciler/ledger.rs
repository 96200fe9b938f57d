//! Settlement bookkeeping for the reconciler.
//!
//! A settlement remembers that a local id (temporary id or stream session id)
//! resolved to a durable id, or that a durable id was deleted. While a
//! settlement is alive, push echoes that reference either id are suppressed.
//! Settlements expire after a fixed window and the ledger is also capped in
//! size, so a long conversation cannot grow it without bound.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    /// A local id resolved to a durable id, or a durable id was confirmed.
    Settled,
    /// The durable id was deleted.
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub local_id: Option<String>,
    pub message_id: String,
    pub kind: SettlementKind,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct SettlementLedger {
    window: Duration,
    capacity: usize,
    /// Local and durable ids -> sequence number of their settlement.
    index: HashMap<String, u64>,
    records: HashMap<u64, Settlement>,
    /// Sequence numbers in insertion order. Expiry order matches insertion
    /// order because every settlement gets the same window.
    order: VecDeque<u64>,
    next_seq: u64,
}

impl SettlementLedger {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            index: HashMap::new(),
            records: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records that `local_id` (if any) resolved to `message_id`.
    pub fn settle(&mut self, local_id: Option<&str>, message_id: &str, now: Instant) {
        self.push(local_id, message_id, SettlementKind::Settled, now);
    }

    /// Records that `message_id` was deleted, together with the local id the
    /// record was known under, if any.
    pub fn tombstone(&mut self, local_id: Option<&str>, message_id: &str, now: Instant) {
        self.push(local_id, message_id, SettlementKind::Tombstone, now);
    }

    /// Live settlement referencing `id` as either its local or durable id.
    pub fn lookup(&self, id: &str, now: Instant) -> Option<&Settlement> {
        let seq = self.index.get(id)?;
        self.records
            .get(seq)
            .filter(|settlement| settlement.expires_at > now)
    }

    pub fn contains(&self, id: &str, now: Instant) -> bool {
        self.lookup(id, now).is_some()
    }

    /// The durable id a local id settled to, while the settlement is alive.
    pub fn bound_message_id(&self, local_id: &str, now: Instant) -> Option<&str> {
        self.lookup(local_id, now)
            .filter(|s| s.local_id.as_deref() == Some(local_id))
            .map(|s| s.message_id.as_str())
    }

    /// Drops expired settlements.
    pub fn purge(&mut self, now: Instant) {
        while self
            .order
            .front()
            .and_then(|seq| self.records.get(seq))
            .is_some_and(|settlement| settlement.expires_at <= now)
        {
            self.pop_front();
        }
    }

    fn push(&mut self, local_id: Option<&str>, message_id: &str, kind: SettlementKind, now: Instant) {
        self.purge(now);
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(local_id) = local_id {
            self.index.insert(local_id.to_string(), seq);
        }
        self.index.insert(message_id.to_string(), seq);
        self.records.insert(
            seq,
            Settlement {
                local_id: local_id.map(str::to_string),
                message_id: message_id.to_string(),
                kind,
                expires_at: now + self.window,
            },
        );
        self.order.push_back(seq);

        while self.order.len() > self.capacity {
            self.pop_front();
        }
    }

    fn pop_front(&mut self) {
        let Some(seq) = self.order.pop_front() else {
            return;
        };
        let Some(settlement) = self.records.remove(&seq) else {
            return;
        };
        let ids = settlement
            .local_id
            .iter()
            .chain(std::iter::once(&settlement.message_id));
        for id in ids {
            if self.index.get(id) == Some(&seq) {
                self.index.remove(id);
            }
        }
    }
}

/// Bounded set of ids, evicting the oldest entry first.
#[derive(Debug, Default)]
pub struct BoundedIdSet {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl BoundedIdSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(dropped) = self.order.pop_front() {
                self.seen.remove(&dropped);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(5);

    #[test]
    fn settled_pair_is_found_by_either_id() {
        let now = Instant::now();
        let mut ledger = SettlementLedger::new(WINDOW, 16);
        ledger.settle(Some("s1"), "m2", now);

        assert!(ledger.contains("s1", now));
        assert!(ledger.contains("m2", now));
        assert_eq!(ledger.bound_message_id("s1", now), Some("m2"));
        assert_eq!(ledger.bound_message_id("m2", now), None);
        assert!(!ledger.contains("m3", now));
    }

    #[test]
    fn settlements_expire_after_window() {
        let start = Instant::now();
        let mut ledger = SettlementLedger::new(WINDOW, 16);
        ledger.settle(Some("tmp-1"), "m1", start);

        assert!(ledger.contains("m1", start + Duration::from_secs(4)));
        assert!(!ledger.contains("m1", start + WINDOW));

        ledger.purge(start + WINDOW);
        assert!(ledger.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let now = Instant::now();
        let mut ledger = SettlementLedger::new(WINDOW, 2);
        ledger.settle(Some("a"), "m-a", now);
        ledger.settle(Some("b"), "m-b", now);
        ledger.tombstone(None, "m-c", now);

        assert_eq!(ledger.len(), 2);
        assert!(!ledger.contains("a", now));
        assert!(!ledger.contains("m-a", now));
        assert!(ledger.contains("m-b", now));
        assert_eq!(ledger.lookup("m-c", now).unwrap().kind, SettlementKind::Tombstone);
    }

    #[test]
    fn resettling_an_id_keeps_latest_entry() {
        let start = Instant::now();
        let mut ledger = SettlementLedger::new(WINDOW, 16);
        ledger.settle(None, "m1", start);
        let later = start + Duration::from_secs(3);
        ledger.tombstone(None, "m1", later);

        // The first settlement expiring must not unindex the newer tombstone.
        let after_first = start + WINDOW;
        ledger.purge(after_first);
        assert_eq!(
            ledger.lookup("m1", after_first).unwrap().kind,
            SettlementKind::Tombstone
        );
    }

    #[test]
    fn tombstone_keeps_local_binding() {
        let now = Instant::now();
        let mut ledger = SettlementLedger::new(WINDOW, 16);
        ledger.tombstone(Some("tmp-1"), "m1", now);

        assert_eq!(ledger.bound_message_id("tmp-1", now), Some("m1"));
        assert_eq!(ledger.lookup("tmp-1", now).unwrap().kind, SettlementKind::Tombstone);
        assert_eq!(ledger.lookup("m1", now).unwrap().kind, SettlementKind::Tombstone);
    }

    #[test]
    fn bounded_id_set_reaccepts_evicted_ids() {
        let mut set = BoundedIdSet::new(2);
        assert!(set.insert("s1"));
        assert!(set.insert("s2"));
        assert!(!set.insert("s1"));
        assert!(set.insert("s3"));
        assert!(!set.contains("s1"));
        assert!(set.insert("s1"));
        assert_eq!(set.len(), 2);
    }
}
