//! Ordered store of pending local mutations.
//!
//! Items leave in FIFO order of `enqueued_at`. Rapid edits to the same entity
//! collapse into one item, dequeued items are marked in flight until the
//! coordinator acknowledges, retries, defers or releases them, and the whole
//! queue can be snapshotted for persistence.
//!
//! All methods take `&self`; the queue is shared between the producer side
//! (`queue_mutation`) and the sync round behind an internal mutex.

use offsync_core::{now_millis, OfsResult, Operation, SyncError, SyncItem};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Snapshot format version written to `queue.json`.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A mutation to be enqueued. The payload is already encrypted.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub operation: Operation,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Vec<u8>,
    pub checksum: String,
}

/// Result of [`SyncQueue::enqueue_at`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub id: String,
    /// The mutation replaced the payload of an existing item
    pub coalesced: bool,
}

/// Result of [`SyncQueue::mark_retry_at`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { attempt: u32, next_eligible_at: u64 },
    /// The attempt limit was reached and the item was removed
    Exhausted(SyncItem),
    /// No such item (already acknowledged or dropped)
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub items: Vec<SyncItem>,
}

impl QueueSnapshot {
    pub fn to_bytes(&self) -> OfsResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> OfsResult<Self> {
        let snapshot: QueueSnapshot = serde_json::from_slice(data)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SyncError::Store(format!(
                "queue snapshot version {} is newer than supported {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

type EntityKey = (String, String);

fn key_of(item: &SyncItem) -> EntityKey {
    (item.entity_type.clone(), item.entity_id.clone())
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, SyncItem>,
    /// Insertion order of item ids
    order: Vec<String>,
    /// Newest queued item per (entity_type, entity_id), any operation
    latest: HashMap<EntityKey, String>,
    in_flight: HashSet<String>,
}

impl Inner {
    fn insert(&mut self, item: SyncItem) {
        self.latest.insert(key_of(&item), item.id.clone());
        self.order.push(item.id.clone());
        self.items.insert(item.id.clone(), item);
    }

    fn take(&mut self, id: &str) -> Option<SyncItem> {
        let item = self.items.remove(id)?;
        self.order.retain(|other| other != id);
        self.in_flight.remove(id);
        let key = key_of(&item);
        if self.latest.get(&key).map(String::as_str) == Some(id) {
            self.latest.remove(&key);
        }
        Some(item)
    }

    /// Items in FIFO order of `enqueued_at`; ties keep insertion order.
    fn ordered(&self) -> Vec<&SyncItem> {
        let mut out: Vec<&SyncItem> = self
            .order
            .iter()
            .filter_map(|id| self.items.get(id))
            .collect();
        out.sort_by_key(|item| item.enqueued_at);
        out
    }
}

pub struct SyncQueue {
    inner: Mutex<Inner>,
    coalesce_window_ms: u64,
}

impl SyncQueue {
    pub fn new(coalesce_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            coalesce_window_ms: coalesce_window.as_millis() as u64,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, item: NewItem) -> String {
        self.enqueue_at(item, now_millis()).id
    }

    /// Append a mutation, or fold it into the newest pending item for the
    /// same entity when that item has the same operation, was last modified
    /// within the coalescing window and is not currently in flight.
    ///
    /// Only the newest item of an entity is ever rewritten, so a later
    /// mutation never moves ahead of a different operation queued in between.
    pub fn enqueue_at(&self, item: NewItem, now: u64) -> Enqueued {
        let mut inner = self.lock();
        let key = (item.entity_type.clone(), item.entity_id.clone());

        if let Some(existing_id) = inner.latest.get(&key).cloned() {
            let in_flight = inner.in_flight.contains(&existing_id);
            if let Some(existing) = inner.items.get_mut(&existing_id) {
                if !in_flight
                    && existing.operation == item.operation
                    && now.saturating_sub(existing.modified_at) <= self.coalesce_window_ms
                {
                    existing.payload = item.payload;
                    existing.checksum = item.checksum;
                    existing.modified_at = now.max(existing.modified_at);
                    existing.attempt = 0;
                    existing.next_eligible_at = now;
                    debug!(
                        item_id = %existing_id,
                        entity_type = %existing.entity_type,
                        entity_id = %existing.entity_id,
                        "coalesced mutation into pending item"
                    );
                    return Enqueued {
                        id: existing_id,
                        coalesced: true,
                    };
                }
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        inner.insert(SyncItem {
            id: id.clone(),
            operation: item.operation,
            entity_type: item.entity_type,
            entity_id: item.entity_id,
            payload: item.payload,
            checksum: item.checksum,
            enqueued_at: now,
            modified_at: now,
            attempt: 0,
            next_eligible_at: now,
        });
        Enqueued {
            id,
            coalesced: false,
        }
    }

    pub fn dequeue(&self, batch_size: usize) -> Vec<SyncItem> {
        self.dequeue_at(batch_size, now_millis())
    }

    /// Up to `batch_size` eligible items, oldest first, marked in flight.
    pub fn dequeue_at(&self, batch_size: usize, now: u64) -> Vec<SyncItem> {
        self.take_eligible(batch_size, now, |_| true)
    }

    pub fn dequeue_since(&self, batch_size: usize, since: u64) -> Vec<SyncItem> {
        self.dequeue_since_at(batch_size, since, now_millis())
    }

    /// Like [`dequeue_at`](Self::dequeue_at), restricted to items enqueued at
    /// or after `since`.
    pub fn dequeue_since_at(&self, batch_size: usize, since: u64, now: u64) -> Vec<SyncItem> {
        self.take_eligible(batch_size, now, |item| item.enqueued_at >= since)
    }

    fn take_eligible(
        &self,
        batch_size: usize,
        now: u64,
        filter: impl Fn(&SyncItem) -> bool,
    ) -> Vec<SyncItem> {
        let mut inner = self.lock();
        let batch: Vec<SyncItem> = inner
            .ordered()
            .into_iter()
            .filter(|item| !inner.in_flight.contains(&item.id))
            .filter(|item| item.next_eligible_at <= now)
            .filter(|item| filter(item))
            .take(batch_size)
            .cloned()
            .collect();
        for item in &batch {
            inner.in_flight.insert(item.id.clone());
        }
        batch
    }

    /// Remove an acknowledged item. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> Option<SyncItem> {
        self.lock().take(id)
    }

    pub fn mark_retry(&self, id: &str, delay: Duration, max_attempts: u32) -> RetryOutcome {
        self.mark_retry_at(id, delay, max_attempts, now_millis())
    }

    /// Count a failed attempt. Once `attempt` reaches `max_attempts` the item
    /// is removed and returned; otherwise it becomes eligible after `delay`.
    pub fn mark_retry_at(&self, id: &str, delay: Duration, max_attempts: u32, now: u64) -> RetryOutcome {
        let mut inner = self.lock();
        let Some(item) = inner.items.get_mut(id) else {
            return RetryOutcome::Missing;
        };
        item.attempt += 1;
        if item.attempt >= max_attempts {
            return match inner.take(id) {
                Some(item) => RetryOutcome::Exhausted(item),
                None => RetryOutcome::Missing,
            };
        }
        item.next_eligible_at = now.saturating_add(delay.as_millis() as u64);
        let outcome = RetryOutcome::Scheduled {
            attempt: item.attempt,
            next_eligible_at: item.next_eligible_at,
        };
        inner.in_flight.remove(id);
        outcome
    }

    pub fn defer(&self, ids: &[String], delay: Duration) {
        self.defer_at(ids, delay, now_millis())
    }

    /// Push items back without counting an attempt (transient failures).
    pub fn defer_at(&self, ids: &[String], delay: Duration, now: u64) {
        let mut inner = self.lock();
        let until = now.saturating_add(delay.as_millis() as u64);
        for id in ids {
            if let Some(item) = inner.items.get_mut(id) {
                item.next_eligible_at = item.next_eligible_at.max(until);
            }
            inner.in_flight.remove(id);
        }
    }

    /// Return in-flight items to the queue untouched.
    pub fn release(&self, ids: &[String]) {
        let mut inner = self.lock();
        for id in ids {
            inner.in_flight.remove(id);
        }
    }

    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn get(&self, id: &str) -> Option<SyncItem> {
        self.lock().items.get(id).cloned()
    }

    /// Earliest `next_eligible_at` among items not in flight.
    pub fn next_eligible_at(&self) -> Option<u64> {
        let inner = self.lock();
        inner
            .items
            .values()
            .filter(|item| !inner.in_flight.contains(&item.id))
            .map(|item| item.next_eligible_at)
            .min()
    }

    /// All items in FIFO order. In-flight markers are not part of the snapshot:
    /// after a restart every item is simply pending again.
    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();
        QueueSnapshot {
            version: SNAPSHOT_VERSION,
            items: inner.ordered().into_iter().cloned().collect(),
        }
    }

    /// Replace the queue contents with a persisted snapshot.
    pub fn restore(&self, snapshot: QueueSnapshot) {
        let mut inner = self.lock();
        *inner = Inner::default();
        for item in snapshot.items {
            inner.insert(item);
        }
    }
}
