//! Bridges replies that arrive on an agent's stream back to the caller that is
//! waiting for them.
//!
//! Each waiter sits in a shared map until exactly one of three things removes
//! it: a matching reply, a disconnect, or its own timeout. Removal is the
//! single point of decision; whoever removes the entry decides the outcome
//! and every later attempt is a no-op.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{AgentId, CommandReply};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// Correlator used by the broker: one outstanding reply per agent.
pub type ReplyCorrelator = ResponseCorrelator<AgentId, CommandReply>;

/// How a wait ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome<V> {
    Resolved(V),
    Disconnected,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("a waiter already exists for this key")]
    DuplicateKey,
}

struct Waiter<V> {
    id: u64,
    tx: oneshot::Sender<WaitOutcome<V>>,
}

type PendingMap<K, V> = Arc<DashMap<K, Waiter<V>>>;

pub struct ResponseCorrelator<K, V>
where
    K: Eq + Hash,
{
    pending: PendingMap<K, V>,
    next_id: AtomicU64,
}

impl<K, V> Default for ResponseCorrelator<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ResponseCorrelator<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register interest in the next value for `key`.
    pub fn create_waiter(&self, key: K) -> Result<WaiterHandle<K, V>, CorrelatorError> {
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => Err(CorrelatorError::DuplicateKey),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                slot.insert(Waiter { id, tx });
                Ok(WaiterHandle {
                    key,
                    id,
                    rx,
                    pending: Arc::clone(&self.pending),
                })
            }
        }
    }

    /// Hand `value` to the waiter for `key`. Returns false when nobody is
    /// waiting, which is the normal fate of a reply that lost to a timeout.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        self.fulfil(key, WaitOutcome::Resolved(value))
    }

    /// Wake the waiter for `key` with [`WaitOutcome::Disconnected`].
    pub fn cancel(&self, key: &K) -> bool {
        self.fulfil(key, WaitOutcome::Disconnected)
    }

    fn fulfil(&self, key: &K, outcome: WaitOutcome<V>) -> bool {
        match self.pending.remove(key) {
            Some((_, waiter)) => waiter.tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The caller's side of a waiter. Dropping it unresolved withdraws the waiter.
pub struct WaiterHandle<K, V>
where
    K: Eq + Hash,
{
    key: K,
    id: u64,
    rx: oneshot::Receiver<WaitOutcome<V>>,
    pending: PendingMap<K, V>,
}

impl<K, V> WaiterHandle<K, V>
where
    K: Eq + Hash,
{
    /// Suspend until the waiter is resolved, cancelled, or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome<V> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => WaitOutcome::Disconnected,
            Err(_) => {
                if self.withdraw() {
                    return WaitOutcome::TimedOut;
                }
                // A resolver removed the entry first; its value is on the way.
                (&mut self.rx).await.unwrap_or(WaitOutcome::Disconnected)
            }
        }
    }

    /// Remove this handle's own entry. A newer waiter under the same key is
    /// left alone.
    fn withdraw(&self) -> bool {
        let id = self.id;
        self.pending
            .remove_if(&self.key, |_, waiter| waiter.id == id)
            .is_some()
    }
}

impl<K, V> Drop for WaiterHandle<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.withdraw();
    }
}
