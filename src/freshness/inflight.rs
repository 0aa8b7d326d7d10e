//! In-flight fetch de-duplication
//!
//! At most one backend fetch runs per key. The first caller to [`claim`] a key
//! becomes the leader and receives a [`Ticket`]; callers arriving while the
//! fetch is outstanding join it and receive the leader's result over a
//! broadcast channel. A pending slot older than the fetch timeout is treated
//! as abandoned and replaced.
//!
//! The table itself is plain data and lives under the owning service's lock.
//! Only [`wait`] awaits, and it must be called after that lock is released.
//!
//! [`claim`]: InFlight::claim

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::backend::FetchError;
use crate::config::BROADCAST_CHANNEL_CAPACITY;

pub type SharedResult<V> = Result<Arc<V>, FetchError>;

struct Pending<V> {
    tx: broadcast::Sender<SharedResult<V>>,
    started_at: Instant,
    ticket: u64,
}

/// Proof of leadership for one outstanding fetch
pub struct Ticket<V> {
    id: u64,
    tx: broadcast::Sender<SharedResult<V>>,
}

impl<V> std::fmt::Debug for Ticket<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket").field("id", &self.id).finish()
    }
}

/// Outcome of claiming a key
pub enum Claim<V> {
    /// Another fetch is outstanding; wait on this receiver
    Join(broadcast::Receiver<SharedResult<V>>),
    /// This caller must perform the fetch and complete the ticket
    Lead(Ticket<V>),
}

pub struct InFlight<K, V> {
    pending: HashMap<K, Pending<V>>,
    next_ticket: u64,
}

impl<K, V> Default for InFlight<K, V> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            next_ticket: 1,
        }
    }
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the outstanding fetch for `key`, if it is still live
    pub fn join(
        &mut self,
        key: &K,
        timeout: Duration,
        now: Instant,
    ) -> Option<broadcast::Receiver<SharedResult<V>>> {
        let pending = self.pending.get(key)?;
        if now.saturating_duration_since(pending.started_at) < timeout {
            return Some(pending.tx.subscribe());
        }
        tracing::debug!(%key, "Pending fetch timed out, starting new request");
        self.pending.remove(key);
        None
    }

    /// Register the caller as leader for `key`. Any stale slot is replaced.
    pub fn lead(&mut self, key: K, now: Instant) -> Ticket<V> {
        let (tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.pending.insert(
            key,
            Pending {
                tx: tx.clone(),
                started_at: now,
                ticket: id,
            },
        );
        Ticket { id, tx }
    }

    /// Join an outstanding fetch or become its leader
    pub fn claim(&mut self, key: &K, timeout: Duration, now: Instant) -> Claim<V> {
        match self.join(key, timeout, now) {
            Some(rx) => Claim::Join(rx),
            None => Claim::Lead(self.lead(key.clone(), now)),
        }
    }

    /// Release the slot (if it still belongs to `ticket`) and broadcast the
    /// outcome to every joined caller
    pub fn complete(&mut self, key: &K, ticket: Ticket<V>, result: SharedResult<V>) {
        if self
            .pending
            .get(key)
            .is_some_and(|pending| pending.ticket == ticket.id)
        {
            self.pending.remove(key);
        }
        let _ = ticket.tx.send(result);
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop the slots matching `predicate`; later callers start a new fetch
    pub fn forget_where(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        self.pending.retain(|key, _| !predicate(key));
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Wait for a joined fetch to resolve
pub async fn wait<V: Clone>(
    mut rx: broadcast::Receiver<SharedResult<V>>,
    timeout: Duration,
) -> SharedResult<V> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(FetchError::Abandoned),
        Err(_) => Err(FetchError::Timeout),
    }
}
