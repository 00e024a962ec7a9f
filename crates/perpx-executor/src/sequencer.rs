//! FIFO serialization per key.
//!
//! [`KeyedSequencer::enqueue`] is synchronous, so tickets for one key are
//! ordered by enqueue call, not by which task polls first. A ticket's turn
//! comes when every earlier ticket for the same key has been dropped.
//! Different keys never wait on each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Tail {
    seq: u64,
    done: oneshot::Receiver<()>,
}

struct Queues<K> {
    next_seq: u64,
    tails: HashMap<K, Tail>,
}

/// Per-key FIFO of exclusive turns.
pub struct KeyedSequencer<K> {
    queues: Arc<Mutex<Queues<K>>>,
}

impl<K> Default for KeyedSequencer<K> {
    fn default() -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues {
                next_seq: 0,
                tails: HashMap::new(),
            })),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> KeyedSequencer<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next place in `key`'s queue.
    pub fn enqueue(&self, key: K) -> Ticket<K> {
        let (tx, rx) = oneshot::channel();
        let mut queues = self.queues.lock();
        let seq = queues.next_seq;
        queues.next_seq += 1;
        let previous = queues.tails.insert(key.clone(), Tail { seq, done: rx });
        Ticket {
            previous: previous.map(|tail| tail.done),
            turn: Turn {
                key,
                seq,
                _done: tx,
                queues: self.queues.clone(),
            },
        }
    }

    /// Keys with at least one outstanding ticket.
    pub fn active_keys(&self) -> usize {
        self.queues.lock().tails.len()
    }
}

/// A place in a key's queue.
#[must_use = "dropping a ticket gives up its turn"]
pub struct Ticket<K: Eq + Hash> {
    previous: Option<oneshot::Receiver<()>>,
    turn: Turn<K>,
}

impl<K: Eq + Hash> Ticket<K> {
    /// Wait until every earlier ticket for the key is done.
    pub async fn wait(self) -> Turn<K> {
        if let Some(previous) = self.previous {
            // Sender dropped when the earlier turn ended
            let _ = previous.await;
        }
        self.turn
    }
}

/// Exclusive turn for a key; the next ticket proceeds once this drops.
pub struct Turn<K: Eq + Hash> {
    key: K,
    seq: u64,
    _done: oneshot::Sender<()>,
    queues: Arc<Mutex<Queues<K>>>,
}

impl<K: Eq + Hash> Drop for Turn<K> {
    fn drop(&mut self) {
        let mut queues = self.queues.lock();
        if queues.tails.get(&self.key).is_some_and(|tail| tail.seq == self.seq) {
            queues.tails.remove(&self.key);
        }
    }
}
