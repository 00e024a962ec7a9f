//! Per-account nonce ledger.
//!
//! Hands out nonces so that, per account:
//! - no two live operations hold the same nonce
//! - a nonce released before it reached the chain is reissued before any
//!   fresh one, so submitted nonces never leave gaps
//! - a committed nonce is never issued again
//!
//! Each account has its own mutex; the lock is held only for the
//! bookkeeping, never across a gateway call.

use std::collections::{BTreeSet, HashMap};

use alloy::primitives::Address;
use dashmap::DashMap;
use parking_lot::Mutex;
use perpx_core::OperationId;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct AccountNonces {
    /// Next never-issued nonce.
    next: u64,
    /// Issued, then given back without being consumed on chain.
    released: BTreeSet<u64>,
    /// Nonces held by non-terminal operations.
    live: HashMap<u64, OperationId>,
}

/// Nonce allocation for every signing account the engine uses.
#[derive(Debug, Default)]
pub struct NonceLedger {
    accounts: DashMap<Address, Mutex<AccountNonces>>,
}

impl NonceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<R>(&self, account: Address, f: impl FnOnce(&mut AccountNonces) -> R) -> R {
        let entry = self.accounts.entry(account).or_default();
        let mut nonces = entry.lock();
        f(&mut nonces)
    }

    /// Initialise from the chain's next nonce. Never moves `next` backwards.
    pub fn seed(&self, account: Address, chain_next: u64) {
        self.with_account(account, |n| {
            if chain_next > n.next {
                n.next = chain_next;
            }
            n.released.retain(|nonce| *nonce >= chain_next);
            info!(%account, next = n.next, "Nonce ledger seeded");
        });
    }

    /// Issue a nonce to `operation`: the smallest released one if any,
    /// otherwise the next fresh one.
    pub fn allocate(&self, account: Address, operation: OperationId) -> u64 {
        self.with_account(account, |n| {
            let nonce = match n.released.pop_first() {
                Some(reused) => reused,
                None => {
                    let fresh = n.next;
                    n.next += 1;
                    fresh
                }
            };
            n.live.insert(nonce, operation);
            debug!(%account, nonce, %operation, "Nonce allocated");
            nonce
        })
    }

    /// The nonce was consumed on chain (confirmed or reverted).
    pub fn commit(&self, account: Address, nonce: u64) {
        self.with_account(account, |n| {
            n.live.remove(&nonce);
            n.released.remove(&nonce);
            if nonce >= n.next {
                n.next = nonce + 1;
            }
        });
    }

    /// The holder will never consume `nonce`; it may be reissued.
    pub fn release(&self, account: Address, nonce: u64) {
        self.with_account(account, |n| {
            if n.live.remove(&nonce).is_some() && nonce < n.next {
                n.released.insert(nonce);
                debug!(%account, nonce, "Nonce released");
            }
        });
    }

    /// Mark `nonce` as held by `operation`, e.g. when resuming from the
    /// operation log.
    pub fn reserve(&self, account: Address, nonce: u64, operation: OperationId) {
        self.with_account(account, |n| {
            n.released.remove(&nonce);
            if let Some(other) = n.live.insert(nonce, operation) {
                if other != operation {
                    warn!(%account, nonce, %operation, %other, "Nonce reserved twice");
                }
            }
            if nonce >= n.next {
                n.next = nonce + 1;
            }
        });
    }

    /// The chain consumed nonces below `chain_next` without us.
    ///
    /// Drops released nonces below it and moves `next` forward.
    pub fn resync(&self, account: Address, chain_next: u64) {
        self.with_account(account, |n| {
            n.released.retain(|nonce| *nonce >= chain_next);
            if chain_next > n.next {
                warn!(%account, local = n.next, chain = chain_next, "Nonce ledger behind chain");
                n.next = chain_next;
            }
        });
    }

    /// Swap `old` for a fresh nonce after the chain consumed `old` elsewhere.
    pub fn replace(&self, account: Address, old: u64, operation: OperationId) -> u64 {
        self.with_account(account, |n| {
            n.live.remove(&old);
            n.released.remove(&old);
        });
        self.allocate(account, operation)
    }

    /// Number of nonces held by non-terminal operations.
    pub fn live_count(&self, account: Address) -> usize {
        self.accounts
            .get(&account)
            .map(|entry| entry.lock().live.len())
            .unwrap_or(0)
    }

    /// Next never-issued nonce.
    pub fn next_nonce(&self, account: Address) -> u64 {
        self.accounts
            .get(&account)
            .map(|entry| entry.lock().next)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn account() -> Address {
        Address::repeat_byte(0x11)
    }

    #[test]
    fn test_allocate_is_monotonic_from_seed() {
        let ledger = NonceLedger::new();
        ledger.seed(account(), 5);
        assert_eq!(ledger.allocate(account(), OperationId::new()), 5);
        assert_eq!(ledger.allocate(account(), OperationId::new()), 6);
        assert_eq!(ledger.live_count(account()), 2);
    }

    #[test]
    fn test_released_nonce_reissued_first() {
        let ledger = NonceLedger::new();
        let a = ledger.allocate(account(), OperationId::new());
        let b = ledger.allocate(account(), OperationId::new());
        ledger.release(account(), a);
        assert_eq!(ledger.allocate(account(), OperationId::new()), a);
        assert_eq!(ledger.allocate(account(), OperationId::new()), b + 1);
    }

    #[test]
    fn test_committed_nonce_never_reissued() {
        let ledger = NonceLedger::new();
        let a = ledger.allocate(account(), OperationId::new());
        ledger.commit(account(), a);
        ledger.release(account(), a);
        assert_ne!(ledger.allocate(account(), OperationId::new()), a);
    }

    #[test]
    fn test_seed_never_moves_backwards() {
        let ledger = NonceLedger::new();
        ledger.seed(account(), 10);
        ledger.seed(account(), 3);
        assert_eq!(ledger.next_nonce(account()), 10);
    }

    #[test]
    fn test_reserve_advances_next() {
        let ledger = NonceLedger::new();
        ledger.seed(account(), 2);
        ledger.reserve(account(), 7, OperationId::new());
        assert_eq!(ledger.allocate(account(), OperationId::new()), 8);
    }

    #[test]
    fn test_resync_drops_consumed_releases() {
        let ledger = NonceLedger::new();
        let a = ledger.allocate(account(), OperationId::new());
        let op = OperationId::new();
        let b = ledger.allocate(account(), op);
        ledger.release(account(), a);

        ledger.resync(account(), b + 1);
        let replaced = ledger.replace(account(), b, op);
        assert_eq!(replaced, b + 1);
        assert_eq!(ledger.live_count(account()), 1);
    }

    #[test]
    fn test_accounts_are_independent() {
        let ledger = NonceLedger::new();
        let other = Address::repeat_byte(0x22);
        ledger.seed(other, 40);
        assert_eq!(ledger.allocate(account(), OperationId::new()), 0);
        assert_eq!(ledger.allocate(other, OperationId::new()), 40);
    }

    #[test]
    fn test_concurrent_allocations_unique() {
        let ledger = Arc::new(NonceLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| ledger.allocate(account(), OperationId::new()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(seen.insert(nonce), "nonce {nonce} issued twice");
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(ledger.next_nonce(account()), 800);
    }
}
