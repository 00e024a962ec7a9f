//! Order tracker.
//!
//! Polls receipts for every transaction an operation has broadcast until
//! one is mined, the operation is cancelled, or the drop horizon passes.
//! Replacements share a nonce, so at most one of them can be mined; the
//! tracker reports whichever it finds.

use std::time::{Duration, Instant};

use alloy::primitives::B256;
use dashmap::DashMap;
use perpx_chain::{ChainClient, Receipt, ReceiptLookup, ReceiptStatus};
use perpx_core::OperationId;
use perpx_telemetry::Metrics;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::config::TrackerConfig;

/// How tracking of an operation's transactions ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Confirmed(Receipt),
    Reverted { tx_hash: B256, reason: String },
    /// Nothing mined within the horizon.
    Dropped,
    /// A cancel was requested while waiting.
    CancelRequested,
}

/// Receipt poller with a registry of outstanding transactions.
pub struct OrderTracker {
    client: ChainClient,
    config: TrackerConfig,
    outstanding: DashMap<B256, OperationId>,
}

impl OrderTracker {
    pub fn new(client: ChainClient, config: TrackerConfig) -> Self {
        Self {
            client,
            config,
            outstanding: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Record that `tx_hash` belongs to `operation`.
    pub fn register(&self, tx_hash: B256, operation: OperationId) {
        self.outstanding.insert(tx_hash, operation);
    }

    /// Forget every transaction of a terminal operation.
    pub fn release(&self, operation: &OperationId) {
        self.outstanding.retain(|_, op| op != operation);
    }

    /// Operation that broadcast `tx_hash`, if still outstanding.
    pub fn operation_for(&self, tx_hash: &B256) -> Option<OperationId> {
        self.outstanding.get(tx_hash).map(|op| *op)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// One pass over `hashes`, newest first.
    ///
    /// Returns the first mined receipt. Lookup errors count as not found.
    pub async fn find_mined(&self, hashes: &[B256]) -> Option<TrackOutcome> {
        for tx_hash in hashes.iter().rev() {
            match self.client.get_receipt(*tx_hash).await {
                Ok(ReceiptLookup::Found(receipt)) => return Some(Self::outcome(receipt)),
                Ok(ReceiptLookup::Pending) | Ok(ReceiptLookup::NotFound) => {}
                Err(e) => {
                    if e.is_timeout() {
                        Metrics::gateway_timeout("get_receipt");
                    }
                    debug!(%tx_hash, error = %e, "Receipt lookup failed");
                }
            }
        }
        None
    }

    /// Poll until an outcome. `cancel` interrupts the wait between polls.
    pub async fn track(
        &self,
        operation: OperationId,
        hashes: &[B256],
        cancel: Option<&Notify>,
    ) -> TrackOutcome {
        let started = Instant::now();
        let horizon = Duration::from_millis(self.config.horizon_ms);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if let Some(outcome) = self.find_mined(hashes).await {
                info!(%operation, attempt, "Transaction mined");
                return outcome;
            }

            let elapsed = started.elapsed();
            if elapsed >= horizon {
                warn!(
                    %operation,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "No receipt within horizon, treating as dropped"
                );
                return TrackOutcome::Dropped;
            }

            let delay = backoff::delay(
                attempt,
                self.config.base_interval_ms,
                self.config.max_interval_ms,
                self.config.jitter_ms,
            )
            .min(horizon - elapsed);

            match cancel {
                Some(notify) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = notify.notified() => {
                            info!(%operation, "Cancel requested during tracking");
                            return TrackOutcome::CancelRequested;
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn outcome(receipt: Receipt) -> TrackOutcome {
        match receipt.status {
            ReceiptStatus::Success => TrackOutcome::Confirmed(receipt),
            ReceiptStatus::Reverted { ref reason } => TrackOutcome::Reverted {
                tx_hash: receipt.tx_hash,
                reason: reason.clone(),
            },
        }
    }
}
