//! Execution engine.
//!
//! Owns the lifecycle of every operation:
//!
//! ```text
//! submit_intent ─> validate ─> Validated ─> (position-key turn) ─> Building
//!     ─> re-validate, fee, [collateral approval], nonce ─> Signed ─> Submitted ─> track
//!         ├─ mined        ─> Confirmed (book updated) / Failed (reverted)
//!         ├─ dropped      ─> Dropped ─> Superseded ─> Signed (bumped fee)
//!         └─ cancel       ─> Superseded ─> Signed (self-transfer, same nonce)
//! ```
//!
//! Operations on the same (market, side) run strictly one after another in
//! submission order; different keys proceed in parallel. Every status
//! transition is persisted before it becomes visible to status queries.
//! A signed transaction whose snapshot could not be journaled is never
//! broadcast; other failed appends are retried from the drive loop.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use perpx_chain::{
    ChainClient, GatewayError, GatewayResult, MarketStateCache, Receipt, SignedTx, TxPayload,
};
use perpx_core::{
    CoreError, FailureReason, FeeQuote, IdempotencyKey, MarketId, NormalizedOrder, OperationId,
    OperationRecord, OperationStatus, OperationView, PendingAdjustment, Position, PositionDelta,
    PositionKey, Price, RejectReason, RiskParameters, Side, TradeIntent,
};
use perpx_persistence::{OperationJournal, PersistenceResult};
use perpx_position::{LiquidationFlag, PositionBook};
use perpx_risk::{MarketContext, RiskValidator};
use perpx_telemetry::Metrics;
use rust_decimal::Decimal;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::backoff;
use crate::config::EngineConfig;
use crate::error::{ExecutionError, ExecutionResult};
use crate::nonce::NonceLedger;
use crate::payload::PayloadBuilder;
use crate::sequencer::{KeyedSequencer, Ticket};
use crate::signer::TxSigner;
use crate::tracker::{OrderTracker, TrackOutcome};

// ============================================================================
// Wiring
// ============================================================================

/// Collaborators injected into the engine.
pub struct EngineDeps {
    pub client: ChainClient,
    pub signer: Arc<TxSigner>,
    pub book: Arc<PositionBook>,
    pub risk: Arc<RiskParameters>,
    pub journal: Arc<dyn OperationJournal>,
}

/// What [`ExecutionEngine::resume`] did with a replayed log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    /// Confirmed operations whose positions were restored.
    pub restored: usize,
    /// In-flight operations whose tracking resumed.
    pub resumed: usize,
    /// Operations that never reached the chain and were failed.
    pub interrupted: usize,
    /// Operations already terminal, kept for status queries.
    pub terminal: usize,
}

struct OperationSlot {
    record: Mutex<OperationRecord>,
    status: watch::Sender<OperationStatus>,
    cancel: Notify,
    /// The latest snapshot is not in the journal yet.
    unsynced: AtomicBool,
}

impl OperationSlot {
    fn new(record: OperationRecord) -> Arc<Self> {
        let (status, _) = watch::channel(record.status);
        Arc::new(Self {
            record: Mutex::new(record),
            status,
            cancel: Notify::new(),
            unsynced: AtomicBool::new(false),
        })
    }
}

/// Owner of an idempotency key.
enum KeyEntry {
    /// An intent with this key is being validated; the receiver yields its
    /// operation id once accepted.
    Validating(watch::Receiver<Option<OperationId>>),
    Accepted(OperationId),
}

/// Claim on an idempotency key while its intent is validated.
///
/// Dropping an unaccepted claim frees the key and wakes every submission
/// waiting on it.
struct KeyClaim<'a> {
    keys: &'a DashMap<IdempotencyKey, KeyEntry>,
    key: IdempotencyKey,
    verdict: watch::Sender<Option<OperationId>>,
    accepted: bool,
}

impl KeyClaim<'_> {
    fn accept(mut self, operation_id: OperationId) {
        self.keys
            .insert(self.key.clone(), KeyEntry::Accepted(operation_id));
        self.verdict.send_replace(Some(operation_id));
        self.accepted = true;
    }
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        if !self.accepted {
            self.keys.remove(&self.key);
        }
    }
}

/// Outcome of [`Inner::apply`].
enum Applied {
    Refused,
    Persisted,
    /// Applied in memory, but the journal append failed.
    Unpersisted(String),
}

/// Broadcast state of one operation after its nonce is allocated.
struct Flight {
    id: OperationId,
    slot: Arc<OperationSlot>,
    order: NormalizedOrder,
    /// Position call with zero value.
    call: TxPayload,
    nonce: u64,
    fee: FeeQuote,
    hashes: Vec<B256>,
    cancel_hashes: Vec<B256>,
    cancelling: bool,
    replacements: u32,
    conflicts: u32,
}

enum Stage {
    Broadcast(&'static str),
    Track,
    Replace,
}

enum Start {
    Fresh,
    Resume(Box<Flight>, Stage),
}

struct Inner {
    config: EngineConfig,
    client: ChainClient,
    signer: Arc<TxSigner>,
    book: Arc<PositionBook>,
    validator: RiskValidator,
    journal: Arc<dyn OperationJournal>,
    market_cache: MarketStateCache,
    ledger: NonceLedger,
    sequencer: KeyedSequencer<PositionKey>,
    tracker: OrderTracker,
    payloads: PayloadBuilder,
    operations: DashMap<OperationId, Arc<OperationSlot>>,
    keys: DashMap<IdempotencyKey, KeyEntry>,
    /// Deltas of accepted operations that have not taken their position-key
    /// turn yet. The book only ever holds the delta of the turn holder.
    queued: DashMap<OperationId, PositionDelta>,
    /// Serializes validate-then-queue so concurrent intents see each
    /// other's pending deltas.
    intake: Mutex<()>,
}

/// Accepts trade intents and drives them to a terminal status.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

impl ExecutionEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        let tracker = OrderTracker::new(deps.client.clone(), config.tracker);
        let payloads = PayloadBuilder::new(config.router, config.account);
        let market_cache =
            MarketStateCache::new(Duration::from_millis(config.execution.market_cache_ms));
        Self {
            inner: Arc::new(Inner {
                client: deps.client,
                signer: deps.signer,
                book: deps.book,
                validator: RiskValidator::new(deps.risk),
                journal: deps.journal,
                market_cache,
                ledger: NonceLedger::new(),
                sequencer: KeyedSequencer::new(),
                tracker,
                payloads,
                operations: DashMap::new(),
                keys: DashMap::new(),
                queued: DashMap::new(),
                intake: Mutex::new(()),
                config,
            }),
        }
    }

    pub fn account(&self) -> Address {
        self.inner.config.account
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.inner.book
    }

    pub fn market_cache(&self) -> &MarketStateCache {
        &self.inner.market_cache
    }

    pub fn ledger(&self) -> &NonceLedger {
        &self.inner.ledger
    }

    pub fn tracker(&self) -> &OrderTracker {
        &self.inner.tracker
    }

    pub fn risk_parameters(&self) -> &RiskParameters {
        self.inner.validator.params()
    }

    /// Seed the nonce ledger from the chain. Call once before accepting
    /// intents.
    pub async fn sync_nonce(&self) -> ExecutionResult<u64> {
        let inner = &self.inner;
        let account = inner.config.account;
        let next = inner
            .with_retry("get_nonce", || inner.client.get_nonce(account))
            .await?;
        inner.ledger.seed(account, next);
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------

    /// Validate `intent` and start executing it.
    ///
    /// Returns the new operation id. A rejected intent touches no write
    /// path, creates no operation and frees its idempotency key. A
    /// submission whose key is still being validated waits for that
    /// verdict: it reports the duplicate if the first one was accepted and
    /// is validated itself if it was rejected.
    ///
    /// # Errors
    /// - `DuplicateIntent` when the idempotency key was used before
    /// - `ValidationRejected` with the first failed risk check
    /// - `NetworkTimeout` when the mark price could not be read
    pub async fn submit_intent(&self, intent: TradeIntent) -> ExecutionResult<OperationId> {
        let inner = &self.inner;
        let key = intent.idempotency_key.clone();

        let claim = loop {
            let mut verdict = match inner.keys.entry(key.clone()) {
                Entry::Occupied(existing) => {
                    let owner = match existing.get() {
                        KeyEntry::Accepted(operation_id) => Err(*operation_id),
                        KeyEntry::Validating(verdict) => Ok(verdict.clone()),
                    };
                    drop(existing);
                    match owner {
                        Ok(verdict) => verdict,
                        Err(operation_id) => return Err(inner.duplicate(operation_id, &key)),
                    }
                }
                Entry::Vacant(vacant) => {
                    let (verdict, rx) = watch::channel(None);
                    vacant.insert(KeyEntry::Validating(rx));
                    break KeyClaim {
                        keys: &inner.keys,
                        key: key.clone(),
                        verdict,
                        accepted: false,
                    };
                }
            };
            debug!(idempotency_key = %key, "Key under validation, waiting");
            // Errors once the claim is dropped; the key is free again then.
            let _ = verdict.wait_for(Option::is_some).await;
        };

        let operation_id = OperationId::new();
        inner.accept(operation_id, intent).await?;
        claim.accept(operation_id);
        Ok(operation_id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn status(&self, operation_id: &OperationId) -> ExecutionResult<OperationView> {
        let slot = self.inner.require(operation_id)?;
        let view = slot.record.lock().view();
        Ok(view)
    }

    /// Wait until the operation is terminal.
    pub async fn wait_terminal(
        &self,
        operation_id: &OperationId,
        timeout: Duration,
    ) -> ExecutionResult<OperationView> {
        let slot = self.inner.require(operation_id)?;
        let mut rx = slot.status.subscribe();

        let wait = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ExecutionError::WaitTimeout(*operation_id))?;

        let view = slot.record.lock().view();
        Ok(view)
    }

    /// Wait for the operation and return its resulting position, or the
    /// error it ended with.
    pub async fn await_position(
        &self,
        operation_id: &OperationId,
        timeout: Duration,
    ) -> ExecutionResult<Position> {
        let view = self.wait_terminal(operation_id, timeout).await?;
        match view.status {
            OperationStatus::Confirmed => view.position.ok_or_else(|| {
                ExecutionError::InvalidIntent(format!(
                    "operation {operation_id} confirmed without a settled position"
                ))
            }),
            OperationStatus::Cancelled => Err(ExecutionError::Cancelled),
            _ => Err(view
                .failure
                .as_ref()
                .map(ExecutionError::from)
                .unwrap_or(ExecutionError::Interrupted)),
        }
    }

    pub fn position(&self, market: &MarketId, side: Side) -> Option<Position> {
        self.inner.book.get_position(market, side)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.book.open_positions()
    }

    pub fn operation_count(&self) -> usize {
        self.inner.operations.len()
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel an operation.
    ///
    /// Before a nonce is allocated the operation is cancelled on the spot.
    /// Once a transaction may exist, a zero-value replacement at the same
    /// nonce is broadcast; whichever transaction is mined decides between
    /// `Cancelled` and `Confirmed`. Terminal operations are returned as is.
    pub fn cancel(&self, operation_id: &OperationId) -> ExecutionResult<OperationView> {
        let inner = &self.inner;
        let slot = inner.require(operation_id)?;

        let mut record = slot.record.lock();
        if record.status.is_terminal() {
            return Ok(record.view());
        }

        if record.status.is_pre_submission() && record.nonce.is_none() {
            if let Err(e) = record.transition(OperationStatus::Cancelled) {
                warn!(%operation_id, error = %e, "Cancel refused");
                return Ok(record.view());
            }
            slot.unsynced
                .store(inner.persist(&record).is_err(), Ordering::Release);
            slot.status.send_replace(record.status);
            let snapshot = record.clone();
            drop(record);
            inner.finished(&snapshot);
            info!(%operation_id, "Operation cancelled before submission");
            return Ok(snapshot.view());
        }

        record.cancel_requested = true;
        record.updated_at = Utc::now();
        slot.unsynced
            .store(inner.persist(&record).is_err(), Ordering::Release);
        let view = record.view();
        drop(record);

        slot.cancel.notify_one();
        info!(%operation_id, status = %view.status, "Cancel requested");
        Ok(view)
    }

    // ------------------------------------------------------------------
    // Restart
    // ------------------------------------------------------------------

    /// Rebuild state from replayed operation records, oldest first.
    ///
    /// Confirmed positions are restored into the book, operations that
    /// never reached the chain fail with `Interrupted`, and in-flight
    /// operations resume tracking at their recorded nonce. Call after
    /// [`sync_nonce`](Self::sync_nonce).
    pub fn resume(&self, records: Vec<OperationRecord>) -> ExecutionResult<ResumeSummary> {
        let inner = &self.inner;
        let account = format!("{:#x}", inner.config.account);
        let mut summary = ResumeSummary::default();

        for record in records {
            if !record.account.eq_ignore_ascii_case(&account) {
                warn!(
                    operation_id = %record.operation_id,
                    account = %record.account,
                    "Skipping operation of another account"
                );
                continue;
            }
            let operation_id = record.operation_id;
            inner.keys.insert(
                record.intent.idempotency_key.clone(),
                KeyEntry::Accepted(operation_id),
            );

            match record.status {
                OperationStatus::Confirmed => {
                    if let Some(position) = record.result.clone() {
                        if let Err(e) = inner.book.restore_confirmed(operation_id, position) {
                            warn!(%operation_id, error = %e, "Could not restore position");
                        }
                    }
                    if let Some(nonce) = record.nonce {
                        inner.ledger.commit(inner.config.account, nonce);
                    }
                    inner.operations.insert(operation_id, OperationSlot::new(record));
                    summary.restored += 1;
                }
                OperationStatus::Failed | OperationStatus::Cancelled => {
                    inner.operations.insert(operation_id, OperationSlot::new(record));
                    summary.terminal += 1;
                }
                OperationStatus::Validated | OperationStatus::Building => {
                    let mut record = record;
                    if let Err(e) = record.fail(FailureReason::Interrupted) {
                        warn!(%operation_id, error = %e, "Could not fail interrupted operation");
                    }
                    let _ = inner.persist(&record);
                    Metrics::operation_terminal(record.status.as_str(), "interrupted");
                    info!(%operation_id, "Operation interrupted before submission");
                    inner.operations.insert(operation_id, OperationSlot::new(record));
                    summary.interrupted += 1;
                }
                OperationStatus::Signed
                | OperationStatus::Submitted
                | OperationStatus::Dropped
                | OperationStatus::Superseded => {
                    if inner.resume_flight(record)? {
                        summary.resumed += 1;
                    } else {
                        summary.interrupted += 1;
                    }
                }
            }
        }

        Metrics::open_positions_set(inner.book.open_count() as i64);
        info!(
            restored = summary.restored,
            resumed = summary.resumed,
            interrupted = summary.interrupted,
            terminal = summary.terminal,
            "Operation log resumed"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    /// Refresh marks for every open market and flag positions at risk.
    ///
    /// Detection only: no transaction is sent.
    pub async fn scan_liquidation_risk(&self) -> Vec<LiquidationFlag> {
        let inner = &self.inner;
        let markets: BTreeSet<MarketId> = inner
            .book
            .open_positions()
            .into_iter()
            .map(|p| p.market)
            .collect();

        let mut marks: HashMap<MarketId, Price> = HashMap::new();
        for market in markets {
            match inner.client.read_market_state(&market).await {
                Ok(state) => {
                    inner.market_cache.update(&market, state);
                    marks.insert(market, state.price);
                }
                Err(e) => {
                    if e.is_timeout() {
                        Metrics::gateway_timeout("read_market_state");
                    }
                    warn!(%market, error = %e, "Mark price unavailable for liquidation scan");
                }
            }
        }

        let flags = inner
            .book
            .scan_liquidation_risk(|market| marks.get(market).copied(), inner.validator.params());
        for flag in &flags {
            Metrics::liquidation_risk(flag.position.market.as_str(), flag.risk.as_str());
        }
        flags
    }
}

// ============================================================================
// Engine internals
// ============================================================================

impl Inner {
    fn slot(&self, operation_id: &OperationId) -> Option<Arc<OperationSlot>> {
        self.operations.get(operation_id).map(|s| s.clone())
    }

    fn require(&self, operation_id: &OperationId) -> ExecutionResult<Arc<OperationSlot>> {
        self.slot(operation_id)
            .ok_or(ExecutionError::UnknownOperation(*operation_id))
    }

    fn persist(&self, record: &OperationRecord) -> PersistenceResult<()> {
        let appended = self.journal.append(record);
        if let Err(e) = &appended {
            error!(
                operation_id = %record.operation_id,
                status = %record.status,
                error = %e,
                "Failed to persist operation snapshot"
            );
        }
        appended
    }

    /// Apply `edit` under the record lock, then persist and publish.
    ///
    /// `Refused` leaves the record untouched; this is how a drive step
    /// notices a concurrent cancellation. A failed append still applies and
    /// publishes the edit and marks the slot for [`flush`](Self::flush).
    fn apply<F>(&self, slot: &OperationSlot, edit: F) -> Applied
    where
        F: FnOnce(&mut OperationRecord) -> perpx_core::Result<()>,
    {
        let mut record = slot.record.lock();
        let mut next = record.clone();
        if let Err(e) = edit(&mut next) {
            debug!(operation_id = %record.operation_id, error = %e, "Update refused");
            return Applied::Refused;
        }
        *record = next;
        let applied = match self.persist(&record) {
            Ok(()) => Applied::Persisted,
            Err(e) => Applied::Unpersisted(e.to_string()),
        };
        slot.unsynced
            .store(matches!(applied, Applied::Unpersisted(_)), Ordering::Release);
        slot.status.send_replace(record.status);

        if record.status.is_terminal() {
            let snapshot = record.clone();
            drop(record);
            self.finished(&snapshot);
        }
        applied
    }

    fn update<F>(&self, slot: &OperationSlot, edit: F) -> bool
    where
        F: FnOnce(&mut OperationRecord) -> perpx_core::Result<()>,
    {
        !matches!(self.apply(slot, edit), Applied::Refused)
    }

    /// Re-append the latest snapshot of a slot whose last append failed,
    /// backing off between attempts.
    async fn flush(&self, slot: &OperationSlot) {
        let attempts = self.config.execution.persist_attempts.max(1);
        let base = self.config.execution.retry_base_ms;
        for attempt in 1..=attempts {
            if !slot.unsynced.load(Ordering::Acquire) {
                return;
            }
            {
                let record = slot.record.lock();
                if self.persist(&record).is_ok() {
                    slot.unsynced.store(false, Ordering::Release);
                    info!(
                        operation_id = %record.operation_id,
                        status = %record.status,
                        attempt,
                        "Operation snapshot journaled after retry"
                    );
                    return;
                }
            }
            tokio::time::sleep(backoff::delay(attempt, base, base.saturating_mul(8), base / 2)).await;
        }
        if slot.unsynced.load(Ordering::Acquire) {
            let operation_id = slot.record.lock().operation_id;
            error!(%operation_id, attempts, "Operation snapshot still not journaled");
        }
    }

    fn duplicate(&self, operation_id: OperationId, key: &IdempotencyKey) -> ExecutionError {
        let status = self
            .slot(&operation_id)
            .map(|slot| slot.record.lock().status)
            .unwrap_or(OperationStatus::Validated);
        Metrics::intent_duplicate(status.as_str());
        info!(%operation_id, idempotency_key = %key, %status, "Duplicate intent");
        ExecutionError::DuplicateIntent {
            operation_id,
            status,
        }
    }

    fn advance(&self, slot: &OperationSlot, next: OperationStatus) -> bool {
        self.update(slot, |r| r.transition(next))
    }

    fn fail(&self, slot: &OperationSlot, reason: FailureReason) {
        self.fail_with(slot, reason, |_| {});
    }

    /// Fail after applying `edit` to the same snapshot.
    fn fail_with<E>(&self, slot: &OperationSlot, reason: FailureReason, edit: E)
    where
        E: FnOnce(&mut OperationRecord),
    {
        let label = reason.as_str();
        if self.update(slot, |r| {
            edit(r);
            r.fail(reason)
        }) {
            warn!(operation_id = %slot.record.lock().operation_id, reason = label, "Operation failed");
        }
    }

    /// Bookkeeping once an operation reached a terminal status.
    fn finished(&self, record: &OperationRecord) {
        self.queued.remove(&record.operation_id);
        self.book.clear_pending(&record.operation_id);
        self.tracker.release(&record.operation_id);
        Metrics::in_flight_dec();
        let reason = record
            .failure
            .as_ref()
            .map(FailureReason::as_str)
            .unwrap_or("none");
        Metrics::operation_terminal(record.status.as_str(), reason);
        info!(
            operation_id = %record.operation_id,
            status = %record.status,
            reason,
            "Operation finished"
        );
    }

    /// Retry a gateway call on timeout with backoff.
    async fn with_retry<T, F, Fut>(&self, call: &'static str, mut f: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let attempts = self.config.execution.submit_attempts.max(1);
        let base = self.config.execution.retry_base_ms;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Err(e) if e.is_timeout() => {
                    Metrics::gateway_timeout(call);
                    if attempt >= attempts {
                        return Err(e);
                    }
                    let delay = backoff::delay(attempt, base, base.saturating_mul(8), base / 2);
                    debug!(call, attempt, delay_ms = delay.as_millis() as u64, "Retrying after timeout");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn mark_price(&self, market: &MarketId) -> GatewayResult<Price> {
        if let Some(price) = self.market_cache.get_mark_px(market) {
            return Ok(price);
        }
        let state = self
            .with_retry("read_market_state", || self.client.read_market_state(market))
            .await?;
        self.market_cache.update(market, state);
        Ok(state.price)
    }

    /// Mark price for an intent's market, refusing unsupported markets
    /// before any chain read.
    async fn intent_mark(&self, intent: &TradeIntent) -> ExecutionResult<Price> {
        if !self.validator.params().is_supported(&intent.market) {
            return Err(ExecutionError::ValidationRejected(RejectReason::UnsupportedMarket {
                market: intent.market.clone(),
            }));
        }
        match self.mark_price(&intent.market).await {
            Ok(price) => Ok(price),
            Err(e) if e.is_timeout() => Err(ExecutionError::NetworkTimeout {
                call: "read_market_state".to_string(),
            }),
            Err(e) => {
                warn!(market = %intent.market, error = %e, "Mark price unavailable");
                Ok(Price::ZERO)
            }
        }
    }

    /// Every in-flight delta against (`market`, `side`): the one holding the
    /// key's turn, registered in the book, plus those queued behind it.
    fn pending_view(&self, market: &MarketId, side: Side) -> PendingAdjustment {
        let mut pending = self.book.get_pending_adjustment(market, side);
        for queued in self.queued.iter() {
            let delta = queued.value();
            if delta.side == side && delta.market == *market {
                pending.add(delta);
            }
        }
        pending
    }

    /// Validate against the settled position plus `pending`.
    fn validate_at(
        &self,
        intent: &TradeIntent,
        pending: &PendingAdjustment,
        mark_price: Price,
    ) -> ExecutionResult<NormalizedOrder> {
        let current = self.book.get_position(&intent.market, intent.side);
        let ctx = MarketContext {
            mark_price,
            open_positions: self.book.open_count(),
        };
        self.validator
            .validate(intent, current.as_ref(), pending, &ctx)
            .map_err(ExecutionError::ValidationRejected)
    }

    async fn accept(self: &Arc<Self>, operation_id: OperationId, intent: TradeIntent) -> ExecutionResult<()> {
        let validated = match self.intent_mark(&intent).await {
            Ok(mark) => {
                let _intake = self.intake.lock();
                let pending = self.pending_view(&intent.market, intent.side);
                let validated = self.validate_at(&intent, &pending, mark);
                if let Ok(order) = &validated {
                    self.queued.insert(operation_id, order.delta());
                }
                validated
            }
            Err(e) => Err(e),
        };
        let order = match validated {
            Ok(order) => order,
            Err(ExecutionError::ValidationRejected(reason)) => {
                Metrics::intent_rejected(reason.as_str());
                info!(
                    market = %intent.market,
                    side = %intent.side,
                    idempotency_key = %intent.idempotency_key,
                    reason = %reason,
                    "Intent rejected"
                );
                return Err(ExecutionError::ValidationRejected(reason));
            }
            Err(e) => return Err(e),
        };

        let key = order.position_key();
        let record = OperationRecord::new(
            operation_id,
            format!("{:#x}", self.config.account),
            intent,
            order.clone(),
        );
        if let Err(e) = self.journal.append(&record) {
            self.queued.remove(&operation_id);
            return Err(ExecutionError::Persistence(e.to_string()));
        }

        let slot = OperationSlot::new(record);
        self.operations.insert(operation_id, slot.clone());
        let ticket = self.sequencer.enqueue(key);

        Metrics::intent_accepted(order.market.as_str(), order.kind.as_str());
        Metrics::in_flight_inc();
        info!(
            %operation_id,
            market = %order.market,
            side = %order.side,
            kind = order.kind.as_str(),
            size_delta = %order.size_delta,
            collateral_delta = %order.collateral_delta,
            acceptable_price = %order.acceptable_price,
            "Intent accepted"
        );

        tokio::spawn(self.clone().drive(operation_id, slot, ticket, Start::Fresh));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Drive
    // ------------------------------------------------------------------

    async fn drive(
        self: Arc<Self>,
        operation_id: OperationId,
        slot: Arc<OperationSlot>,
        ticket: Ticket<PositionKey>,
        start: Start,
    ) {
        let _turn = ticket.wait().await;
        debug!(%operation_id, "Position key turn acquired");

        let started = match start {
            Start::Fresh => self
                .prepare(operation_id, &slot)
                .await
                .map(|flight| (flight, Stage::Broadcast("initial"))),
            Start::Resume(flight, stage) => Some((*flight, stage)),
        };
        if let Some((flight, stage)) = started {
            self.fly(flight, stage).await;
        }
        self.flush(&slot).await;
    }

    /// Building: re-validate, build calldata, quote the fee and take a nonce.
    async fn prepare(&self, operation_id: OperationId, slot: &Arc<OperationSlot>) -> Option<Flight> {
        if !self.advance(slot, OperationStatus::Building) {
            return None;
        }
        let intent = slot.record.lock().intent.clone();

        // Every earlier operation on this key is terminal now, so the
        // settled position alone is the base.
        let order = match self.intent_mark(&intent).await.and_then(|mark| {
            self.validate_at(&intent, &PendingAdjustment::default(), mark)
        }) {
            Ok(order) => order,
            Err(ExecutionError::ValidationRejected(reason)) => {
                Metrics::intent_rejected(reason.as_str());
                self.fail(slot, FailureReason::ValidationRejected { reason });
                return None;
            }
            Err(e) => {
                self.fail(slot, FailureReason::NetworkTimeout { call: error_call(&e) });
                return None;
            }
        };
        let call = match self.payloads.build(&order) {
            Ok(call) => call,
            Err(e) => {
                self.fail(slot, FailureReason::SubmissionRejected { detail: e.to_string() });
                return None;
            }
        };

        let fee = match self.quote_fee(&call).await {
            Ok(fee) => fee,
            Err(reason) => {
                self.fail(slot, reason);
                return None;
            }
        };

        if let Err(reason) = self.approve_collateral(operation_id, slot, &order).await {
            self.fail(slot, reason);
            return None;
        }

        let account = self.config.account;
        let nonce = {
            let _intake = self.intake.lock();
            let mut record = slot.record.lock();
            if record.status != OperationStatus::Building {
                return None;
            }
            let nonce = self.ledger.allocate(account, operation_id);
            self.queued.remove(&operation_id);
            self.book.register_pending(operation_id, order.delta());
            record.order = order.clone();
            record.nonce = Some(nonce);
            nonce
        };

        Some(Flight {
            id: operation_id,
            slot: slot.clone(),
            order,
            call,
            nonce,
            fee,
            hashes: Vec::new(),
            cancel_hashes: Vec::new(),
            cancelling: false,
            replacements: 0,
            conflicts: 0,
        })
    }

    async fn quote_fee(&self, call: &TxPayload) -> Result<FeeQuote, FailureReason> {
        match self
            .with_retry("estimate_fee", || self.client.estimate_fee(call))
            .await
        {
            Ok(fee) => Ok(FeeQuote {
                gas_limit: fee.gas_limit.min(self.config.execution.gas_limit),
                ..fee
            }),
            Err(e) => Err(gateway_failure("estimate_fee", e)),
        }
    }

    /// Make sure the router may pull the collateral an increase posts.
    ///
    /// Below the required allowance an ERC-20 approval for
    /// `approval_multiplier` times the collateral is signed at its own
    /// nonce and tracked until mined, so the position call that follows
    /// takes the next nonce. The operation stays `Building` throughout.
    async fn approve_collateral(
        &self,
        operation_id: OperationId,
        slot: &OperationSlot,
        order: &NormalizedOrder,
    ) -> Result<(), FailureReason> {
        let Some(token) = self.config.collateral_token else {
            return Ok(());
        };
        if !order.kind.adds_exposure() || order.collateral_delta <= Decimal::ZERO {
            return Ok(());
        }

        let account = self.config.account;
        let router = self.payloads.router();
        let allowance = self
            .with_retry("get_allowance", || self.client.get_allowance(account, router))
            .await
            .map_err(|e| gateway_failure("get_allowance", e))?;
        if allowance >= order.collateral_delta {
            return Ok(());
        }

        let amount = order
            .collateral_delta
            .checked_mul(self.config.execution.approval_multiplier)
            .unwrap_or(order.collateral_delta)
            .max(order.collateral_delta);
        let call = self
            .payloads
            .approve(token, amount, self.config.collateral_decimals)
            .map_err(|e| FailureReason::SubmissionRejected {
                detail: e.to_string(),
            })?;
        let mut fee = self.quote_fee(&call).await?;

        let fee_bump_bps = self.config.execution.fee_bump_bps;
        let max_retries = self.config.execution.max_retries;
        let mut nonce = self.ledger.allocate(account, operation_id);
        let mut hashes: Vec<B256> = Vec::new();
        let mut replacements = 0u32;
        let mut conflicts = 0u32;
        info!(%operation_id, %token, %allowance, %amount, nonce, "Approving collateral");

        let release = |nonce: u64| {
            self.ledger.release(account, nonce);
            self.client.forget_nonce(account, nonce);
        };
        let consume = |nonce: u64| {
            self.ledger.commit(account, nonce);
            self.client.forget_nonce(account, nonce);
        };

        loop {
            let signed = match self.signer.sign(&call, nonce, &fee).await {
                Ok(signed) => signed,
                Err(e) => {
                    if hashes.is_empty() {
                        release(nonce);
                    }
                    return Err(FailureReason::SigningUnavailable {
                        detail: e.to_string(),
                    });
                }
            };

            match self.submit(&signed).await {
                Ok(_) => {
                    Metrics::submission("approval");
                    hashes.push(signed.tx_hash);
                }
                Err(e) if e.is_timeout() => hashes.push(signed.tx_hash),
                Err(GatewayError::NonceTooLow(detail)) => {
                    if hashes.is_empty() || self.tracker.find_mined(&hashes).await.is_none() {
                        conflicts += 1;
                        if conflicts > max_retries {
                            consume(nonce);
                            return Err(FailureReason::RetriesExhausted { replacements });
                        }
                        let chain_next = self
                            .with_retry("get_nonce", || self.client.get_nonce(account))
                            .await
                            .map_err(|e| {
                                consume(nonce);
                                gateway_failure("get_nonce", e)
                            })?;
                        self.ledger.resync(account, chain_next);
                        let old = nonce;
                        nonce = self.ledger.replace(account, old, operation_id);
                        hashes.clear();
                        warn!(%operation_id, old_nonce = old, new_nonce = nonce, %detail, "Approval nonce conflict, resynchronised");
                        continue;
                    }
                }
                Err(GatewayError::Underpriced(detail)) => {
                    if replacements >= max_retries {
                        if hashes.is_empty() {
                            release(nonce);
                        }
                        return Err(FailureReason::RetriesExhausted { replacements });
                    }
                    replacements += 1;
                    fee = fee.bumped(fee_bump_bps);
                    info!(%operation_id, %detail, "Approval fee too low, bumping");
                    continue;
                }
                Err(e) => {
                    if hashes.is_empty() {
                        release(nonce);
                        return Err(FailureReason::SubmissionRejected {
                            detail: e.to_string(),
                        });
                    }
                    warn!(%operation_id, error = %e, "Approval replacement rejected, tracking earlier broadcasts");
                }
            }
            for hash in &hashes {
                self.tracker.register(*hash, operation_id);
            }

            match self.tracker.track(operation_id, &hashes, None).await {
                TrackOutcome::Confirmed(receipt) => {
                    consume(nonce);
                    let tx_hash = receipt.tx_hash.to_string();
                    self.update(slot, |r| {
                        if r.status != OperationStatus::Building {
                            return Err(CoreError::InvalidTransition {
                                from: r.status,
                                to: OperationStatus::Building,
                            });
                        }
                        r.approval_tx_hash = Some(tx_hash);
                        r.updated_at = Utc::now();
                        Ok(())
                    });
                    info!(%operation_id, tx_hash = %receipt.tx_hash, nonce, "Collateral approval mined");
                    return Ok(());
                }
                TrackOutcome::Reverted { tx_hash, reason } => {
                    consume(nonce);
                    return Err(FailureReason::ChainReverted {
                        tx_hash: tx_hash.to_string(),
                        reason,
                    });
                }
                TrackOutcome::Dropped | TrackOutcome::CancelRequested => {
                    if replacements >= max_retries {
                        release(nonce);
                        return Err(FailureReason::RetriesExhausted { replacements });
                    }
                    replacements += 1;
                    fee = fee.bumped(fee_bump_bps);
                    info!(%operation_id, nonce, replacements, "Replacing dropped approval");
                }
            }
        }
    }

    async fn fly(&self, mut flight: Flight, mut stage: Stage) {
        loop {
            if flight.slot.unsynced.load(Ordering::Acquire) {
                self.flush(&flight.slot).await;
            }
            stage = match stage {
                Stage::Broadcast(cause) => {
                    if self.broadcast(&mut flight, cause).await {
                        Stage::Track
                    } else {
                        return;
                    }
                }
                Stage::Track => {
                    let cancel = (!flight.cancelling).then_some(&flight.slot.cancel);
                    let outcome = self.tracker.track(flight.id, &flight.hashes, cancel).await;
                    match outcome {
                        TrackOutcome::Confirmed(receipt) => {
                            self.on_confirmed(&flight, receipt);
                            return;
                        }
                        TrackOutcome::Reverted { tx_hash, reason } => {
                            self.consume_nonce(&flight);
                            self.fail(
                                &flight.slot,
                                FailureReason::ChainReverted {
                                    tx_hash: tx_hash.to_string(),
                                    reason,
                                },
                            );
                            return;
                        }
                        TrackOutcome::Dropped => Stage::Replace,
                        TrackOutcome::CancelRequested => {
                            flight.cancelling = true;
                            flight.fee = flight.fee.bumped(self.config.execution.fee_bump_bps);
                            if !self.advance(&flight.slot, OperationStatus::Superseded) {
                                return;
                            }
                            Stage::Broadcast("cancel")
                        }
                    }
                }
                Stage::Replace => {
                    if !self.replace(&mut flight).await {
                        return;
                    }
                    Stage::Broadcast(if flight.cancelling { "cancel" } else { "fee_bump" })
                }
            };
        }
    }

    /// Dropped: bump the fee and prepare a replacement at the same nonce,
    /// or give up once the replacement budget is spent.
    async fn replace(&self, flight: &mut Flight) -> bool {
        let status = flight.slot.record.lock().status;
        if status != OperationStatus::Dropped && !self.advance(&flight.slot, OperationStatus::Dropped) {
            return false;
        }

        let max_retries = self.config.execution.max_retries;
        if flight.replacements >= max_retries {
            self.release_nonce(flight);
            self.fail(
                &flight.slot,
                FailureReason::RetriesExhausted {
                    replacements: flight.replacements,
                },
            );
            return false;
        }

        let bumped = flight.fee.bumped(self.config.execution.fee_bump_bps);
        flight.fee = match self.quote_fee(&flight.call).await {
            Ok(fresh) => bumped.max(&fresh),
            Err(_) => bumped,
        };
        flight.replacements += 1;
        let replacements = flight.replacements;

        info!(
            operation_id = %flight.id,
            nonce = flight.nonce,
            replacements,
            max_fee_per_gas = flight.fee.max_fee_per_gas,
            "Replacing dropped transaction"
        );
        self.update(&flight.slot, |r| {
            r.transition(OperationStatus::Superseded)?;
            r.replacements = replacements;
            Ok(())
        })
    }

    fn current_payload(&self, flight: &Flight) -> TxPayload {
        if flight.cancelling {
            self.payloads.cancel()
        } else {
            flight
                .call
                .with_value(U256::from(flight.fee.execution_fee))
        }
    }

    /// Sign and broadcast until the node takes the transaction.
    ///
    /// Returns true when there is something to track.
    async fn broadcast(&self, flight: &mut Flight, mut cause: &'static str) -> bool {
        let fee_bump_bps = self.config.execution.fee_bump_bps;
        let max_retries = self.config.execution.max_retries;

        loop {
            let payload = self.current_payload(flight);
            let signed = match self.signer.sign(&payload, flight.nonce, &flight.fee).await {
                Ok(signed) => signed,
                Err(e) => {
                    error!(operation_id = %flight.id, error = %e, "Signing failed");
                    if flight.hashes.is_empty() {
                        self.release_nonce(flight);
                    }
                    self.fail(
                        &flight.slot,
                        FailureReason::SigningUnavailable {
                            detail: e.to_string(),
                        },
                    );
                    return false;
                }
            };

            match self.record_signed(flight, &signed) {
                Applied::Persisted => {}
                Applied::Refused => {
                    if flight.hashes.is_empty() {
                        self.release_nonce(flight);
                    }
                    return false;
                }
                Applied::Unpersisted(detail) => {
                    // Nothing goes on the wire that the journal does not know about.
                    error!(
                        operation_id = %flight.id,
                        tx_hash = %signed.tx_hash,
                        nonce = flight.nonce,
                        error = %detail,
                        "Signed snapshot not journaled, not broadcasting"
                    );
                    let text = signed.tx_hash.to_string();
                    let strip = move |r: &mut OperationRecord| {
                        r.tx_hashes.retain(|h| *h != text);
                        if r.cancel_tx_hash.as_deref() == Some(text.as_str()) {
                            r.cancel_tx_hash = None;
                        }
                    };
                    if flight.hashes.is_empty() {
                        self.release_nonce(flight);
                        self.fail_with(&flight.slot, FailureReason::PersistenceFailed { detail }, strip);
                        return false;
                    }
                    // Earlier broadcasts are still out there.
                    return self.update(&flight.slot, |r| {
                        strip(r);
                        r.transition(OperationStatus::Submitted)
                    });
                }
            }

            match self.submit(&signed).await {
                Ok(_) => {
                    Metrics::submission(cause);
                    info!(
                        operation_id = %flight.id,
                        tx_hash = %signed.tx_hash,
                        nonce = flight.nonce,
                        cause,
                        "Transaction submitted"
                    );
                    return self.advance(&flight.slot, OperationStatus::Submitted);
                }
                Err(e) if e.is_timeout() => {
                    // May have reached the node; tracking decides.
                    warn!(
                        operation_id = %flight.id,
                        tx_hash = %signed.tx_hash,
                        "Submission outcome unknown after retries"
                    );
                    return self.advance(&flight.slot, OperationStatus::Submitted);
                }
                Err(GatewayError::NonceTooLow(detail)) => {
                    self.forget_signed(flight, &signed);
                    if !flight.hashes.is_empty() && self.tracker.find_mined(&flight.hashes).await.is_some() {
                        // An earlier broadcast of ours took the nonce.
                        return self.advance(&flight.slot, OperationStatus::Submitted);
                    }

                    flight.conflicts += 1;
                    if flight.conflicts > max_retries {
                        self.consume_nonce(flight);
                        self.fail(
                            &flight.slot,
                            FailureReason::RetriesExhausted {
                                replacements: flight.replacements,
                            },
                        );
                        return false;
                    }
                    if !self.resync_nonce(flight, &detail).await {
                        return false;
                    }
                    cause = "nonce_conflict";
                }
                Err(GatewayError::Underpriced(detail)) => {
                    self.forget_signed(flight, &signed);
                    if flight.replacements >= max_retries {
                        if flight.hashes.is_empty() {
                            self.release_nonce(flight);
                        }
                        self.fail(
                            &flight.slot,
                            FailureReason::RetriesExhausted {
                                replacements: flight.replacements,
                            },
                        );
                        return false;
                    }
                    flight.replacements += 1;
                    flight.fee = flight.fee.bumped(fee_bump_bps);
                    let replacements = flight.replacements;
                    info!(
                        operation_id = %flight.id,
                        %detail,
                        max_fee_per_gas = flight.fee.max_fee_per_gas,
                        "Fee too low, bumping"
                    );
                    if !self.update(&flight.slot, |r| {
                        r.transition(OperationStatus::Superseded)?;
                        r.replacements = replacements;
                        Ok(())
                    }) {
                        return false;
                    }
                    cause = "fee_bump";
                }
                Err(e) => {
                    self.forget_signed(flight, &signed);
                    if flight.hashes.is_empty() {
                        self.release_nonce(flight);
                        self.fail(
                            &flight.slot,
                            FailureReason::SubmissionRejected {
                                detail: e.to_string(),
                            },
                        );
                        return false;
                    }
                    // Earlier broadcasts are still out there.
                    warn!(operation_id = %flight.id, error = %e, "Replacement rejected, tracking earlier broadcasts");
                    return self.advance(&flight.slot, OperationStatus::Submitted);
                }
            }
        }
    }

    async fn submit(&self, signed: &SignedTx) -> GatewayResult<B256> {
        match self.with_retry("submit", || self.client.submit(signed)).await {
            Err(GatewayError::AlreadyInFlight { tx_hash }) => Ok(tx_hash),
            other => other,
        }
    }

    /// Signed: remember the hash before broadcasting it.
    fn record_signed(&self, flight: &mut Flight, signed: &SignedTx) -> Applied {
        let tx_hash = signed.tx_hash;
        let cancelling = flight.cancelling;
        let nonce = flight.nonce;
        let fee = flight.fee;
        let recorded = self.apply(&flight.slot, |r| {
            r.transition(OperationStatus::Signed)?;
            r.nonce = Some(nonce);
            r.fee = Some(fee);
            r.tx_hashes.push(tx_hash.to_string());
            if cancelling {
                r.cancel_tx_hash = Some(tx_hash.to_string());
            }
            Ok(())
        });
        if matches!(recorded, Applied::Persisted) {
            flight.hashes.push(tx_hash);
            if cancelling {
                flight.cancel_hashes.push(tx_hash);
            }
            self.tracker.register(tx_hash, flight.id);
        }
        recorded
    }

    /// The node definitely refused `signed`.
    fn forget_signed(&self, flight: &mut Flight, signed: &SignedTx) {
        let hash = signed.tx_hash;
        flight.hashes.retain(|h| *h != hash);
        flight.cancel_hashes.retain(|h| *h != hash);
        let text = hash.to_string();
        let mut record = flight.slot.record.lock();
        record.tx_hashes.retain(|h| *h != text);
        if record.cancel_tx_hash.as_deref() == Some(text.as_str()) {
            record.cancel_tx_hash = None;
        }
    }

    /// The chain already used our nonce for something else: take a new one.
    async fn resync_nonce(&self, flight: &mut Flight, detail: &str) -> bool {
        let account = self.config.account;
        let chain_next = match self
            .with_retry("get_nonce", || self.client.get_nonce(account))
            .await
        {
            Ok(next) => next,
            Err(e) => {
                self.consume_nonce(flight);
                self.fail(&flight.slot, gateway_failure("get_nonce", e));
                return false;
            }
        };

        let old = flight.nonce;
        self.ledger.resync(account, chain_next);
        flight.nonce = self.ledger.replace(account, old, flight.id);
        warn!(
            operation_id = %flight.id,
            old_nonce = old,
            new_nonce = flight.nonce,
            chain_next,
            %detail,
            "Nonce conflict, resynchronised"
        );
        self.advance(&flight.slot, OperationStatus::Superseded)
    }

    fn release_nonce(&self, flight: &Flight) {
        self.ledger.release(self.config.account, flight.nonce);
        self.client.forget_nonce(self.config.account, flight.nonce);
    }

    fn consume_nonce(&self, flight: &Flight) {
        self.ledger.commit(self.config.account, flight.nonce);
        self.client.forget_nonce(self.config.account, flight.nonce);
    }

    fn resume_transition(&self, record: &mut OperationRecord, next: OperationStatus) {
        match record.transition(next) {
            Ok(()) => {
                let _ = self.persist(record);
            }
            Err(e) => warn!(operation_id = %record.operation_id, error = %e, "Resume transition refused"),
        }
    }

    fn on_confirmed(&self, flight: &Flight, receipt: Receipt) {
        self.consume_nonce(flight);

        if flight.cancel_hashes.contains(&receipt.tx_hash) {
            info!(operation_id = %flight.id, tx_hash = %receipt.tx_hash, "Cancel replacement mined");
            self.advance(&flight.slot, OperationStatus::Cancelled);
            return;
        }

        let price = receipt.execution_price.unwrap_or(flight.order.mark_price);
        let delta = flight.order.delta().at_price(price);
        let result = match self
            .book
            .apply_confirmed(flight.id, &delta, receipt.block_height)
        {
            Ok(position) => Some(position),
            Err(e) => {
                error!(
                    operation_id = %flight.id,
                    tx_hash = %receipt.tx_hash,
                    error = %e,
                    "Confirmed delta could not be applied to the position book"
                );
                None
            }
        };

        let submitted_at = flight.slot.record.lock().submitted_at;
        self.update(&flight.slot, |r| {
            r.transition(OperationStatus::Confirmed)?;
            r.result = result;
            Ok(())
        });

        if let Some(submitted_at) = submitted_at {
            let latency_ms = (Utc::now() - submitted_at).num_milliseconds().max(0) as f64;
            Metrics::confirmation_latency(flight.order.market.as_str(), latency_ms);
        }
        Metrics::open_positions_set(self.book.open_count() as i64);
        info!(
            operation_id = %flight.id,
            tx_hash = %receipt.tx_hash,
            block_height = receipt.block_height,
            %price,
            "Operation confirmed"
        );
    }

    /// Rebuild the flight of an in-flight record and spawn its drive.
    ///
    /// Returns false when the record lacks what tracking needs and was
    /// failed instead.
    fn resume_flight(self: &Arc<Self>, mut record: OperationRecord) -> ExecutionResult<bool> {
        let operation_id = record.operation_id;
        let hashes: Vec<B256> = record
            .tx_hashes
            .iter()
            .filter_map(|h| B256::from_str(h).ok())
            .collect();
        let cancel_hashes: Vec<B256> = record
            .cancel_tx_hash
            .iter()
            .filter_map(|h| B256::from_str(h).ok())
            .collect();

        let (Some(nonce), Some(fee)) = (record.nonce, record.fee) else {
            if let Err(e) = record.fail(FailureReason::Interrupted) {
                warn!(%operation_id, error = %e, "Could not fail interrupted operation");
            }
            let _ = self.persist(&record);
            self.operations.insert(operation_id, OperationSlot::new(record));
            return Ok(false);
        };
        let call = self.payloads.build(&record.order)?;

        self.ledger.reserve(self.config.account, nonce, operation_id);
        self.book.register_pending(operation_id, record.order.delta());
        for hash in &hashes {
            self.tracker.register(*hash, operation_id);
        }

        let stage = match record.status {
            // Nothing recorded as broadcast: sign again at the same nonce
            OperationStatus::Signed if hashes.is_empty() => {
                self.resume_transition(&mut record, OperationStatus::Superseded);
                Stage::Broadcast("resume")
            }
            OperationStatus::Signed => {
                self.resume_transition(&mut record, OperationStatus::Submitted);
                Stage::Track
            }
            OperationStatus::Submitted if hashes.is_empty() => Stage::Replace,
            OperationStatus::Submitted => Stage::Track,
            OperationStatus::Dropped => Stage::Replace,
            _ => Stage::Broadcast("resume"),
        };

        let flight = Flight {
            id: operation_id,
            slot: OperationSlot::new(record.clone()),
            order: record.order.clone(),
            call,
            nonce,
            fee,
            hashes,
            cancelling: !cancel_hashes.is_empty(),
            cancel_hashes,
            replacements: record.replacements,
            conflicts: 0,
        };
        if record.cancel_requested && !flight.cancelling {
            flight.slot.cancel.notify_one();
        }

        self.operations.insert(operation_id, flight.slot.clone());
        let ticket = self.sequencer.enqueue(record.order.position_key());
        Metrics::in_flight_inc();
        info!(
            %operation_id,
            status = %record.status,
            nonce,
            broadcasts = flight.hashes.len(),
            "Resuming in-flight operation"
        );

        let slot = flight.slot.clone();
        tokio::spawn(self.clone().drive(
            operation_id,
            slot,
            ticket,
            Start::Resume(Box::new(flight), stage),
        ));
        Ok(true)
    }
}

fn gateway_failure(call: &'static str, error: GatewayError) -> FailureReason {
    if error.is_timeout() {
        FailureReason::NetworkTimeout {
            call: call.to_string(),
        }
    } else {
        FailureReason::SubmissionRejected {
            detail: error.to_string(),
        }
    }
}

fn error_call(error: &ExecutionError) -> String {
    match error {
        ExecutionError::NetworkTimeout { call } => call.clone(),
        ExecutionError::Gateway(GatewayError::Timeout { call, .. }) => (*call).to_string(),
        other => other.to_string(),
    }
}
