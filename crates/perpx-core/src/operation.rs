//! Operation lifecycle: identifiers, status lattice and durable records.

use crate::error::{CoreError, Result};
use crate::fee::FeeQuote;
use crate::intent::TradeIntent;
use crate::order::{NormalizedOrder, OperationKind, RejectReason};
use crate::position::Position;
use crate::types::{MarketId, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| CoreError::InvalidPayload(format!("invalid operation id: {e}")))
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status lattice
// ============================================================================

/// Operation status.
///
/// ```text
/// Validated -> Building -> Signed -> Submitted -> Confirmed
///                 |           |          |-----> Failed
///                 |           |          |-----> Dropped -> Superseded
///                 |           |          |-----> Superseded -> Signed
///                 |           |          '-----> Cancelled (cancel replacement confirmed)
///                 |           '-> Superseded (node refused nonce or fee)
///                 '-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Validated,
    Building,
    Signed,
    Submitted,
    Confirmed,
    Failed,
    Dropped,
    Superseded,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Confirmed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lattice.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Validated, Building | Cancelled | Failed)
                | (Building, Signed | Cancelled | Failed)
                | (Signed, Submitted | Superseded | Failed)
                | (Submitted, Confirmed | Failed | Dropped | Superseded | Cancelled)
                | (Dropped, Superseded | Failed)
                | (Superseded, Signed | Failed)
        )
    }

    /// Statuses that may hold a chain-visible transaction.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            OperationStatus::Signed
                | OperationStatus::Submitted
                | OperationStatus::Dropped
                | OperationStatus::Superseded
        )
    }

    /// Statuses that can still be cancelled without touching the chain.
    pub fn is_pre_submission(&self) -> bool {
        matches!(self, OperationStatus::Validated | OperationStatus::Building)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Validated => "validated",
            OperationStatus::Building => "building",
            OperationStatus::Signed => "signed",
            OperationStatus::Submitted => "submitted",
            OperationStatus::Confirmed => "confirmed",
            OperationStatus::Failed => "failed",
            OperationStatus::Dropped => "dropped",
            OperationStatus::Superseded => "superseded",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Re-validation at the head of the position queue failed.
    ValidationRejected { reason: RejectReason },
    SigningUnavailable { detail: String },
    NetworkTimeout { call: String },
    ChainReverted { tx_hash: String, reason: String },
    SubmissionRejected { detail: String },
    RetriesExhausted { replacements: u32 },
    /// The signed snapshot could not be journaled, so nothing was broadcast.
    PersistenceFailed { detail: String },
    /// Process stopped before the operation reached the chain.
    Interrupted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ValidationRejected { .. } => "validation_rejected",
            FailureReason::SigningUnavailable { .. } => "signing_unavailable",
            FailureReason::NetworkTimeout { .. } => "network_timeout",
            FailureReason::ChainReverted { .. } => "chain_reverted",
            FailureReason::SubmissionRejected { .. } => "submission_rejected",
            FailureReason::RetriesExhausted { .. } => "retries_exhausted",
            FailureReason::PersistenceFailed { .. } => "persistence_failed",
            FailureReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ValidationRejected { reason } => write!(f, "validation rejected: {reason}"),
            FailureReason::SigningUnavailable { detail } => write!(f, "signing unavailable: {detail}"),
            FailureReason::NetworkTimeout { call } => write!(f, "network timeout during {call}"),
            FailureReason::ChainReverted { tx_hash, reason } => {
                write!(f, "reverted in {tx_hash}: {reason}")
            }
            FailureReason::SubmissionRejected { detail } => write!(f, "submission rejected: {detail}"),
            FailureReason::RetriesExhausted { replacements } => {
                write!(f, "not confirmed after {replacements} replacements")
            }
            FailureReason::PersistenceFailed { detail } => write!(f, "persistence failed: {detail}"),
            FailureReason::Interrupted => write!(f, "interrupted before submission"),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Full state of one operation. Each status transition persists a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: OperationId,
    /// Signing account, hex encoded.
    pub account: String,
    pub intent: TradeIntent,
    pub order: NormalizedOrder,
    pub status: OperationStatus,
    pub nonce: Option<u64>,
    /// Every broadcast transaction hash, newest last.
    pub tx_hashes: Vec<String>,
    /// Hash of the cancel replacement, when one was broadcast.
    pub cancel_tx_hash: Option<String>,
    /// Collateral approval mined ahead of the position call.
    #[serde(default)]
    pub approval_tx_hash: Option<String>,
    /// Fee of the newest broadcast.
    pub fee: Option<FeeQuote>,
    pub replacements: u32,
    pub cancel_requested: bool,
    pub failure: Option<FailureReason>,
    /// Resulting position once confirmed.
    pub result: Option<Position>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(
        operation_id: OperationId,
        account: String,
        intent: TradeIntent,
        order: NormalizedOrder,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation_id,
            account,
            intent,
            order,
            status: OperationStatus::Validated,
            nonce: None,
            tx_hashes: Vec::new(),
            cancel_tx_hash: None,
            approval_tx_hash: None,
            fee: None,
            replacements: 0,
            cancel_requested: false,
            failure: None,
            result: None,
            created_at: now,
            submitted_at: None,
            updated_at: now,
        }
    }

    /// Move along the lattice, refusing any edge it does not contain.
    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == OperationStatus::Submitted && self.submitted_at.is_none() {
            self.submitted_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<()> {
        self.transition(OperationStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    pub fn latest_tx_hash(&self) -> Option<&str> {
        self.tx_hashes.last().map(String::as_str)
    }

    pub fn view(&self) -> OperationView {
        OperationView {
            operation_id: self.operation_id,
            status: self.status,
            market: self.order.market.clone(),
            side: self.order.side,
            kind: self.order.kind,
            idempotency_key: self.intent.idempotency_key.to_string(),
            nonce: self.nonce,
            tx_hashes: self.tx_hashes.clone(),
            failure: self.failure.clone(),
            position: if self.status == OperationStatus::Confirmed {
                self.result.clone()
            } else {
                None
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Caller-facing status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationView {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub market: MarketId,
    pub side: Side,
    pub kind: OperationKind,
    pub idempotency_key: String,
    pub nonce: Option<u64>,
    pub tx_hashes: Vec<String>,
    pub failure: Option<FailureReason>,
    /// Resulting position, present only when confirmed.
    pub position: Option<Position>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationStatus::*;

    const ALL: [OperationStatus; 9] = [
        Validated, Building, Signed, Submitted, Confirmed, Failed, Dropped, Superseded, Cancelled,
    ];

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [Validated, Building, Signed, Submitted, Confirmed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_replacement_cycle_is_allowed() {
        let path = [Submitted, Dropped, Superseded, Signed, Submitted, Superseded, Signed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_no_regression_to_pre_submission() {
        for from in [Signed, Submitted, Dropped, Superseded] {
            assert!(!from.can_transition_to(Validated));
            assert!(!from.can_transition_to(Building));
        }
        // Cancellation after signing only happens through a confirmed replacement
        assert!(!Signed.can_transition_to(Cancelled));
        assert!(!Dropped.can_transition_to(Cancelled));
    }

    #[test]
    fn test_every_non_terminal_status_can_fail() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(Failed), "{from} -> failed");
        }
    }

    #[test]
    fn test_operation_id_roundtrip_parse() {
        let id = OperationId::new();
        assert_eq!(OperationId::parse(&id.to_string()).unwrap(), id);
        assert!(OperationId::parse("nope").is_err());
    }

    #[test]
    fn test_failure_reason_tagged() {
        let json = serde_json::to_value(FailureReason::Interrupted).unwrap();
        assert_eq!(json["kind"], "interrupted");
    }
}
