//! Risk error types.
//!
//! Rejections are the enumerated [`RejectReason`] from perpx-core so the
//! engine and callers can branch on them without string matching.

pub use perpx_core::RejectReason;

pub type RiskResult<T> = Result<T, RejectReason>;
