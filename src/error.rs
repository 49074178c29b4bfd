use thiserror::Error;

use retroledger_core::{AdjustmentStatus, Period, RequestId, StorageError};

/// Error taxonomy of the adjustment engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid request fields. Rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The target month is not closed for the division (or the closure
    /// registry could not be read, which is treated the same way).
    #[error("period {period} is not closed for division {division}")]
    IneligiblePeriod { division: String, period: Period },
    /// A decision was attempted on a request that is no longer pending.
    #[error("request {id} is {status}; decisions are only valid on pending requests")]
    InvalidStateTransition {
        id: RequestId,
        status: AdjustmentStatus,
    },
    /// The atomic posting sequence failed and was rolled back. The request
    /// remains pending; the approval is safe to retry with no partial effect.
    #[error("posting failed: {0}")]
    PostingFailure(#[source] StorageError),
    /// Lost update detected on a capital balance or aggregate row.
    #[error("concurrent update conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("adjustment request not found: {0}")]
    RequestNotFound(RequestId),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// How the caller should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionClass {
    /// Rejected by business rule: fix the request and resubmit.
    BusinessRule,
    /// Nothing was written: safe to retry as-is.
    Retryable,
    NotFound,
    Internal,
}

impl RejectionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionClass::BusinessRule => "business_rule",
            RejectionClass::Retryable => "retryable",
            RejectionClass::NotFound => "not_found",
            RejectionClass::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn class(&self) -> RejectionClass {
        match self {
            EngineError::Validation(_)
            | EngineError::IneligiblePeriod { .. }
            | EngineError::InvalidStateTransition { .. } => RejectionClass::BusinessRule,
            EngineError::PostingFailure(_) | EngineError::ConcurrencyConflict(_) => {
                RejectionClass::Retryable
            }
            EngineError::RequestNotFound(_) => RejectionClass::NotFound,
            EngineError::Storage(_) => RejectionClass::Internal,
        }
    }
}
