use std::{fmt, str::FromStr, sync::Arc};

use rust_decimal::Decimal;
use thiserror::Error;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::period::Period;
use crate::policy::AdjustmentCategory;

pub mod read;
pub mod write;

pub type CompanyId = i64;
pub type RequestId = Uuid;

/// Lifecycle state of an adjustment request. `pending` may transition once to
/// `approved` or `rejected`; both of those are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdjustmentStatus {
    Pending,
    Approved,
    Rejected,
}

impl AdjustmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentStatus::Pending => "pending",
            AdjustmentStatus::Approved => "approved",
            AdjustmentStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AdjustmentStatus::Pending)
    }
}

impl fmt::Display for AdjustmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown adjustment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for AdjustmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AdjustmentStatus::Pending),
            "approved" => Ok(AdjustmentStatus::Approved),
            "rejected" => Ok(AdjustmentStatus::Rejected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// The workflow object an operator submits to correct a closed month.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentRequest {
    pub id: RequestId,
    pub period: Period,
    pub division: Arc<str>,
    pub category: AdjustmentCategory,
    pub company_id: CompanyId,
    pub nominal: Decimal,
    pub description: Arc<str>,
    pub notes: Option<Arc<str>>,
    pub status: AdjustmentStatus,
    pub created_by: Arc<str>,
    pub created_at: OffsetDateTime,
    pub reviewed_by: Option<Arc<str>>,
    pub reviewed_at: Option<OffsetDateTime>,
    pub rejection_reason: Option<Arc<str>>,
}

/// One debit/credit row in the cash ledger. Append-only: corrections are new
/// rows, never edits.
#[derive(Debug, Clone, PartialEq)]
pub struct CashLedgerEntry {
    pub id: u64,
    /// Effective date; retroactive rows carry a date inside the target month
    /// while `created_at` records when the row was actually entered.
    pub date: Date,
    pub division: Arc<str>,
    pub company_id: CompanyId,
    pub description: Arc<str>,
    pub debit: Decimal,
    /// Credit column, kept under the name the report pages consume.
    pub kredit: Decimal,
    /// Back-reference to the adjustment request that produced this row, when
    /// there is one.
    pub request_id: Option<RequestId>,
    pub created_at: OffsetDateTime,
}

/// Per-company capital balance. Mutated only through signed deltas; a
/// negative balance is legitimate and surfaces as a warning, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyCapital {
    pub company_id: CompanyId,
    pub name: Arc<str>,
    pub division: Arc<str>,
    pub balance: Decimal,
}

/// One row per (period, division): cumulative effects of every adjustment
/// posted for that key.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyAdjustmentAggregate {
    pub period: Period,
    pub division: Arc<str>,
    pub total_adjustments: Decimal,
    pub total_profit_impact: Decimal,
    pub total_capital_impact: Decimal,
    pub adjustment_count: u32,
    pub last_adjustment_date: Date,
}

/// A month whose books are closed for a division. Written once by the
/// month-close process; this engine only reads it as an eligibility gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPeriod {
    pub division: Arc<str>,
    pub period: Period,
    pub closed_at: OffsetDateTime,
}

/// Append-only record behind the monthly profit figure. The profit for a
/// (period, division) is the base figure minus the sum of these.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfitDeduction {
    pub period: Period,
    pub division: Arc<str>,
    pub category: AdjustmentCategory,
    pub description: Arc<str>,
    pub nominal: Decimal,
    pub request_id: RequestId,
    pub created_at: OffsetDateTime,
}
