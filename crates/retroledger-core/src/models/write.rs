use std::sync::Arc;

use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};

use super::{AdjustmentStatus, CompanyId, RequestId};
use crate::period::Period;
use crate::policy::AdjustmentCategory;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateAdjustmentCommand {
    pub period: Period,
    pub division: Arc<str>,
    pub category: AdjustmentCategory,
    pub company_id: CompanyId,
    pub nominal: Decimal,
    pub description: Arc<str>,
    pub notes: Option<Arc<str>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntryCommand {
    pub date: Date,
    pub division: Arc<str>,
    pub company_id: CompanyId,
    pub description: Arc<str>,
    pub debit: Decimal,
    pub kredit: Decimal,
    pub request_id: Option<RequestId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfitDeductionCommand {
    pub period: Period,
    pub division: Arc<str>,
    pub category: AdjustmentCategory,
    pub description: Arc<str>,
    pub nominal: Decimal,
    pub request_id: RequestId,
}

/// Increments applied to the (period, division) aggregate row for one posted
/// request.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDelta {
    pub period: Period,
    pub division: Arc<str>,
    pub nominal: Decimal,
    pub profit_impact: Decimal,
    pub capital_impact: Decimal,
    pub adjustment_date: Date,
}

/// Issued by the master-data process, which assigns company ids.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateCompanyCommand {
    pub id: CompanyId,
    pub name: Arc<str>,
    pub division: Arc<str>,
    pub opening_capital: Decimal,
}

/// The reviewer's verdict on a pending request. `status` is `Approved` or
/// `Rejected`; a rejection carries its reason.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionCommand {
    pub status: AdjustmentStatus,
    pub reviewed_by: Arc<str>,
    pub reviewed_at: OffsetDateTime,
    pub rejection_reason: Option<Arc<str>>,
}
