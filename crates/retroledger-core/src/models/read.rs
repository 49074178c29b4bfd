//! Read views consumed by the approval UI and the reporting pages.
//!
//! Periods are always rendered as the `month` "YYYY-MM" string plus the
//! integer `year`, the pair downstream consumers key on.

use rust_decimal::Decimal;
use serde::Serialize;
use time::Date;

use super::{
    AdjustmentRequest, CashLedgerEntry, ClosedPeriod, CompanyCapital, CompanyId,
    MonthlyAdjustmentAggregate,
};
use crate::period::Period;

fn fmt_date(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentView {
    pub id: String,
    pub month: String,
    pub year: i32,
    pub division: String,
    pub category: String,
    pub company_id: CompanyId,
    pub nominal: Decimal,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: String,
    pub created_by: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl From<&AdjustmentRequest> for AdjustmentView {
    fn from(request: &AdjustmentRequest) -> Self {
        Self {
            id: request.id.to_string(),
            month: request.period.to_string(),
            year: request.period.year(),
            division: request.division.to_string(),
            category: request.category.to_string(),
            company_id: request.company_id,
            nominal: request.nominal,
            description: request.description.to_string(),
            notes: request.notes.as_ref().map(|n| n.to_string()),
            status: request.status.to_string(),
            created_by: request.created_by.to_string(),
            created_at: request.created_at.to_string(),
            reviewed_by: request.reviewed_by.as_ref().map(|r| r.to_string()),
            reviewed_at: request.reviewed_at.map(|t| t.to_string()),
            rejection_reason: request.rejection_reason.as_ref().map(|r| r.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntryView {
    pub id: u64,
    pub date: String,
    pub division: String,
    pub company_id: CompanyId,
    pub description: String,
    pub debit: Decimal,
    pub kredit: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at: String,
}

impl From<&CashLedgerEntry> for LedgerEntryView {
    fn from(entry: &CashLedgerEntry) -> Self {
        Self {
            id: entry.id,
            date: fmt_date(entry.date),
            division: entry.division.to_string(),
            company_id: entry.company_id,
            description: entry.description.to_string(),
            debit: entry.debit,
            kredit: entry.kredit,
            request_id: entry.request_id.map(|id| id.to_string()),
            created_at: entry.created_at.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapitalView {
    pub company_id: CompanyId,
    pub name: String,
    pub division: String,
    pub balance: Decimal,
    /// Negative balances are legitimate but flagged for the UI.
    pub negative: bool,
}

impl From<&CompanyCapital> for CapitalView {
    fn from(capital: &CompanyCapital) -> Self {
        Self {
            company_id: capital.company_id,
            name: capital.name.to_string(),
            division: capital.division.to_string(),
            balance: capital.balance,
            negative: capital.balance.is_sign_negative() && !capital.balance.is_zero(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateView {
    pub month: String,
    pub year: i32,
    pub division: String,
    pub total_adjustments: Decimal,
    pub total_profit_impact: Decimal,
    pub total_capital_impact: Decimal,
    pub adjustment_count: u32,
    pub last_adjustment_date: String,
}

impl From<&MonthlyAdjustmentAggregate> for AggregateView {
    fn from(aggregate: &MonthlyAdjustmentAggregate) -> Self {
        Self {
            month: aggregate.period.to_string(),
            year: aggregate.period.year(),
            division: aggregate.division.to_string(),
            total_adjustments: aggregate.total_adjustments,
            total_profit_impact: aggregate.total_profit_impact,
            total_capital_impact: aggregate.total_capital_impact,
            adjustment_count: aggregate.adjustment_count,
            last_adjustment_date: fmt_date(aggregate.last_adjustment_date),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClosedPeriodView {
    pub division: String,
    pub month: String,
    pub year: i32,
    pub closed_at: String,
}

impl From<&ClosedPeriod> for ClosedPeriodView {
    fn from(closed: &ClosedPeriod) -> Self {
        Self {
            division: closed.division.to_string(),
            month: closed.period.to_string(),
            year: closed.period.year(),
            closed_at: closed.closed_at.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfitView {
    pub month: String,
    pub year: i32,
    pub division: String,
    pub profit: Decimal,
}

impl ProfitView {
    pub fn new(division: &str, period: Period, profit: Decimal) -> Self {
        Self {
            month: period.to_string(),
            year: period.year(),
            division: division.to_string(),
            profit,
        }
    }
}
