use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{
    write::{
        AggregateDelta, CreateCompanyCommand, DecisionCommand, LedgerEntryCommand,
        ProfitDeductionCommand,
    },
    AdjustmentRequest, AdjustmentStatus, CashLedgerEntry, ClosedPeriod, CompanyCapital, CompanyId,
    MonthlyAdjustmentAggregate, RequestId,
};
use crate::period::Period;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
    #[error("company not found: {0}")]
    CompanyNotFound(CompanyId),
    #[error("company already exists: {0}")]
    CompanyAlreadyExists(CompanyId),
    #[error("adjustment request not found: {0}")]
    RequestNotFound(RequestId),
    #[error("period {period} already closed for division {division}")]
    PeriodAlreadyClosed { division: String, period: Period },
    #[error("request {0} already posted")]
    AlreadyPosted(RequestId),
    #[error("concurrent update conflict: {0}")]
    Conflict(String),
    #[error("no active transaction")]
    NoActiveTransaction,
}

pub type TransactionId = u64;

/// Backing store for the adjustment engine.
///
/// The posting sequence runs between `begin_transaction` and
/// `commit_transaction`; a backend must make `rollback_transaction` undo every
/// write issued since the begin, so a failed posting leaves no partial state.
pub trait StorageBackend: Send + Sync {
    // Companies (capital balances); ids are assigned by the master-data process
    fn create_company(&self, command: &CreateCompanyCommand) -> Result<(), StorageError>;
    fn get_company(&self, company_id: CompanyId) -> Result<CompanyCapital, StorageError>;
    fn list_companies(&self) -> Result<Vec<CompanyCapital>, StorageError>;

    // Closure registry; written by the month-close process, read as a gate
    fn close_period(&self, division: &str, period: Period) -> Result<(), StorageError>;
    fn is_period_closed(&self, division: &str, period: Period) -> Result<bool, StorageError>;
    fn list_closed_periods(&self, division: &str) -> Result<Vec<ClosedPeriod>, StorageError>;

    // Adjustment requests
    fn insert_request(&self, request: &AdjustmentRequest) -> Result<(), StorageError>;
    fn get_request(&self, id: RequestId) -> Result<AdjustmentRequest, StorageError>;
    fn list_requests(
        &self,
        division: Option<&str>,
        status: Option<AdjustmentStatus>,
    ) -> Result<Vec<AdjustmentRequest>, StorageError>;
    /// Applies the reviewer's decision, guarded on the stored status still
    /// being `pending`; a stale decision fails with `Conflict`.
    fn record_decision(&self, id: RequestId, decision: &DecisionCommand)
        -> Result<(), StorageError>;

    // Posting primitives
    fn append_ledger_entry(&self, entry: &LedgerEntryCommand) -> Result<(), StorageError>;
    /// Applies a signed delta to the company balance and returns the new
    /// balance. Never clamps at zero.
    fn adjust_capital(&self, company_id: CompanyId, delta: Decimal)
        -> Result<Decimal, StorageError>;
    fn record_profit_deduction(&self, command: &ProfitDeductionCommand)
        -> Result<(), StorageError>;
    fn apply_aggregate_delta(&self, delta: &AggregateDelta) -> Result<(), StorageError>;
    /// Claims the unique posting marker for a request; a second claim fails
    /// with `AlreadyPosted`.
    fn mark_posted(&self, id: RequestId) -> Result<(), StorageError>;
    fn is_posted(&self, id: RequestId) -> Result<bool, StorageError>;

    // Reporting reads
    fn get_ledger_entries(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Vec<CashLedgerEntry>, StorageError>;
    fn get_aggregate(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Option<MonthlyAdjustmentAggregate>, StorageError>;
    /// Base profit for a month, written by the sales/cost pipeline. The
    /// engine itself never calls this; it only subtracts via deductions.
    fn set_base_profit(
        &self,
        division: &str,
        period: Period,
        amount: Decimal,
    ) -> Result<(), StorageError>;
    /// Net profit: base figure minus the sum of posted deductions.
    fn get_profit(&self, division: &str, period: Period) -> Result<Decimal, StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
}
