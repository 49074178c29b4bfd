//! Core types and traits for the RetroLedger adjustment engine.
//!
//! This crate provides the `StorageBackend` trait and all associated types,
//! enabling pluggable storage implementations in separate crates.

pub mod models;
pub mod period;
pub mod policy;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{
    AdjustmentRequest, AdjustmentStatus, CashLedgerEntry, ClosedPeriod, CompanyCapital, CompanyId,
    MonthlyAdjustmentAggregate, ProfitDeduction, RequestId,
};
pub use models::write::{
    AggregateDelta, CreateAdjustmentCommand, CreateCompanyCommand, DecisionCommand,
    LedgerEntryCommand, ProfitDeductionCommand,
};
pub use period::{ParsePeriodError, Period};
pub use policy::{
    AdjustmentCategory, CapitalMagnitude, CategoryPolicy, EffectProfile, UnknownCategory,
};
pub use storage::{StorageBackend, StorageError, TransactionId};
