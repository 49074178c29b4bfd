use std::sync::Arc;

use rust_decimal::Decimal;
use time::Date;
use tracing::{debug, warn};

use retroledger_core::{
    AdjustmentRequest, AggregateDelta, CategoryPolicy, LedgerEntryCommand,
    ProfitDeductionCommand, RequestId, StorageBackend, StorageError,
};

use crate::error::EngineError;

/// Effects applied by one posting.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingOutcome {
    pub request_id: RequestId,
    pub capital_delta: Decimal,
    pub profit_delta: Decimal,
    pub ledger_entry_written: bool,
    pub capital_balance: Option<Decimal>,
    /// The capital balance went below zero. Legitimate, but the UI flags it.
    pub negative_balance: bool,
}

/// Applies an approved request to the four derived stores.
///
/// `post` must run inside a storage transaction owned by the caller: it issues
/// up to four writes plus the idempotency marker, and the caller's rollback is
/// what guarantees no partial state survives a failure.
pub struct PostingEngine {
    storage: Arc<dyn StorageBackend>,
    policy: CategoryPolicy,
}

impl PostingEngine {
    pub fn new(storage: Arc<dyn StorageBackend>, policy: CategoryPolicy) -> Self {
        Self { storage, policy }
    }

    pub fn post(
        &self,
        request: &AdjustmentRequest,
        today: Date,
    ) -> Result<PostingOutcome, EngineError> {
        // Claim the per-request marker before writing any effect; a retried
        // approval that raced an already-completed posting stops here.
        match self.storage.mark_posted(request.id) {
            Ok(()) => {}
            Err(StorageError::AlreadyPosted(_)) => {
                return Err(EngineError::InvalidStateTransition {
                    id: request.id,
                    status: request.status,
                })
            }
            Err(e) => return Err(EngineError::PostingFailure(e)),
        }

        let profile = self.policy.effects_for(request.category);
        let capital_delta = self.policy.capital_delta(&profile, request.nominal);
        let profit_delta = self.policy.profit_delta(&profile, request.nominal);

        let mut ledger_entry_written = false;
        if profile.affects_cash_ledger {
            // Dated inside the target month so period reports pick the
            // correction up; created_at records when it was actually entered.
            self.storage
                .append_ledger_entry(&LedgerEntryCommand {
                    date: request.period.last_day(),
                    division: request.division.clone(),
                    company_id: request.company_id,
                    description: request.description.clone(),
                    debit: capital_delta,
                    kredit: Decimal::ZERO,
                    request_id: Some(request.id),
                })
                .map_err(EngineError::PostingFailure)?;
            ledger_entry_written = true;
        }

        let mut capital_balance = None;
        if profile.affects_capital {
            let balance = self
                .storage
                .adjust_capital(request.company_id, -capital_delta)
                .map_err(conflict_or_failure)?;
            capital_balance = Some(balance);
        }

        if profile.affects_profit {
            self.storage
                .record_profit_deduction(&ProfitDeductionCommand {
                    period: request.period,
                    division: request.division.clone(),
                    category: request.category,
                    description: request.description.clone(),
                    nominal: request.nominal,
                    request_id: request.id,
                })
                .map_err(EngineError::PostingFailure)?;
        }

        self.storage
            .apply_aggregate_delta(&AggregateDelta {
                period: request.period,
                division: request.division.clone(),
                nominal: request.nominal,
                profit_impact: profit_delta,
                capital_impact: capital_delta,
                adjustment_date: today,
            })
            .map_err(conflict_or_failure)?;

        let negative_balance = capital_balance.map_or(false, |b| b < Decimal::ZERO);
        if negative_balance {
            warn!(
                request_id = %request.id,
                company_id = request.company_id,
                balance = %capital_balance.unwrap_or_default(),
                "Capital balance went negative"
            );
        }

        debug!(
            request_id = %request.id,
            category = %request.category,
            capital_delta = %capital_delta,
            profit_delta = %profit_delta,
            "Adjustment posted"
        );

        Ok(PostingOutcome {
            request_id: request.id,
            capital_delta,
            profit_delta,
            ledger_entry_written,
            capital_balance,
            negative_balance,
        })
    }
}

fn conflict_or_failure(e: StorageError) -> EngineError {
    match e {
        StorageError::Conflict(reason) => EngineError::ConcurrencyConflict(reason),
        other => EngineError::PostingFailure(other),
    }
}
