use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use retroledger_core::{
    AdjustmentRequest, AdjustmentStatus, CategoryPolicy, CreateAdjustmentCommand, DecisionCommand,
    RequestId, StorageBackend, StorageError,
};

use crate::error::EngineError;
use crate::posting::{PostingEngine, PostingOutcome};

/// Conflicted decisions re-read the request and retry this many times before
/// surfacing to the caller.
const DECISION_RETRIES: usize = 3;

/// Result of a create: the stored request, plus the posting effects when the
/// category auto-approved.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub request: AdjustmentRequest,
    pub posting: Option<PostingOutcome>,
}

/// The request lifecycle: creation with its validations, then one decision.
pub struct AdjustmentWorkflow {
    storage: Arc<dyn StorageBackend>,
    engine: PostingEngine,
    policy: CategoryPolicy,
}

impl AdjustmentWorkflow {
    pub fn new(storage: Arc<dyn StorageBackend>, policy: CategoryPolicy) -> Self {
        Self {
            engine: PostingEngine::new(storage.clone(), policy.clone()),
            storage,
            policy,
        }
    }

    pub fn create_request(
        &self,
        command: &CreateAdjustmentCommand,
        created_by: &str,
    ) -> Result<CreateOutcome, EngineError> {
        if command.nominal <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "nominal must be positive".to_string(),
            ));
        }
        if command.description.trim().is_empty() {
            return Err(EngineError::Validation(
                "description must not be empty".to_string(),
            ));
        }
        let company = match self.storage.get_company(command.company_id) {
            Ok(company) => company,
            Err(StorageError::CompanyNotFound(id)) => {
                return Err(EngineError::Validation(format!(
                    "company {} does not exist",
                    id
                )))
            }
            Err(e) => return Err(EngineError::Storage(e)),
        };
        if company.division != command.division {
            return Err(EngineError::Validation(format!(
                "company {} belongs to division {}, not {}",
                command.company_id, company.division, command.division
            )));
        }

        // Eligibility gate; an unreachable registry reads as not closed
        let closed = self
            .storage
            .is_period_closed(&command.division, command.period)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Closure registry unavailable, treating period as open");
                false
            });
        if !closed {
            return Err(EngineError::IneligiblePeriod {
                division: command.division.to_string(),
                period: command.period,
            });
        }

        let now = OffsetDateTime::now_utc();
        let mut request = AdjustmentRequest {
            id: Uuid::new_v4(),
            period: command.period,
            division: command.division.clone(),
            category: command.category,
            company_id: command.company_id,
            nominal: command.nominal,
            description: command.description.clone(),
            notes: command.notes.clone(),
            status: AdjustmentStatus::Pending,
            created_by: Arc::from(created_by),
            created_at: now,
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
        };

        let profile = self.policy.effects_for(command.category);
        if !profile.auto_approve {
            self.storage.insert_request(&request)?;
            metrics::increment_counter!("retroledger_requests_pending");
            info!(
                request_id = %request.id,
                division = %request.division,
                category = %request.category,
                "Adjustment request awaiting review"
            );
            return Ok(CreateOutcome {
                request,
                posting: None,
            });
        }

        // Pre-vetted category: created approved and posted in one unit of work
        request.status = AdjustmentStatus::Approved;
        request.reviewed_by = Some(Arc::from(created_by));
        request.reviewed_at = Some(now);

        let tx_id = self
            .storage
            .begin_transaction()
            .map_err(EngineError::PostingFailure)?;
        let result = self
            .storage
            .insert_request(&request)
            .map_err(EngineError::PostingFailure)
            .and_then(|_| self.engine.post(&request, now.date()));
        match result {
            Ok(outcome) => {
                self.storage
                    .commit_transaction(tx_id)
                    .map_err(EngineError::PostingFailure)?;
                metrics::increment_counter!("retroledger_requests_posted");
                info!(
                    request_id = %request.id,
                    division = %request.division,
                    category = %request.category,
                    "Adjustment auto-approved and posted"
                );
                Ok(CreateOutcome {
                    request,
                    posting: Some(outcome),
                })
            }
            Err(e) => {
                self.rollback(tx_id, &request.id);
                Err(e)
            }
        }
    }

    /// Approves a pending request, posting its effects synchronously in one
    /// storage transaction. A failed posting rolls back and leaves the
    /// request pending.
    pub fn approve(
        &self,
        id: RequestId,
        reviewed_by: &str,
    ) -> Result<PostingOutcome, EngineError> {
        let mut attempt = 0;
        loop {
            match self.try_approve(id, reviewed_by) {
                Err(EngineError::ConcurrencyConflict(reason)) if attempt + 1 < DECISION_RETRIES => {
                    attempt += 1;
                    warn!(request_id = %id, attempt, %reason, "Conflict during approval, retrying");
                }
                other => return other,
            }
        }
    }

    fn try_approve(
        &self,
        id: RequestId,
        reviewed_by: &str,
    ) -> Result<PostingOutcome, EngineError> {
        let request = self.load(id)?;
        if request.status != AdjustmentStatus::Pending {
            return Err(EngineError::InvalidStateTransition {
                id,
                status: request.status,
            });
        }

        let now = OffsetDateTime::now_utc();
        let tx_id = self
            .storage
            .begin_transaction()
            .map_err(EngineError::PostingFailure)?;
        let result = self.engine.post(&request, now.date()).and_then(|outcome| {
            self.storage
                .record_decision(
                    id,
                    &DecisionCommand {
                        status: AdjustmentStatus::Approved,
                        reviewed_by: Arc::from(reviewed_by),
                        reviewed_at: now,
                        rejection_reason: None,
                    },
                )
                .map_err(|e| match e {
                    StorageError::Conflict(reason) => EngineError::ConcurrencyConflict(reason),
                    other => EngineError::PostingFailure(other),
                })?;
            Ok(outcome)
        });

        match result {
            Ok(outcome) => {
                self.storage
                    .commit_transaction(tx_id)
                    .map_err(EngineError::PostingFailure)?;
                metrics::increment_counter!("retroledger_requests_posted");
                info!(
                    request_id = %id,
                    reviewed_by,
                    capital_delta = %outcome.capital_delta,
                    profit_delta = %outcome.profit_delta,
                    "Adjustment approved and posted"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.rollback(tx_id, &id);
                Err(e)
            }
        }
    }

    /// Rejects a pending request. No side effects beyond the decision fields.
    pub fn reject(
        &self,
        id: RequestId,
        reviewed_by: &str,
        reason: &str,
    ) -> Result<AdjustmentRequest, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::Validation(
                "rejection reason must not be empty".to_string(),
            ));
        }
        let request = self.load(id)?;
        if request.status != AdjustmentStatus::Pending {
            return Err(EngineError::InvalidStateTransition {
                id,
                status: request.status,
            });
        }

        let decision = DecisionCommand {
            status: AdjustmentStatus::Rejected,
            reviewed_by: Arc::from(reviewed_by),
            reviewed_at: OffsetDateTime::now_utc(),
            rejection_reason: Some(Arc::from(reason)),
        };
        match self.storage.record_decision(id, &decision) {
            Ok(()) => {}
            // A racing reviewer decided first; report the fresh state
            Err(StorageError::Conflict(_)) => {
                let fresh = self.load(id)?;
                return Err(EngineError::InvalidStateTransition {
                    id,
                    status: fresh.status,
                });
            }
            Err(e) => return Err(EngineError::Storage(e)),
        }

        metrics::increment_counter!("retroledger_requests_rejected");
        info!(request_id = %id, reviewed_by, "Adjustment rejected");
        self.load(id)
    }

    pub fn get_request(&self, id: RequestId) -> Result<AdjustmentRequest, EngineError> {
        self.load(id)
    }

    fn load(&self, id: RequestId) -> Result<AdjustmentRequest, EngineError> {
        match self.storage.get_request(id) {
            Ok(request) => Ok(request),
            Err(StorageError::RequestNotFound(id)) => Err(EngineError::RequestNotFound(id)),
            Err(e) => Err(EngineError::Storage(e)),
        }
    }

    fn rollback(&self, tx_id: retroledger_core::TransactionId, request_id: &RequestId) {
        if let Err(e) = self.storage.rollback_transaction(tx_id) {
            warn!(request_id = %request_id, error = %e, "Rollback after failed posting also failed");
        }
    }
}
