use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use retroledger::error::EngineError;
use retroledger::workflow::AdjustmentWorkflow;
use retroledger_core::{
    AdjustmentCategory, AdjustmentRequest, AdjustmentStatus, AggregateDelta, CashLedgerEntry,
    CategoryPolicy, CompanyCapital, CompanyId, CreateAdjustmentCommand, CreateCompanyCommand,
    DecisionCommand, LedgerEntryCommand, MonthlyAdjustmentAggregate, Period,
    ProfitDeductionCommand, RequestId, StorageBackend, StorageError, TransactionId,
};
use retroledger_memory::InMemoryStorage;
use retroledger_sqlite::SqliteStorage;

const DIVISION: &str = "sport";
const COMPANY: CompanyId = 7;

fn period() -> Period {
    "2024-03".parse().unwrap()
}

fn seed(storage: &dyn StorageBackend) {
    storage
        .create_company(&CreateCompanyCommand {
            id: COMPANY,
            name: Arc::from("Aneka Motor Sport"),
            division: Arc::from(DIVISION),
            opening_capital: dec!(2_000_000),
        })
        .unwrap();
    storage.close_period(DIVISION, period()).unwrap();
    storage
        .set_base_profit(DIVISION, period(), dec!(1_000_000))
        .unwrap();
}

fn setup() -> (Arc<dyn StorageBackend>, AdjustmentWorkflow) {
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    seed(storage.as_ref());
    let workflow = AdjustmentWorkflow::new(storage.clone(), CategoryPolicy::new());
    (storage, workflow)
}

fn setup_sqlite() -> (Arc<dyn StorageBackend>, AdjustmentWorkflow) {
    let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(":memory:").unwrap());
    seed(storage.as_ref());
    let workflow = AdjustmentWorkflow::new(storage.clone(), CategoryPolicy::new());
    (storage, workflow)
}

fn command(category: AdjustmentCategory, nominal: Decimal) -> CreateAdjustmentCommand {
    CreateAdjustmentCommand {
        period: period(),
        division: Arc::from(DIVISION),
        category,
        company_id: COMPANY,
        nominal,
        description: Arc::from("March correction"),
        notes: None,
    }
}

// --- Scenario bodies shared by both backends ---

fn run_global_operational_scenario(storage: &Arc<dyn StorageBackend>, workflow: &AdjustmentWorkflow) {
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::GlobalOperational, dec!(500_000)),
            "operator.budi",
        )
        .unwrap();
    assert_eq!(created.request.status, AdjustmentStatus::Pending);
    assert!(created.posting.is_none(), "capital categories require review");

    let outcome = workflow.approve(created.request.id, "reviewer.sari").unwrap();
    assert_eq!(outcome.capital_delta, dec!(500_000));
    assert_eq!(outcome.profit_delta, Decimal::ZERO);
    assert!(outcome.ledger_entry_written);
    assert!(!outcome.negative_balance);

    // Exactly one ledger row, dated inside the closed month
    let entries = storage.get_ledger_entries(DIVISION, period()).unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.date, period().last_day());
    assert_eq!(entry.debit, dec!(500_000));
    assert_eq!(entry.kredit, Decimal::ZERO);
    assert_eq!(entry.request_id, Some(created.request.id));

    // Capital reduced by the full nominal
    let capital = storage.get_company(COMPANY).unwrap();
    assert_eq!(capital.balance, dec!(1_500_000));

    // Aggregate reflects the posting
    let aggregate = storage.get_aggregate(DIVISION, period()).unwrap().unwrap();
    assert_eq!(aggregate.total_adjustments, dec!(500_000));
    assert_eq!(aggregate.total_capital_impact, dec!(500_000));
    assert_eq!(aggregate.total_profit_impact, Decimal::ZERO);
    assert_eq!(aggregate.adjustment_count, 1);

    // Profit untouched by a capital category
    assert_eq!(storage.get_profit(DIVISION, period()).unwrap(), dec!(1_000_000));

    // Decision fields recorded
    let request = workflow.get_request(created.request.id).unwrap();
    assert_eq!(request.status, AdjustmentStatus::Approved);
    assert_eq!(request.created_by.as_ref(), "operator.budi");
    assert_eq!(request.reviewed_by.as_deref(), Some("reviewer.sari"));
}

fn run_salary_shortfall_scenario(storage: &Arc<dyn StorageBackend>, workflow: &AdjustmentWorkflow) {
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::SalaryShortfallVsProfit, dec!(200_000)),
            "operator.budi",
        )
        .unwrap();
    // Pre-vetted category posts on creation
    assert_eq!(created.request.status, AdjustmentStatus::Approved);
    let outcome = created.posting.expect("auto-approved request must post");
    assert_eq!(outcome.profit_delta, dec!(200_000));
    assert_eq!(outcome.capital_delta, Decimal::ZERO);
    assert!(!outcome.ledger_entry_written);

    // No cash ledger row: the deduction must not hit profit-and-loss twice
    assert!(storage.get_ledger_entries(DIVISION, period()).unwrap().is_empty());

    // Profit reduced through the dedicated deduction operation
    assert_eq!(storage.get_profit(DIVISION, period()).unwrap(), dec!(800_000));

    // Capital untouched
    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(2_000_000));

    let aggregate = storage.get_aggregate(DIVISION, period()).unwrap().unwrap();
    assert_eq!(aggregate.total_profit_impact, dec!(200_000));
    assert_eq!(aggregate.total_capital_impact, Decimal::ZERO);
    assert_eq!(aggregate.adjustment_count, 1);
}

fn run_double_approval_scenario(storage: &Arc<dyn StorageBackend>, workflow: &AdjustmentWorkflow) {
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::GlobalOperational, dec!(500_000)),
            "operator.budi",
        )
        .unwrap();
    workflow.approve(created.request.id, "reviewer.sari").unwrap();

    // A retried approval must not double-post
    let err = workflow
        .approve(created.request.id, "reviewer.sari")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    assert_eq!(storage.get_ledger_entries(DIVISION, period()).unwrap().len(), 1);
    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(1_500_000));
    assert_eq!(
        storage.get_aggregate(DIVISION, period()).unwrap().unwrap().adjustment_count,
        1
    );
}

fn run_reject_scenario(storage: &Arc<dyn StorageBackend>, workflow: &AdjustmentWorkflow) {
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::CapitalShortfall, dec!(300_000)),
            "operator.budi",
        )
        .unwrap();
    let rejected = workflow
        .reject(created.request.id, "reviewer.sari", "No supporting documents")
        .unwrap();
    assert_eq!(rejected.status, AdjustmentStatus::Rejected);
    assert_eq!(
        rejected.rejection_reason.as_deref(),
        Some("No supporting documents")
    );
    assert_eq!(rejected.reviewed_by.as_deref(), Some("reviewer.sari"));

    // Zero effects on every derived store
    assert!(storage.get_ledger_entries(DIVISION, period()).unwrap().is_empty());
    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(2_000_000));
    assert_eq!(storage.get_profit(DIVISION, period()).unwrap(), dec!(1_000_000));
    assert!(storage.get_aggregate(DIVISION, period()).unwrap().is_none());
}

// --- In-memory backend ---

#[test]
fn test_global_operational_posting() {
    let (storage, workflow) = setup();
    run_global_operational_scenario(&storage, &workflow);
}

#[test]
fn test_salary_shortfall_reduces_profit_only() {
    let (storage, workflow) = setup();
    run_salary_shortfall_scenario(&storage, &workflow);
}

#[test]
fn test_double_approval_does_not_double_post() {
    let (storage, workflow) = setup();
    run_double_approval_scenario(&storage, &workflow);
}

#[test]
fn test_rejected_request_has_no_effects() {
    let (storage, workflow) = setup();
    run_reject_scenario(&storage, &workflow);
}

#[test]
fn test_decision_on_rejected_request_fails() {
    let (_storage, workflow) = setup();
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::CapitalShortfall, dec!(300_000)),
            "operator.budi",
        )
        .unwrap();
    workflow
        .reject(created.request.id, "reviewer.sari", "Duplicate of last month")
        .unwrap();

    let err = workflow
        .approve(created.request.id, "reviewer.sari")
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidStateTransition {
            status: AdjustmentStatus::Rejected,
            ..
        }
    ));
    let err = workflow
        .reject(created.request.id, "reviewer.sari", "Again")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
}

#[test]
fn test_open_period_is_ineligible() {
    let (storage, workflow) = setup();
    let open_month = CreateAdjustmentCommand {
        period: "2024-04".parse().unwrap(),
        ..command(AdjustmentCategory::GlobalOperational, dec!(500_000))
    };
    let err = workflow.create_request(&open_month, "operator.budi").unwrap_err();
    assert!(matches!(err, EngineError::IneligiblePeriod { .. }));

    // No request row was created
    assert!(storage.list_requests(None, None).unwrap().is_empty());
}

#[test]
fn test_creation_validations() {
    let (storage, workflow) = setup();

    let err = workflow
        .create_request(
            &command(AdjustmentCategory::GlobalOperational, Decimal::ZERO),
            "operator.budi",
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = workflow
        .create_request(
            &command(AdjustmentCategory::GlobalOperational, dec!(-100)),
            "operator.budi",
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let blank = CreateAdjustmentCommand {
        description: Arc::from("   "),
        ..command(AdjustmentCategory::GlobalOperational, dec!(100))
    };
    let err = workflow.create_request(&blank, "operator.budi").unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let unknown_company = CreateAdjustmentCommand {
        company_id: 99,
        ..command(AdjustmentCategory::GlobalOperational, dec!(100))
    };
    let err = workflow
        .create_request(&unknown_company, "operator.budi")
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let wrong_division = CreateAdjustmentCommand {
        division: Arc::from("mobil"),
        ..command(AdjustmentCategory::GlobalOperational, dec!(100))
    };
    let err = workflow
        .create_request(&wrong_division, "operator.budi")
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert!(storage.list_requests(None, None).unwrap().is_empty());
}

#[test]
fn test_rejection_requires_reason() {
    let (_storage, workflow) = setup();
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::GlobalOperational, dec!(100)),
            "operator.budi",
        )
        .unwrap();
    let err = workflow
        .reject(created.request.id, "reviewer.sari", "  ")
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(
        workflow.get_request(created.request.id).unwrap().status,
        AdjustmentStatus::Pending
    );
}

#[test]
fn test_approving_unknown_request_fails() {
    let (_storage, workflow) = setup();
    let err = workflow
        .approve(uuid::Uuid::new_v4(), "reviewer.sari")
        .unwrap_err();
    assert!(matches!(err, EngineError::RequestNotFound(_)));
}

#[test]
fn test_negative_balance_is_warned_not_rejected() {
    let (storage, workflow) = setup();
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::GlobalOperational, dec!(3_000_000)),
            "operator.budi",
        )
        .unwrap();
    let outcome = workflow.approve(created.request.id, "reviewer.sari").unwrap();
    assert!(outcome.negative_balance);
    assert_eq!(outcome.capital_balance, Some(dec!(-1_000_000)));

    // Posting succeeded despite the warning
    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(-1_000_000));
    assert_eq!(
        storage.get_aggregate(DIVISION, period()).unwrap().unwrap().adjustment_count,
        1
    );
}

#[test]
fn test_capital_shortfall_uses_netted_amount() {
    let (storage, workflow) = setup();
    let created = workflow
        .create_request(
            &command(AdjustmentCategory::CapitalShortfall, dec!(400_000)),
            "operator.budi",
        )
        .unwrap();
    let outcome = workflow.approve(created.request.id, "reviewer.sari").unwrap();

    // Netting ratio defaults to 1: same value as the full path
    assert_eq!(outcome.capital_delta, dec!(400_000));
    let entries = storage.get_ledger_entries(DIVISION, period()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].debit, dec!(400_000));
    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(1_600_000));
}

#[test]
fn test_aggregate_equals_sum_of_posted_requests() {
    let (storage, workflow) = setup();

    for _ in 0..2 {
        let created = workflow
            .create_request(
                &command(AdjustmentCategory::GlobalOperational, dec!(500_000)),
                "operator.budi",
            )
            .unwrap();
        workflow.approve(created.request.id, "reviewer.sari").unwrap();
    }
    workflow
        .create_request(
            &command(AdjustmentCategory::SalaryShortfallVsProfit, dec!(200_000)),
            "operator.budi",
        )
        .unwrap();

    let aggregate = storage.get_aggregate(DIVISION, period()).unwrap().unwrap();
    assert_eq!(aggregate.total_adjustments, dec!(1_200_000));
    assert_eq!(aggregate.total_capital_impact, dec!(1_000_000));
    assert_eq!(aggregate.total_profit_impact, dec!(200_000));
    assert_eq!(aggregate.adjustment_count, 3);

    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(1_000_000));
    assert_eq!(storage.get_profit(DIVISION, period()).unwrap(), dec!(800_000));
}

// --- Posting failure: rollback and idempotent retry ---

/// Delegating backend whose aggregate upsert can be switched off, standing in
/// for a backing store that fails mid-posting.
struct FlakyStorage {
    inner: InMemoryStorage,
    fail_aggregate: AtomicBool,
}

impl FlakyStorage {
    fn new() -> Self {
        Self {
            inner: InMemoryStorage::new(),
            fail_aggregate: AtomicBool::new(false),
        }
    }
}

impl StorageBackend for FlakyStorage {
    fn create_company(&self, command: &CreateCompanyCommand) -> Result<(), StorageError> {
        self.inner.create_company(command)
    }
    fn get_company(&self, company_id: CompanyId) -> Result<CompanyCapital, StorageError> {
        self.inner.get_company(company_id)
    }
    fn list_companies(&self) -> Result<Vec<CompanyCapital>, StorageError> {
        self.inner.list_companies()
    }
    fn close_period(&self, division: &str, period: Period) -> Result<(), StorageError> {
        self.inner.close_period(division, period)
    }
    fn is_period_closed(&self, division: &str, period: Period) -> Result<bool, StorageError> {
        self.inner.is_period_closed(division, period)
    }
    fn list_closed_periods(
        &self,
        division: &str,
    ) -> Result<Vec<retroledger_core::ClosedPeriod>, StorageError> {
        self.inner.list_closed_periods(division)
    }
    fn insert_request(&self, request: &AdjustmentRequest) -> Result<(), StorageError> {
        self.inner.insert_request(request)
    }
    fn get_request(&self, id: RequestId) -> Result<AdjustmentRequest, StorageError> {
        self.inner.get_request(id)
    }
    fn list_requests(
        &self,
        division: Option<&str>,
        status: Option<AdjustmentStatus>,
    ) -> Result<Vec<AdjustmentRequest>, StorageError> {
        self.inner.list_requests(division, status)
    }
    fn record_decision(
        &self,
        id: RequestId,
        decision: &DecisionCommand,
    ) -> Result<(), StorageError> {
        self.inner.record_decision(id, decision)
    }
    fn append_ledger_entry(&self, entry: &LedgerEntryCommand) -> Result<(), StorageError> {
        self.inner.append_ledger_entry(entry)
    }
    fn adjust_capital(
        &self,
        company_id: CompanyId,
        delta: Decimal,
    ) -> Result<Decimal, StorageError> {
        self.inner.adjust_capital(company_id, delta)
    }
    fn record_profit_deduction(
        &self,
        command: &ProfitDeductionCommand,
    ) -> Result<(), StorageError> {
        self.inner.record_profit_deduction(command)
    }
    fn apply_aggregate_delta(&self, delta: &AggregateDelta) -> Result<(), StorageError> {
        if self.fail_aggregate.load(Ordering::SeqCst) {
            return Err(StorageError::Other("aggregate store offline".to_string()));
        }
        self.inner.apply_aggregate_delta(delta)
    }
    fn mark_posted(&self, id: RequestId) -> Result<(), StorageError> {
        self.inner.mark_posted(id)
    }
    fn is_posted(&self, id: RequestId) -> Result<bool, StorageError> {
        self.inner.is_posted(id)
    }
    fn get_ledger_entries(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Vec<CashLedgerEntry>, StorageError> {
        self.inner.get_ledger_entries(division, period)
    }
    fn get_aggregate(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Option<MonthlyAdjustmentAggregate>, StorageError> {
        self.inner.get_aggregate(division, period)
    }
    fn set_base_profit(
        &self,
        division: &str,
        period: Period,
        amount: Decimal,
    ) -> Result<(), StorageError> {
        self.inner.set_base_profit(division, period, amount)
    }
    fn get_profit(&self, division: &str, period: Period) -> Result<Decimal, StorageError> {
        self.inner.get_profit(division, period)
    }
    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        self.inner.begin_transaction()
    }
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.inner.commit_transaction(tx_id)
    }
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.inner.rollback_transaction(tx_id)
    }
}

#[test]
fn test_failed_posting_leaves_request_pending_and_retries_cleanly() {
    let flaky = Arc::new(FlakyStorage::new());
    let storage: Arc<dyn StorageBackend> = flaky.clone();
    seed(storage.as_ref());
    let workflow = AdjustmentWorkflow::new(storage.clone(), CategoryPolicy::new());

    let created = workflow
        .create_request(
            &command(AdjustmentCategory::GlobalOperational, dec!(500_000)),
            "operator.budi",
        )
        .unwrap();

    flaky.fail_aggregate.store(true, Ordering::SeqCst);
    let err = workflow
        .approve(created.request.id, "reviewer.sari")
        .unwrap_err();
    assert!(matches!(err, EngineError::PostingFailure(_)));

    // Rolled back wholesale: still pending, no partial effect anywhere
    let request = workflow.get_request(created.request.id).unwrap();
    assert_eq!(request.status, AdjustmentStatus::Pending);
    assert!(storage.get_ledger_entries(DIVISION, period()).unwrap().is_empty());
    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(2_000_000));
    assert!(!storage.is_posted(created.request.id).unwrap());

    // The retried approval posts exactly once
    flaky.fail_aggregate.store(false, Ordering::SeqCst);
    workflow.approve(created.request.id, "reviewer.sari").unwrap();
    assert_eq!(storage.get_ledger_entries(DIVISION, period()).unwrap().len(), 1);
    assert_eq!(storage.get_company(COMPANY).unwrap().balance, dec!(1_500_000));
    assert_eq!(
        storage.get_aggregate(DIVISION, period()).unwrap().unwrap().adjustment_count,
        1
    );
}

// --- SQLite backend ---

#[test]
fn test_sqlite_global_operational_posting() {
    let (storage, workflow) = setup_sqlite();
    run_global_operational_scenario(&storage, &workflow);
}

#[test]
fn test_sqlite_salary_shortfall_reduces_profit_only() {
    let (storage, workflow) = setup_sqlite();
    run_salary_shortfall_scenario(&storage, &workflow);
}

#[test]
fn test_sqlite_double_approval_does_not_double_post() {
    let (storage, workflow) = setup_sqlite();
    run_double_approval_scenario(&storage, &workflow);
}

#[test]
fn test_sqlite_rejected_request_has_no_effects() {
    let (storage, workflow) = setup_sqlite();
    run_reject_scenario(&storage, &workflow);
}
