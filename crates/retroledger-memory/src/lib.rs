//! In-memory storage backend.
//!
//! Writes go through a single `RwLock`, which serializes the read-modify-write
//! on capital balances and aggregate rows. Transactions are snapshot-based:
//! `begin_transaction` clones the store, `rollback_transaction` restores the
//! clone wholesale.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use rust_decimal::Decimal;
use time::OffsetDateTime;

use retroledger_core::{
    models::write::{
        AggregateDelta, CreateCompanyCommand, DecisionCommand, LedgerEntryCommand,
        ProfitDeductionCommand,
    },
    AdjustmentRequest, AdjustmentStatus, CashLedgerEntry, ClosedPeriod, CompanyCapital, CompanyId,
    MonthlyAdjustmentAggregate, Period, ProfitDeduction, RequestId, StorageBackend, StorageError,
    TransactionId,
};

#[derive(Clone, Default)]
struct Inner {
    companies: BTreeMap<CompanyId, CompanyCapital>,
    closed_periods: BTreeMap<(Arc<str>, Period), OffsetDateTime>,
    requests: BTreeMap<RequestId, AdjustmentRequest>,
    ledger: Vec<CashLedgerEntry>,
    profit_base: BTreeMap<(Arc<str>, Period), Decimal>,
    deductions: Vec<ProfitDeduction>,
    aggregates: BTreeMap<(Arc<str>, Period), MonthlyAdjustmentAggregate>,
    posted: HashSet<RequestId>,
}

struct Snapshot {
    inner: Inner,
    entry_value: u64,
}

pub struct InMemoryStorage {
    inner: RwLock<Inner>,
    entry_counter: AtomicU64,
    tx_counter: AtomicU64,
    snapshots: RwLock<HashMap<TransactionId, Snapshot>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            entry_counter: AtomicU64::new(1),
            tx_counter: AtomicU64::new(1),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn next_entry_id(&self) -> u64 {
        self.entry_counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl StorageBackend for InMemoryStorage {
    fn create_company(&self, command: &CreateCompanyCommand) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        if inner.companies.contains_key(&command.id) {
            return Err(StorageError::CompanyAlreadyExists(command.id));
        }
        inner.companies.insert(
            command.id,
            CompanyCapital {
                company_id: command.id,
                name: command.name.clone(),
                division: command.division.clone(),
                balance: command.opening_capital,
            },
        );
        Ok(())
    }

    fn get_company(&self, company_id: CompanyId) -> Result<CompanyCapital, StorageError> {
        self.inner
            .read()
            .unwrap()
            .companies
            .get(&company_id)
            .cloned()
            .ok_or(StorageError::CompanyNotFound(company_id))
    }

    fn list_companies(&self) -> Result<Vec<CompanyCapital>, StorageError> {
        Ok(self.inner.read().unwrap().companies.values().cloned().collect())
    }

    fn close_period(&self, division: &str, period: Period) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let key = (Arc::from(division), period);
        if inner.closed_periods.contains_key(&key) {
            return Err(StorageError::PeriodAlreadyClosed {
                division: division.to_string(),
                period,
            });
        }
        inner.closed_periods.insert(key, OffsetDateTime::now_utc());
        Ok(())
    }

    fn is_period_closed(&self, division: &str, period: Period) -> Result<bool, StorageError> {
        let key = (Arc::from(division), period);
        Ok(self.inner.read().unwrap().closed_periods.contains_key(&key))
    }

    fn list_closed_periods(&self, division: &str) -> Result<Vec<ClosedPeriod>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .closed_periods
            .iter()
            .filter(|((d, _), _)| d.as_ref() == division)
            .map(|((d, period), closed_at)| ClosedPeriod {
                division: d.clone(),
                period: *period,
                closed_at: *closed_at,
            })
            .collect())
    }

    fn insert_request(&self, request: &AdjustmentRequest) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        if inner.requests.contains_key(&request.id) {
            return Err(StorageError::Other(format!(
                "request {} already exists",
                request.id
            )));
        }
        inner.requests.insert(request.id, request.clone());
        Ok(())
    }

    fn get_request(&self, id: RequestId) -> Result<AdjustmentRequest, StorageError> {
        self.inner
            .read()
            .unwrap()
            .requests
            .get(&id)
            .cloned()
            .ok_or(StorageError::RequestNotFound(id))
    }

    fn list_requests(
        &self,
        division: Option<&str>,
        status: Option<AdjustmentStatus>,
    ) -> Result<Vec<AdjustmentRequest>, StorageError> {
        let inner = self.inner.read().unwrap();
        let mut result: Vec<AdjustmentRequest> = inner
            .requests
            .values()
            .filter(|r| division.map_or(true, |d| r.division.as_ref() == d))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    fn record_decision(
        &self,
        id: RequestId,
        decision: &DecisionCommand,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(StorageError::RequestNotFound(id))?;
        if request.status != AdjustmentStatus::Pending {
            return Err(StorageError::Conflict(format!(
                "request {} is {}, not pending",
                id, request.status
            )));
        }
        request.status = decision.status;
        request.reviewed_by = Some(decision.reviewed_by.clone());
        request.reviewed_at = Some(decision.reviewed_at);
        request.rejection_reason = decision.rejection_reason.clone();
        Ok(())
    }

    fn append_ledger_entry(&self, entry: &LedgerEntryCommand) -> Result<(), StorageError> {
        let id = self.next_entry_id();
        let mut inner = self.inner.write().unwrap();
        inner.ledger.push(CashLedgerEntry {
            id,
            date: entry.date,
            division: entry.division.clone(),
            company_id: entry.company_id,
            description: entry.description.clone(),
            debit: entry.debit,
            kredit: entry.kredit,
            request_id: entry.request_id,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    fn adjust_capital(
        &self,
        company_id: CompanyId,
        delta: Decimal,
    ) -> Result<Decimal, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let company = inner
            .companies
            .get_mut(&company_id)
            .ok_or(StorageError::CompanyNotFound(company_id))?;
        company.balance += delta;
        Ok(company.balance)
    }

    fn record_profit_deduction(
        &self,
        command: &ProfitDeductionCommand,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        inner.deductions.push(ProfitDeduction {
            period: command.period,
            division: command.division.clone(),
            category: command.category,
            description: command.description.clone(),
            nominal: command.nominal,
            request_id: command.request_id,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    fn apply_aggregate_delta(&self, delta: &AggregateDelta) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let key = (delta.division.clone(), delta.period);
        let aggregate = inner
            .aggregates
            .entry(key)
            .or_insert_with(|| MonthlyAdjustmentAggregate {
                period: delta.period,
                division: delta.division.clone(),
                total_adjustments: Decimal::ZERO,
                total_profit_impact: Decimal::ZERO,
                total_capital_impact: Decimal::ZERO,
                adjustment_count: 0,
                last_adjustment_date: delta.adjustment_date,
            });
        aggregate.total_adjustments += delta.nominal;
        aggregate.total_profit_impact += delta.profit_impact;
        aggregate.total_capital_impact += delta.capital_impact;
        aggregate.adjustment_count += 1;
        aggregate.last_adjustment_date = delta.adjustment_date;
        Ok(())
    }

    fn mark_posted(&self, id: RequestId) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.posted.insert(id) {
            return Err(StorageError::AlreadyPosted(id));
        }
        Ok(())
    }

    fn is_posted(&self, id: RequestId) -> Result<bool, StorageError> {
        Ok(self.inner.read().unwrap().posted.contains(&id))
    }

    fn get_ledger_entries(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Vec<CashLedgerEntry>, StorageError> {
        let inner = self.inner.read().unwrap();
        let (from, to) = (period.first_day(), period.last_day());
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.division.as_ref() == division && e.date >= from && e.date <= to)
            .cloned()
            .collect())
    }

    fn get_aggregate(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Option<MonthlyAdjustmentAggregate>, StorageError> {
        let key = (Arc::from(division), period);
        Ok(self.inner.read().unwrap().aggregates.get(&key).cloned())
    }

    fn set_base_profit(
        &self,
        division: &str,
        period: Period,
        amount: Decimal,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        inner.profit_base.insert((Arc::from(division), period), amount);
        Ok(())
    }

    fn get_profit(&self, division: &str, period: Period) -> Result<Decimal, StorageError> {
        let inner = self.inner.read().unwrap();
        let base = inner
            .profit_base
            .get(&(Arc::from(division), period))
            .copied()
            .unwrap_or(Decimal::ZERO);
        let deducted: Decimal = inner
            .deductions
            .iter()
            .filter(|d| d.division.as_ref() == division && d.period == period)
            .map(|d| d.nominal)
            .sum();
        Ok(base - deducted)
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let snapshot = Snapshot {
            inner: self.inner.read().unwrap().clone(),
            entry_value: self.entry_counter.load(Ordering::SeqCst),
        };
        self.snapshots.write().unwrap().insert(tx_id, snapshot);
        tracing::debug!(tx_id, "Transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .unwrap()
            .remove(&tx_id)
            .ok_or(StorageError::NoActiveTransaction)?;
        tracing::debug!(tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let snapshot = self
            .snapshots
            .write()
            .unwrap()
            .remove(&tx_id)
            .ok_or(StorageError::NoActiveTransaction)?;
        *self.inner.write().unwrap() = snapshot.inner;
        self.entry_counter.store(snapshot.entry_value, Ordering::SeqCst);
        tracing::debug!(tx_id, "Transaction rolled back");
        Ok(())
    }
}
