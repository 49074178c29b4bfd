//! SQLite storage backend.
//!
//! A single connection behind a `Mutex` serializes writers; the posting
//! sequence runs inside a SAVEPOINT so a failed posting rolls back every row
//! it touched. Decimals and dates are stored as TEXT, timestamps as unix
//! seconds.

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use retroledger_core::{
    models::write::{
        AggregateDelta, CreateCompanyCommand, DecisionCommand, LedgerEntryCommand,
        ProfitDeductionCommand,
    },
    AdjustmentCategory, AdjustmentRequest, AdjustmentStatus, CashLedgerEntry, ClosedPeriod,
    CompanyCapital, CompanyId, MonthlyAdjustmentAggregate, Period, RequestId, StorageBackend,
    StorageError, TransactionId,
};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
    active_tx: Mutex<Option<TransactionId>>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| StorageError::Other(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
            active_tx: Mutex::new(None),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                division TEXT NOT NULL,
                balance TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS closed_periods (
                division TEXT NOT NULL,
                month TEXT NOT NULL,
                year INTEGER NOT NULL,
                closed_at INTEGER NOT NULL,
                PRIMARY KEY (division, month)
            );

            CREATE TABLE IF NOT EXISTS adjustment_requests (
                id TEXT PRIMARY KEY,
                month TEXT NOT NULL,
                year INTEGER NOT NULL,
                division TEXT NOT NULL,
                category TEXT NOT NULL,
                company_id INTEGER NOT NULL,
                nominal TEXT NOT NULL,
                description TEXT NOT NULL,
                notes TEXT,
                status TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                reviewed_by TEXT,
                reviewed_at INTEGER,
                rejection_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS cash_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                division TEXT NOT NULL,
                company_id INTEGER NOT NULL,
                description TEXT NOT NULL,
                debit TEXT NOT NULL,
                kredit TEXT NOT NULL,
                request_id TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS profit_base (
                division TEXT NOT NULL,
                month TEXT NOT NULL,
                year INTEGER NOT NULL,
                amount TEXT NOT NULL,
                PRIMARY KEY (division, month)
            );

            CREATE TABLE IF NOT EXISTS profit_deductions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                division TEXT NOT NULL,
                month TEXT NOT NULL,
                year INTEGER NOT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                nominal TEXT NOT NULL,
                request_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS monthly_adjustments (
                division TEXT NOT NULL,
                month TEXT NOT NULL,
                year INTEGER NOT NULL,
                total_adjustments TEXT NOT NULL,
                total_profit_impact TEXT NOT NULL,
                total_capital_impact TEXT NOT NULL,
                adjustment_count INTEGER NOT NULL,
                last_adjustment_date TEXT NOT NULL,
                PRIMARY KEY (division, month)
            );

            CREATE TABLE IF NOT EXISTS postings (
                request_id TEXT PRIMARY KEY,
                posted_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_division_date
                ON cash_ledger(division, date);

            CREATE INDEX IF NOT EXISTS idx_deductions_division_month
                ON profit_deductions(division, month);

            CREATE INDEX IF NOT EXISTS idx_requests_division_status
                ON adjustment_requests(division, status);
            ",
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }
}

fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

fn str_to_date(s: &str) -> Date {
    let parts: Vec<&str> = s.split('-').collect();
    let year = parts[0].parse::<i32>().unwrap();
    let month = parts[1].parse::<u8>().unwrap();
    let day = parts[2].parse::<u8>().unwrap();
    Date::from_calendar_date(year, Month::try_from(month).unwrap(), day).unwrap()
}

fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn ts_to_datetime(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

type RequestRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    Option<String>,
    Option<i64>,
    Option<String>,
);

const REQUEST_COLUMNS: &str = "id, month, division, category, company_id, nominal, description, \
     notes, status, created_by, created_at, reviewed_by, reviewed_at, rejection_reason";

fn map_request_row(row: &rusqlite::Row) -> rusqlite::Result<RequestRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn row_to_request(row: RequestRow) -> Result<AdjustmentRequest, StorageError> {
    let (
        id,
        month,
        division,
        category,
        company_id,
        nominal,
        description,
        notes,
        status,
        created_by,
        created_at,
        reviewed_by,
        reviewed_at,
        rejection_reason,
    ) = row;
    Ok(AdjustmentRequest {
        id: Uuid::parse_str(&id).map_err(|e| StorageError::Other(e.to_string()))?,
        period: Period::from_str(&month).map_err(|e| StorageError::Other(e.to_string()))?,
        division: Arc::from(division.as_str()),
        category: AdjustmentCategory::from_str(&category)
            .map_err(|e| StorageError::Other(e.to_string()))?,
        company_id,
        nominal: parse_decimal(&nominal),
        description: Arc::from(description.as_str()),
        notes: notes.map(|n| Arc::from(n.as_str())),
        status: AdjustmentStatus::from_str(&status)
            .map_err(|e| StorageError::Other(e.to_string()))?,
        created_by: Arc::from(created_by.as_str()),
        created_at: ts_to_datetime(created_at),
        reviewed_by: reviewed_by.map(|r| Arc::from(r.as_str())),
        reviewed_at: reviewed_at.map(ts_to_datetime),
        rejection_reason: rejection_reason.map(|r| Arc::from(r.as_str())),
    })
}

impl StorageBackend for SqliteStorage {
    fn create_company(&self, command: &CreateCompanyCommand) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO companies (id, name, division, balance) VALUES (?1, ?2, ?3, ?4)",
            params![
                command.id,
                command.name.as_ref(),
                command.division.as_ref(),
                command.opening_capital.to_string()
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StorageError::CompanyAlreadyExists(command.id)
            } else {
                StorageError::Other(e.to_string())
            }
        })?;
        Ok(())
    }

    fn get_company(&self, company_id: CompanyId) -> Result<CompanyCapital, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT name, division, balance FROM companies WHERE id = ?1",
            params![company_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );
        match result {
            Ok((name, division, balance)) => Ok(CompanyCapital {
                company_id,
                name: Arc::from(name.as_str()),
                division: Arc::from(division.as_str()),
                balance: parse_decimal(&balance),
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(StorageError::CompanyNotFound(company_id))
            }
            Err(e) => Err(StorageError::Other(e.to_string())),
        }
    }

    fn list_companies(&self) -> Result<Vec<CompanyCapital>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name, division, balance FROM companies ORDER BY id")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            let (id, name, division, balance) =
                row.map_err(|e| StorageError::Other(e.to_string()))?;
            result.push(CompanyCapital {
                company_id: id,
                name: Arc::from(name.as_str()),
                division: Arc::from(division.as_str()),
                balance: parse_decimal(&balance),
            });
        }
        Ok(result)
    }

    fn close_period(&self, division: &str, period: Period) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO closed_periods (division, month, year, closed_at) VALUES (?1, ?2, ?3, ?4)",
            params![division, period.to_string(), period.year(), now_ts()],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StorageError::PeriodAlreadyClosed {
                    division: division.to_string(),
                    period,
                }
            } else {
                StorageError::Other(e.to_string())
            }
        })?;
        Ok(())
    }

    fn is_period_closed(&self, division: &str, period: Period) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM closed_periods WHERE division = ?1 AND month = ?2",
            params![division, period.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Other(e.to_string()))
    }

    fn list_closed_periods(&self, division: &str) -> Result<Vec<ClosedPeriod>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT month, closed_at FROM closed_periods WHERE division = ?1 ORDER BY month")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let rows = stmt
            .query_map(params![division], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            let (month, closed_at) = row.map_err(|e| StorageError::Other(e.to_string()))?;
            result.push(ClosedPeriod {
                division: Arc::from(division),
                period: Period::from_str(&month)
                    .map_err(|e| StorageError::Other(e.to_string()))?,
                closed_at: ts_to_datetime(closed_at),
            });
        }
        Ok(result)
    }

    fn insert_request(&self, request: &AdjustmentRequest) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO adjustment_requests (id, month, year, division, category, company_id, \
             nominal, description, notes, status, created_by, created_at, reviewed_by, \
             reviewed_at, rejection_reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                request.id.to_string(),
                request.period.to_string(),
                request.period.year(),
                request.division.as_ref(),
                request.category.as_str(),
                request.company_id,
                request.nominal.to_string(),
                request.description.as_ref(),
                request.notes.as_ref().map(|n| n.as_ref()),
                request.status.as_str(),
                request.created_by.as_ref(),
                request.created_at.unix_timestamp(),
                request.reviewed_by.as_ref().map(|r| r.as_ref()),
                request.reviewed_at.map(|t| t.unix_timestamp()),
                request.rejection_reason.as_ref().map(|r| r.as_ref()),
            ],
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    fn get_request(&self, id: RequestId) -> Result<AdjustmentRequest, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            &format!("SELECT {} FROM adjustment_requests WHERE id = ?1", REQUEST_COLUMNS),
            params![id.to_string()],
            map_request_row,
        );
        match result {
            Ok(row) => row_to_request(row),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StorageError::RequestNotFound(id)),
            Err(e) => Err(StorageError::Other(e.to_string())),
        }
    }

    fn list_requests(
        &self,
        division: Option<&str>,
        status: Option<AdjustmentStatus>,
    ) -> Result<Vec<AdjustmentRequest>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!(
            "SELECT {} FROM adjustment_requests WHERE 1=1",
            REQUEST_COLUMNS
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(division) = division {
            args.push(division.to_string());
            sql.push_str(&format!(" AND division = ?{}", args.len()));
        }
        if let Some(status) = status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), map_request_row)
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            let row = row.map_err(|e| StorageError::Other(e.to_string()))?;
            result.push(row_to_request(row)?);
        }
        Ok(result)
    }

    fn record_decision(
        &self,
        id: RequestId,
        decision: &DecisionCommand,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        // Guarded on status so a racing second decision cannot win
        let updated = conn
            .execute(
                "UPDATE adjustment_requests \
                 SET status = ?2, reviewed_by = ?3, reviewed_at = ?4, rejection_reason = ?5 \
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    id.to_string(),
                    decision.status.as_str(),
                    decision.reviewed_by.as_ref(),
                    decision.reviewed_at.unix_timestamp(),
                    decision.rejection_reason.as_ref().map(|r| r.as_ref()),
                ],
            )
            .map_err(|e| StorageError::Other(e.to_string()))?;

        if updated == 0 {
            let status: Result<String, _> = conn.query_row(
                "SELECT status FROM adjustment_requests WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            );
            return match status {
                Ok(s) => Err(StorageError::Conflict(format!(
                    "request {} is {}, not pending",
                    id, s
                ))),
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    Err(StorageError::RequestNotFound(id))
                }
                Err(e) => Err(StorageError::Other(e.to_string())),
            };
        }
        Ok(())
    }

    fn append_ledger_entry(&self, entry: &LedgerEntryCommand) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cash_ledger (date, division, company_id, description, debit, kredit, \
             request_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                date_to_str(entry.date),
                entry.division.as_ref(),
                entry.company_id,
                entry.description.as_ref(),
                entry.debit.to_string(),
                entry.kredit.to_string(),
                entry.request_id.map(|id| id.to_string()),
                now_ts(),
            ],
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    fn adjust_capital(
        &self,
        company_id: CompanyId,
        delta: Decimal,
    ) -> Result<Decimal, StorageError> {
        let conn = self.conn.lock().unwrap();
        let balance: Result<String, _> = conn.query_row(
            "SELECT balance FROM companies WHERE id = ?1",
            params![company_id],
            |row| row.get(0),
        );
        let balance = match balance {
            Ok(b) => parse_decimal(&b),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StorageError::CompanyNotFound(company_id))
            }
            Err(e) => return Err(StorageError::Other(e.to_string())),
        };

        let new_balance = balance + delta;
        conn.execute(
            "UPDATE companies SET balance = ?2 WHERE id = ?1",
            params![company_id, new_balance.to_string()],
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(new_balance)
    }

    fn record_profit_deduction(
        &self,
        command: &ProfitDeductionCommand,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO profit_deductions (division, month, year, category, description, \
             nominal, request_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                command.division.as_ref(),
                command.period.to_string(),
                command.period.year(),
                command.category.as_str(),
                command.description.as_ref(),
                command.nominal.to_string(),
                command.request_id.to_string(),
                now_ts(),
            ],
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    fn apply_aggregate_delta(&self, delta: &AggregateDelta) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let existing: Result<(String, String, String, u32), _> = conn.query_row(
            "SELECT total_adjustments, total_profit_impact, total_capital_impact, \
             adjustment_count FROM monthly_adjustments WHERE division = ?1 AND month = ?2",
            params![delta.division.as_ref(), delta.period.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        );

        let (total, profit, capital, count) = match existing {
            Ok((t, p, c, n)) => (parse_decimal(&t), parse_decimal(&p), parse_decimal(&c), n),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, 0)
            }
            Err(e) => return Err(StorageError::Other(e.to_string())),
        };

        conn.execute(
            "INSERT OR REPLACE INTO monthly_adjustments (division, month, year, \
             total_adjustments, total_profit_impact, total_capital_impact, adjustment_count, \
             last_adjustment_date) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                delta.division.as_ref(),
                delta.period.to_string(),
                delta.period.year(),
                (total + delta.nominal).to_string(),
                (profit + delta.profit_impact).to_string(),
                (capital + delta.capital_impact).to_string(),
                count + 1,
                date_to_str(delta.adjustment_date),
            ],
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    fn mark_posted(&self, id: RequestId) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO postings (request_id, posted_at) VALUES (?1, ?2)",
            params![id.to_string(), now_ts()],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StorageError::AlreadyPosted(id)
            } else {
                StorageError::Other(e.to_string())
            }
        })?;
        Ok(())
    }

    fn is_posted(&self, id: RequestId) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM postings WHERE request_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Other(e.to_string()))
    }

    fn get_ledger_entries(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Vec<CashLedgerEntry>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, date, company_id, description, debit, kredit, request_id, created_at \
                 FROM cash_ledger WHERE division = ?1 AND date >= ?2 AND date <= ?3 \
                 ORDER BY date, id",
            )
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let rows = stmt
            .query_map(
                params![
                    division,
                    date_to_str(period.first_day()),
                    date_to_str(period.last_day())
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            let (id, date, company_id, description, debit, kredit, request_id, created_at) =
                row.map_err(|e| StorageError::Other(e.to_string()))?;
            result.push(CashLedgerEntry {
                id: id as u64,
                date: str_to_date(&date),
                division: Arc::from(division),
                company_id,
                description: Arc::from(description.as_str()),
                debit: parse_decimal(&debit),
                kredit: parse_decimal(&kredit),
                request_id: request_id.and_then(|id| Uuid::parse_str(&id).ok()),
                created_at: ts_to_datetime(created_at),
            });
        }
        Ok(result)
    }

    fn get_aggregate(
        &self,
        division: &str,
        period: Period,
    ) -> Result<Option<MonthlyAdjustmentAggregate>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT total_adjustments, total_profit_impact, total_capital_impact, \
             adjustment_count, last_adjustment_date FROM monthly_adjustments \
             WHERE division = ?1 AND month = ?2",
            params![division, period.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        );
        match result {
            Ok((total, profit, capital, count, last_date)) => {
                Ok(Some(MonthlyAdjustmentAggregate {
                    period,
                    division: Arc::from(division),
                    total_adjustments: parse_decimal(&total),
                    total_profit_impact: parse_decimal(&profit),
                    total_capital_impact: parse_decimal(&capital),
                    adjustment_count: count,
                    last_adjustment_date: str_to_date(&last_date),
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::Other(e.to_string())),
        }
    }

    fn set_base_profit(
        &self,
        division: &str,
        period: Period,
        amount: Decimal,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO profit_base (division, month, year, amount) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                division,
                period.to_string(),
                period.year(),
                amount.to_string()
            ],
        )
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    fn get_profit(&self, division: &str, period: Period) -> Result<Decimal, StorageError> {
        let conn = self.conn.lock().unwrap();
        let base: Result<String, _> = conn.query_row(
            "SELECT amount FROM profit_base WHERE division = ?1 AND month = ?2",
            params![division, period.to_string()],
            |row| row.get(0),
        );
        let base = match base {
            Ok(b) => parse_decimal(&b),
            Err(rusqlite::Error::QueryReturnedNoRows) => Decimal::ZERO,
            Err(e) => return Err(StorageError::Other(e.to_string())),
        };

        // Sum in Decimal; summing TEXT columns in SQL would coerce to REAL
        let mut stmt = conn
            .prepare("SELECT nominal FROM profit_deductions WHERE division = ?1 AND month = ?2")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let rows = stmt
            .query_map(params![division, period.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut deducted = Decimal::ZERO;
        for row in rows {
            let nominal = row.map_err(|e| StorageError::Other(e.to_string()))?;
            deducted += parse_decimal(&nominal);
        }
        Ok(base - deducted)
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("SAVEPOINT retroledger_tx")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *self.active_tx.lock().unwrap() = Some(tx_id);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx.lock().unwrap();
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("RELEASE SAVEPOINT retroledger_tx")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        *active = None;
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx.lock().unwrap();
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("ROLLBACK TO SAVEPOINT retroledger_tx")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        *active = None;
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_company() -> SqliteStorage {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage
            .create_company(&CreateCompanyCommand {
                id: 7,
                name: Arc::from("Aneka Motor"),
                division: Arc::from("sport"),
                opening_capital: Decimal::from(2_000_000),
            })
            .unwrap();
        storage
    }

    #[test]
    fn test_company_round_trip() {
        let storage = storage_with_company();
        let capital = storage.get_company(7).unwrap();
        assert_eq!(capital.name.as_ref(), "Aneka Motor");
        assert_eq!(capital.balance, Decimal::from(2_000_000));
        assert!(matches!(
            storage.get_company(8),
            Err(StorageError::CompanyNotFound(8))
        ));
    }

    #[test]
    fn test_duplicate_company_rejected() {
        let storage = storage_with_company();
        let err = storage
            .create_company(&CreateCompanyCommand {
                id: 7,
                name: Arc::from("Duplicate"),
                division: Arc::from("sport"),
                opening_capital: Decimal::ZERO,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::CompanyAlreadyExists(7)));
    }

    #[test]
    fn test_capital_adjustment_goes_negative() {
        let storage = storage_with_company();
        let balance = storage.adjust_capital(7, Decimal::from(-3_000_000)).unwrap();
        assert_eq!(balance, Decimal::from(-1_000_000));
        assert_eq!(
            storage.get_company(7).unwrap().balance,
            Decimal::from(-1_000_000)
        );
    }

    #[test]
    fn test_transaction_rollback_undoes_posting_writes() {
        let storage = storage_with_company();
        let period: Period = "2024-03".parse().unwrap();
        let request_id = Uuid::new_v4();

        let tx_id = storage.begin_transaction().unwrap();
        storage
            .append_ledger_entry(&LedgerEntryCommand {
                date: period.last_day(),
                division: Arc::from("sport"),
                company_id: 7,
                description: Arc::from("Correction"),
                debit: Decimal::from(500_000),
                kredit: Decimal::ZERO,
                request_id: Some(request_id),
            })
            .unwrap();
        storage.adjust_capital(7, Decimal::from(-500_000)).unwrap();
        storage.mark_posted(request_id).unwrap();
        storage.rollback_transaction(tx_id).unwrap();

        assert!(storage.get_ledger_entries("sport", period).unwrap().is_empty());
        assert_eq!(
            storage.get_company(7).unwrap().balance,
            Decimal::from(2_000_000)
        );
        assert!(!storage.is_posted(request_id).unwrap());
    }

    #[test]
    fn test_aggregate_upsert_accumulates() {
        let storage = storage_with_company();
        let period: Period = "2024-03".parse().unwrap();
        let delta = AggregateDelta {
            period,
            division: Arc::from("sport"),
            nominal: Decimal::from(500_000),
            profit_impact: Decimal::ZERO,
            capital_impact: Decimal::from(500_000),
            adjustment_date: period.last_day(),
        };
        storage.apply_aggregate_delta(&delta).unwrap();
        storage.apply_aggregate_delta(&delta).unwrap();

        let aggregate = storage.get_aggregate("sport", period).unwrap().unwrap();
        assert_eq!(aggregate.total_adjustments, Decimal::from(1_000_000));
        assert_eq!(aggregate.total_capital_impact, Decimal::from(1_000_000));
        assert_eq!(aggregate.adjustment_count, 2);
    }

    #[test]
    fn test_decision_guarded_on_pending() {
        let storage = storage_with_company();
        let request = AdjustmentRequest {
            id: Uuid::new_v4(),
            period: "2024-03".parse().unwrap(),
            division: Arc::from("sport"),
            category: AdjustmentCategory::GlobalOperational,
            company_id: 7,
            nominal: Decimal::from(500_000),
            description: Arc::from("Correction"),
            notes: None,
            status: AdjustmentStatus::Pending,
            created_by: Arc::from("operator"),
            created_at: OffsetDateTime::now_utc(),
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
        };
        storage.insert_request(&request).unwrap();

        let decision = DecisionCommand {
            status: AdjustmentStatus::Approved,
            reviewed_by: Arc::from("reviewer"),
            reviewed_at: OffsetDateTime::now_utc(),
            rejection_reason: None,
        };
        storage.record_decision(request.id, &decision).unwrap();
        assert_eq!(
            storage.get_request(request.id).unwrap().status,
            AdjustmentStatus::Approved
        );

        // Second decision loses the status guard
        assert!(matches!(
            storage.record_decision(request.id, &decision),
            Err(StorageError::Conflict(_))
        ));
    }
}
