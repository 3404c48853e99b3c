//! SQLite balance store.
//!
//! SQLite has no row-level locks. Every transaction runs on the one shared
//! connection and opens with `BEGIN IMMEDIATE`, which takes the database
//! write lock up front, so transfers are serialized. Contention from other
//! processes surfaces as `StorageError::Busy` once the busy timeout expires.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use time::OffsetDateTime;

use dualentry_core::{
    AccountBalance, AccountKey, BalanceStore, LedgerLine, LineId, Metadata, NewLedgerLine,
    StorageError, StoreTransaction, TransactionId,
};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BALANCE_COLUMNS: &str =
    "id, identifier, currency, scope, balance_amount, inserted_at, updated_at";

const LINE_COLUMNS: &str = "id, account_identifier, account_scope, currency, amount, balance_amount, \
     code, partner_identifier, partner_scope, metadata, partner_line_id, account_balance_id, \
     inserted_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn with_busy_timeout(path: &str, busy_timeout: Duration) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(storage_error)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(storage_error)?;
        conn.busy_timeout(busy_timeout).map_err(storage_error)?;

        let store = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS account_balances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier TEXT NOT NULL,
                currency TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT '',
                balance_amount INTEGER NOT NULL DEFAULT 0,
                inserted_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (scope, currency, identifier)
            );

            CREATE TABLE IF NOT EXISTS ledger_lines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_identifier TEXT NOT NULL,
                account_scope TEXT NOT NULL DEFAULT '',
                currency TEXT NOT NULL,
                amount INTEGER NOT NULL,
                balance_amount INTEGER NOT NULL,
                code TEXT NOT NULL,
                partner_identifier TEXT NOT NULL,
                partner_scope TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                partner_line_id INTEGER REFERENCES ledger_lines(id),
                account_balance_id INTEGER NOT NULL REFERENCES account_balances(id),
                inserted_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lines_code_account
                ON ledger_lines(code, account_identifier, currency, inserted_at);

            CREATE INDEX IF NOT EXISTS idx_lines_scope_account
                ON ledger_lines(account_scope, account_identifier, currency, inserted_at);
            ",
        )
        .map_err(storage_error)?;
        Ok(())
    }
}

fn storage_error(e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StorageError::Busy,
        _ => StorageError::Other(e.to_string()),
    }
}

fn create_error(key: &AccountKey, e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StorageError::DuplicateAccount(key.clone()),
        _ => storage_error(e),
    }
}

fn balance_from_row(row: &Row) -> rusqlite::Result<AccountBalance> {
    let identifier: String = row.get(1)?;
    let currency: String = row.get(2)?;
    let scope: String = row.get(3)?;
    Ok(AccountBalance {
        id: row.get(0)?,
        key: AccountKey::from_stored(&identifier, &currency, &scope),
        balance_amount: row.get(4)?,
        inserted_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn line_from_row(row: &Row) -> rusqlite::Result<LedgerLine> {
    let identifier: String = row.get(1)?;
    let scope: String = row.get(2)?;
    let currency: String = row.get(3)?;
    let partner_identifier: String = row.get(7)?;
    let partner_scope: String = row.get(8)?;
    let metadata: String = row.get(9)?;
    let metadata: Metadata = serde_json::from_str(&metadata).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(LedgerLine {
        id: row.get(0)?,
        account: AccountKey::from_stored(&identifier, &currency, &scope),
        partner: AccountKey::from_stored(&partner_identifier, &currency, &partner_scope),
        amount: row.get(4)?,
        balance_amount: row.get(5)?,
        code: row.get::<_, String>(6)?.into(),
        metadata,
        partner_line_id: row.get(10)?,
        account_balance_id: row.get(11)?,
        inserted_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn find_balance(conn: &Connection, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM account_balances WHERE scope = ?1 AND currency = ?2 AND identifier = ?3",
            BALANCE_COLUMNS
        ),
        params![key.stored_scope(), key.currency().code(), key.identifier()],
        balance_from_row,
    )
    .optional()
    .map_err(storage_error)
}

fn create_balance(conn: &Connection, key: &AccountKey) -> Result<AccountBalance, StorageError> {
    let now = OffsetDateTime::now_utc();
    conn.execute(
        "INSERT INTO account_balances (identifier, currency, scope, balance_amount, inserted_at, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![key.identifier(), key.currency().code(), key.stored_scope(), now],
    )
    .map_err(|e| create_error(key, e))?;

    find_balance(conn, key)?.ok_or_else(|| StorageError::AccountNotFound(key.clone()))
}

fn find_line(conn: &Connection, id: LineId) -> Result<Option<LedgerLine>, StorageError> {
    conn.query_row(
        &format!("SELECT {} FROM ledger_lines WHERE id = ?1", LINE_COLUMNS),
        params![id],
        line_from_row,
    )
    .optional()
    .map_err(storage_error)
}

impl BalanceStore for SqliteStore {
    fn supports_row_locking(&self) -> bool {
        false
    }

    fn find(&self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError> {
        let conn = self.conn()?;
        find_balance(&conn, key)
    }

    fn create(&self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        let conn = self.conn()?;
        create_balance(&conn, key)
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StorageError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(storage_error)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(Box::new(SqliteTransaction {
            tx_id,
            conn,
            finished: false,
        }))
    }

    fn line(&self, id: LineId) -> Result<Option<LedgerLine>, StorageError> {
        let conn = self.conn()?;
        find_line(&conn, id)
    }

    fn lines_for(&self, key: &AccountKey) -> Result<Vec<LedgerLine>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM ledger_lines
                 WHERE account_scope = ?1 AND account_identifier = ?2 AND currency = ?3
                 ORDER BY id",
                LINE_COLUMNS
            ))
            .map_err(storage_error)?;
        let rows = stmt
            .query_map(
                params![key.stored_scope(), key.identifier(), key.currency().code()],
                line_from_row,
            )
            .map_err(storage_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage_error)
    }
}

struct SqliteTransaction<'a> {
    tx_id: TransactionId,
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn finish(&mut self, sql: &str) -> Result<(), StorageError> {
        self.conn.execute_batch(sql).map_err(storage_error)?;
        self.finished = true;
        Ok(())
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn find(&mut self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError> {
        find_balance(&self.conn, key)
    }

    fn create(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        create_balance(&self.conn, key)
    }

    fn lock(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        // BEGIN IMMEDIATE already holds the database write lock.
        find_balance(&self.conn, key)?.ok_or_else(|| StorageError::AccountNotFound(key.clone()))
    }

    fn insert_line(&mut self, line: &NewLedgerLine) -> Result<LedgerLine, StorageError> {
        let metadata = serde_json::to_string(&line.metadata)
            .map_err(|e| StorageError::Other(format!("Invalid metadata: {}", e)))?;
        let now = OffsetDateTime::now_utc();
        self.conn
            .execute(
                "INSERT INTO ledger_lines (account_identifier, account_scope, currency, amount,
                     balance_amount, code, partner_identifier, partner_scope, metadata,
                     account_balance_id, inserted_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    line.account.identifier(),
                    line.account.stored_scope(),
                    line.account.currency().code(),
                    line.amount,
                    line.balance_amount,
                    line.code.as_ref(),
                    line.partner.identifier(),
                    line.partner.stored_scope(),
                    metadata,
                    line.account_balance_id,
                    now,
                ],
            )
            .map_err(storage_error)?;

        let id = self.conn.last_insert_rowid();
        find_line(&self.conn, id)?.ok_or(StorageError::LineNotFound(id))
    }

    fn link_partner(&mut self, line_id: LineId, partner_line_id: LineId) -> Result<(), StorageError> {
        let updated = self
            .conn
            .execute(
                "UPDATE ledger_lines SET partner_line_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![partner_line_id, OffsetDateTime::now_utc(), line_id],
            )
            .map_err(storage_error)?;
        if updated == 0 {
            return Err(StorageError::LineNotFound(line_id));
        }
        Ok(())
    }

    fn update_balance(&mut self, key: &AccountKey, balance_amount: i64) -> Result<AccountBalance, StorageError> {
        let updated = self
            .conn
            .execute(
                "UPDATE account_balances SET balance_amount = ?1, updated_at = ?2
                 WHERE scope = ?3 AND currency = ?4 AND identifier = ?5",
                params![
                    balance_amount,
                    OffsetDateTime::now_utc(),
                    key.stored_scope(),
                    key.currency().code(),
                    key.identifier()
                ],
            )
            .map_err(storage_error)?;
        if updated == 0 {
            return Err(StorageError::AccountNotFound(key.clone()));
        }
        find_balance(&self.conn, key)?.ok_or_else(|| StorageError::AccountNotFound(key.clone()))
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")?;
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.finish("ROLLBACK") {
            tracing::warn!(tx_id = self.tx_id, error = %e, "SQLite rollback on drop failed");
        }
    }
}
