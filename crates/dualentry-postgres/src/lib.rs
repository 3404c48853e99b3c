//! PostgreSQL balance store.
//!
//! Balance rows are locked with `SELECT ... FOR UPDATE NOWAIT`, so a
//! transfer that meets a locked row fails with `LockContention` instead of
//! queueing behind it. Each transaction holds its own pooled connection, so
//! transfers over disjoint accounts proceed in parallel.

use std::sync::atomic::{AtomicU64, Ordering};

use postgres::{error::SqlState, Client, Config, NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use time::OffsetDateTime;

use dualentry_core::{
    AccountBalance, AccountKey, BalanceStore, LedgerLine, LineId, Metadata, NewLedgerLine,
    StorageError, StoreTransaction, TransactionId,
};

pub const DEFAULT_POOL_SIZE: u32 = 4;

type Manager = PostgresConnectionManager<NoTls>;

const BALANCE_COLUMNS: &str =
    "id, identifier, currency, scope, balance_amount, inserted_at, updated_at";

const LINE_COLUMNS: &str = "id, account_identifier, account_scope, currency, amount, balance_amount, \
     code, partner_identifier, partner_scope, metadata, partner_line_id, account_balance_id, \
     inserted_at, updated_at";

pub struct PostgresStore {
    pool: Pool<Manager>,
    tx_counter: AtomicU64,
}

impl PostgresStore {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_pool_size(connection_string, DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(connection_string: &str, pool_size: u32) -> Result<Self, StorageError> {
        let config: Config = connection_string
            .parse()
            .map_err(|e| StorageError::Other(format!("Invalid PostgreSQL connection string: {}", e)))?;
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(PostgresConnectionManager::new(config, NoTls))
            .map_err(pool_error)?;

        let store = Self {
            pool,
            tx_counter: AtomicU64::new(1),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn client(&self) -> Result<PooledConnection<Manager>, StorageError> {
        self.pool.get().map_err(pool_error)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut client = self.client()?;
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS account_balances (
                id BIGSERIAL PRIMARY KEY,
                identifier TEXT NOT NULL,
                currency TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT '',
                balance_amount BIGINT NOT NULL DEFAULT 0,
                inserted_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (scope, currency, identifier)
            );

            CREATE TABLE IF NOT EXISTS ledger_lines (
                id BIGSERIAL PRIMARY KEY,
                account_identifier TEXT NOT NULL,
                account_scope TEXT NOT NULL DEFAULT '',
                currency TEXT NOT NULL,
                amount BIGINT NOT NULL,
                balance_amount BIGINT NOT NULL,
                code TEXT NOT NULL,
                partner_identifier TEXT NOT NULL,
                partner_scope TEXT NOT NULL DEFAULT '',
                metadata JSONB NOT NULL DEFAULT '{}',
                partner_line_id BIGINT REFERENCES ledger_lines(id),
                account_balance_id BIGINT NOT NULL REFERENCES account_balances(id),
                inserted_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pg_lines_code_account
                ON ledger_lines(code, account_identifier, currency, inserted_at);

            CREATE INDEX IF NOT EXISTS idx_pg_lines_scope_account
                ON ledger_lines(account_scope, account_identifier, currency, inserted_at);
            ",
            )
            .map_err(storage_error)?;
        Ok(())
    }
}

fn pool_error(e: r2d2::Error) -> StorageError {
    StorageError::Other(format!("PostgreSQL pool error: {}", e))
}

fn storage_error(e: postgres::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn keyed_error(key: &AccountKey, e: postgres::Error) -> StorageError {
    match e.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => StorageError::DuplicateAccount(key.clone()),
        Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE => StorageError::LockContention(key.clone()),
        _ => storage_error(e),
    }
}

fn balance_from_row(row: &Row) -> AccountBalance {
    let identifier: String = row.get(1);
    let currency: String = row.get(2);
    let scope: String = row.get(3);
    AccountBalance {
        id: row.get(0),
        key: AccountKey::from_stored(&identifier, &currency, &scope),
        balance_amount: row.get(4),
        inserted_at: row.get(5),
        updated_at: row.get(6),
    }
}

fn line_from_row(row: &Row) -> Result<LedgerLine, StorageError> {
    let identifier: String = row.get(1);
    let scope: String = row.get(2);
    let currency: String = row.get(3);
    let partner_identifier: String = row.get(7);
    let partner_scope: String = row.get(8);
    let code: String = row.get(6);
    let metadata = match row.get::<_, serde_json::Value>(9) {
        serde_json::Value::Object(map) => map,
        other => return Err(StorageError::Other(format!("Invalid metadata: {}", other))),
    };
    Ok(LedgerLine {
        id: row.get(0),
        account: AccountKey::from_stored(&identifier, &currency, &scope),
        partner: AccountKey::from_stored(&partner_identifier, &currency, &partner_scope),
        amount: row.get(4),
        balance_amount: row.get(5),
        code: code.into(),
        metadata,
        partner_line_id: row.get(10),
        account_balance_id: row.get(11),
        inserted_at: row.get(12),
        updated_at: row.get(13),
    })
}

fn find_balance(client: &mut Client, key: &AccountKey, suffix: &str) -> Result<Option<AccountBalance>, StorageError> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {} FROM account_balances WHERE scope = $1 AND currency = $2 AND identifier = $3 {}",
                BALANCE_COLUMNS, suffix
            ),
            &[&key.stored_scope(), &key.currency().code(), &key.identifier()],
        )
        .map_err(|e| keyed_error(key, e))?;
    Ok(row.as_ref().map(balance_from_row))
}

fn create_balance(client: &mut Client, key: &AccountKey) -> Result<AccountBalance, StorageError> {
    let now = OffsetDateTime::now_utc();
    let row = client
        .query_one(
            &format!(
                "INSERT INTO account_balances (identifier, currency, scope, balance_amount, inserted_at, updated_at)
                 VALUES ($1, $2, $3, 0, $4, $4) RETURNING {}",
                BALANCE_COLUMNS
            ),
            &[&key.identifier(), &key.currency().code(), &key.stored_scope(), &now],
        )
        .map_err(|e| keyed_error(key, e))?;
    Ok(balance_from_row(&row))
}

/// Inserts a zero-balance row unless one exists. If another transaction has
/// an uncommitted row for the key, this waits for it to finish.
fn insert_if_absent(client: &mut Client, key: &AccountKey) -> Result<(), StorageError> {
    let now = OffsetDateTime::now_utc();
    client
        .execute(
            "INSERT INTO account_balances (identifier, currency, scope, balance_amount, inserted_at, updated_at)
             VALUES ($1, $2, $3, 0, $4, $4)
             ON CONFLICT (scope, currency, identifier) DO NOTHING",
            &[&key.identifier(), &key.currency().code(), &key.stored_scope(), &now],
        )
        .map_err(|e| keyed_error(key, e))?;
    Ok(())
}

fn find_line(client: &mut Client, id: LineId) -> Result<Option<LedgerLine>, StorageError> {
    let row = client
        .query_opt(&format!("SELECT {} FROM ledger_lines WHERE id = $1", LINE_COLUMNS), &[&id])
        .map_err(storage_error)?;
    row.as_ref().map(line_from_row).transpose()
}

impl BalanceStore for PostgresStore {
    fn supports_row_locking(&self) -> bool {
        true
    }

    fn find(&self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError> {
        let mut client = self.client()?;
        find_balance(&mut client, key, "")
    }

    fn create(&self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        let mut client = self.client()?;
        create_balance(&mut client, key)
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StorageError> {
        let mut client = self.client()?;
        client.batch_execute("BEGIN").map_err(storage_error)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "PostgreSQL transaction started");
        Ok(Box::new(PostgresTransaction {
            tx_id,
            client,
            finished: false,
        }))
    }

    fn line(&self, id: LineId) -> Result<Option<LedgerLine>, StorageError> {
        let mut client = self.client()?;
        find_line(&mut client, id)
    }

    fn lines_for(&self, key: &AccountKey) -> Result<Vec<LedgerLine>, StorageError> {
        let mut client = self.client()?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM ledger_lines
                     WHERE account_scope = $1 AND account_identifier = $2 AND currency = $3
                     ORDER BY id",
                    LINE_COLUMNS
                ),
                &[&key.stored_scope(), &key.identifier(), &key.currency().code()],
            )
            .map_err(storage_error)?;
        rows.iter().map(line_from_row).collect()
    }
}

struct PostgresTransaction {
    tx_id: TransactionId,
    client: PooledConnection<Manager>,
    finished: bool,
}

impl PostgresTransaction {
    fn finish(&mut self, sql: &str) -> Result<(), StorageError> {
        self.client.batch_execute(sql).map_err(storage_error)?;
        self.finished = true;
        Ok(())
    }
}

impl StoreTransaction for PostgresTransaction {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn find(&mut self, key: &AccountKey) -> Result<Option<AccountBalance>, StorageError> {
        find_balance(&mut self.client, key, "")
    }

    fn create(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        create_balance(&mut self.client, key)
    }

    fn lock(&mut self, key: &AccountKey) -> Result<AccountBalance, StorageError> {
        let balance = find_balance(&mut self.client, key, "FOR UPDATE NOWAIT")?
            .ok_or_else(|| StorageError::AccountNotFound(key.clone()))?;
        tracing::debug!(tx_id = self.tx_id, account = %key, "Row lock acquired");
        Ok(balance)
    }

    // Any failed statement aborts the transaction, so creation must not
    // raise when a concurrent transaction creates the same row.
    fn get_or_create(&mut self, key: &AccountKey, lock: bool) -> Result<AccountBalance, StorageError> {
        let suffix = if lock { "FOR UPDATE NOWAIT" } else { "" };
        if let Some(balance) = find_balance(&mut self.client, key, suffix)? {
            return Ok(balance);
        }
        insert_if_absent(&mut self.client, key)?;
        find_balance(&mut self.client, key, suffix)?.ok_or_else(|| StorageError::AccountNotFound(key.clone()))
    }

    fn insert_line(&mut self, line: &NewLedgerLine) -> Result<LedgerLine, StorageError> {
        let metadata = serde_json::Value::Object(line.metadata.clone());
        let now = OffsetDateTime::now_utc();
        let row = self
            .client
            .query_one(
                &format!(
                    "INSERT INTO ledger_lines (account_identifier, account_scope, currency, amount,
                         balance_amount, code, partner_identifier, partner_scope, metadata,
                         account_balance_id, inserted_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
                     RETURNING {}",
                    LINE_COLUMNS
                ),
                &[
                    &line.account.identifier(),
                    &line.account.stored_scope(),
                    &line.account.currency().code(),
                    &line.amount,
                    &line.balance_amount,
                    &line.code.as_ref(),
                    &line.partner.identifier(),
                    &line.partner.stored_scope(),
                    &metadata,
                    &line.account_balance_id,
                    &now,
                ],
            )
            .map_err(storage_error)?;
        line_from_row(&row)
    }

    fn link_partner(&mut self, line_id: LineId, partner_line_id: LineId) -> Result<(), StorageError> {
        let updated = self
            .client
            .execute(
                "UPDATE ledger_lines SET partner_line_id = $1, updated_at = $2 WHERE id = $3",
                &[&partner_line_id, &OffsetDateTime::now_utc(), &line_id],
            )
            .map_err(storage_error)?;
        if updated == 0 {
            return Err(StorageError::LineNotFound(line_id));
        }
        Ok(())
    }

    fn update_balance(&mut self, key: &AccountKey, balance_amount: i64) -> Result<AccountBalance, StorageError> {
        self.lock(key)?;
        let row = self
            .client
            .query_opt(
                &format!(
                    "UPDATE account_balances SET balance_amount = $1, updated_at = $2
                     WHERE scope = $3 AND currency = $4 AND identifier = $5
                     RETURNING {}",
                    BALANCE_COLUMNS
                ),
                &[
                    &balance_amount,
                    &OffsetDateTime::now_utc(),
                    &key.stored_scope(),
                    &key.currency().code(),
                    &key.identifier(),
                ],
            )
            .map_err(|e| keyed_error(key, e))?;
        row.as_ref()
            .map(balance_from_row)
            .ok_or_else(|| StorageError::AccountNotFound(key.clone()))
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.finish("ROLLBACK") {
            tracing::warn!(tx_id = self.tx_id, error = %e, "PostgreSQL rollback on drop failed");
        }
    }
}
