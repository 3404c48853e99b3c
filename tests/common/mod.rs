#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dualentry::{AccountOptions, Ledger, LedgerConfig, Money, TransferRequest};
use dualentry_core::BalanceStore;
use dualentry_memory::InMemoryStore;
use dualentry_postgres::PostgresStore;
use dualentry_sqlite::SqliteStore;

pub const POSTGRES_URL_VAR: &str = "DUALENTRY_POSTGRES_URL";

pub fn memory_store() -> Option<Arc<dyn BalanceStore>> {
    Some(Arc::new(InMemoryStore::new()))
}

pub fn sqlite_store() -> Option<Arc<dyn BalanceStore>> {
    Some(Arc::new(SqliteStore::new(":memory:").expect("Failed to open SQLite store")))
}

/// A store in a fresh schema of the database named by
/// `DUALENTRY_POSTGRES_URL` (key=value form), or `None` when it is unset.
pub fn postgres_store() -> Option<Arc<dyn BalanceStore>> {
    static SCHEMA_COUNTER: AtomicU64 = AtomicU64::new(0);

    let url = std::env::var(POSTGRES_URL_VAR).ok()?;
    let schema = format!(
        "dualentry_test_{}_{}",
        std::process::id(),
        SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let mut admin = postgres::Client::connect(&url, postgres::NoTls).expect("Failed to connect to PostgreSQL");
    admin
        .batch_execute(&format!("DROP SCHEMA IF EXISTS {0} CASCADE; CREATE SCHEMA {0};", schema))
        .expect("Failed to create test schema");

    let scoped_url = format!("{} options='-c search_path={}'", url, schema);
    Some(Arc::new(PostgresStore::new(&scoped_url).expect("Failed to open PostgreSQL store")))
}

/// Routes used by the scenarios: `checking` is positive-only, nothing else is.
pub fn config() -> LedgerConfig {
    LedgerConfig::builder()
        .default_currency("USD")
        .account("checking", true)
        .account("savings", false)
        .transfer("fund", "equity", "checking")
        .transfer("fund", "equity", "savings")
        .transfer("deposit", "checking", "savings")
        .transfer("withdraw", "savings", "checking")
        .transfer("pay", "checking", "vendor")
        .transfer("sweep", "savings", "savings")
        .transfer("swap", "left", "right")
        .transfer("swap", "right", "left")
        .build()
}

pub fn ledger(store: Arc<dyn BalanceStore>) -> Ledger {
    Ledger::new(Arc::new(config()), store)
}

pub fn usd(amount: i64) -> Money {
    Money::new(amount, "USD")
}

pub fn transfer(ledger: &Ledger, amount: i64, from: &str, to: &str, code: &str) {
    ledger
        .transfer(TransferRequest::new(usd(amount), from, to, code))
        .expect("Transfer should commit");
}

pub fn balance(ledger: &Ledger, identifier: &str) -> i64 {
    balance_in(ledger, identifier, &AccountOptions::default())
}

pub fn balance_in(ledger: &Ledger, identifier: &str, opts: &AccountOptions) -> i64 {
    ledger.balance(identifier, opts).expect("Account should exist").amount
}

/// Asserts that the stored balance equals the running sum of the account's
/// lines, and that every line's snapshot matches that running sum.
pub fn assert_balance_matches_lines(ledger: &Ledger, identifier: &str, opts: &AccountOptions) {
    let lines = ledger.lines(identifier, opts).unwrap();
    let mut running = 0;
    for line in &lines {
        running += line.amount;
        assert_eq!(line.balance_amount, running, "line #{} snapshot", line.id);
    }
    assert_eq!(balance_in(ledger, identifier, opts), running, "{} balance", identifier);
}
