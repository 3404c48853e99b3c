//! Core types and traits for DualEntry balance stores.
//!
//! This crate provides the `BalanceStore` trait and all associated types,
//! enabling pluggable storage implementations in separate crates.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{AccountKey, BalanceId, Currency, LineId, Metadata, Money};
pub use models::read::{AccountBalance, LedgerLine};
pub use models::write::NewLedgerLine;
pub use storage::{lock_multi, BalanceStore, LockedBalances, StorageError, StoreTransaction, TransactionId};
