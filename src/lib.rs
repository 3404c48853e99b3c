//! Double-entry ledger engine.
//!
//! Every [`Ledger::transfer`] writes two linked, immutable lines whose
//! amounts sum to zero and moves both account balances in the same atomic
//! store transaction. Storage is pluggable through
//! [`dualentry_core::BalanceStore`].

pub mod account;
pub mod config;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod line;
pub mod logging;
pub mod retry;
pub mod transfer;

pub use account::{Account, AccountOptions};
pub use config::{Backend, Config, ConfigError, LedgerConfig};
pub use dualentry_core::{AccountKey, Currency, LedgerLine, Metadata, Money};
pub use error::LedgerError;
pub use ledger::Ledger;
pub use retry::RetryPolicy;
pub use transfer::{AccountRef, Receipt, Transfer, TransferOutcome, TransferRequest, TransferStage};
