use dualentry_core::{AccountKey, Currency, Money, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transfer amount must be positive, got {0}")]
    PositiveAmountOnly(Money),
    #[error("transfer code is not defined: {0}")]
    UndefinedTransferCode(String),
    #[error("transfer code {code} does not allow {from} -> {to}")]
    UndefinedTransferPair {
        code: String,
        from: String,
        to: String,
    },
    #[error("currencies do not match: money {money}, from {from}, to {to}")]
    MismatchedCurrencies {
        money: Currency,
        from: Currency,
        to: Currency,
    },
    #[error("insufficient balance on {account}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        account: AccountKey,
        balance: Money,
        requested: Money,
    },
    #[error("source and destination are the same account: {0}")]
    SameAccount(AccountKey),
    #[error("account not found: {0}")]
    AccountNotFound(AccountKey),
    #[error("scope must be absent or non-empty")]
    InvalidScope,
    #[error("account already exists: {0}")]
    DuplicateAccount(AccountKey),
    #[error("could not acquire lock{}", contended(.0))]
    LockContention(Option<AccountKey>),
    #[error("balance of {0} would overflow")]
    BalanceOverflow(AccountKey),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

fn contended(key: &Option<AccountKey>) -> String {
    match key {
        Some(key) => format!(" on {}", key),
        None => String::new(),
    }
}

impl LedgerError {
    /// Whether retrying the same transfer later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::LockContention(_))
    }

    /// Whether the failure came from validation, before anything was written.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::PositiveAmountOnly(_)
                | LedgerError::UndefinedTransferCode(_)
                | LedgerError::UndefinedTransferPair { .. }
                | LedgerError::MismatchedCurrencies { .. }
                | LedgerError::InsufficientBalance { .. }
                | LedgerError::SameAccount(_)
                | LedgerError::InvalidScope
        )
    }
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::DuplicateAccount(key) => LedgerError::DuplicateAccount(key),
            StorageError::LockContention(key) => LedgerError::LockContention(Some(key)),
            StorageError::Busy => LedgerError::LockContention(None),
            StorageError::AccountNotFound(key) => LedgerError::AccountNotFound(key),
            StorageError::InvalidScope => LedgerError::InvalidScope,
            other => LedgerError::Storage(other),
        }
    }
}
