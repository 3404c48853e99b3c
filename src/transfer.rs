use std::{fmt, sync::Arc};

use dualentry_core::{LedgerLine, Metadata, Money};

use crate::{account::{Account, AccountOptions}, error::LedgerError};

/// One double-entry movement of `money` from `from` to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub money: Money,
    pub from: Account,
    pub to: Account,
    pub code: Arc<str>,
    pub metadata: Metadata,
}

/// Either side of a transfer request.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountRef {
    /// An account the caller already resolved. Its balance snapshot is what
    /// the positive-only check sees.
    Resolved(Account),
    /// An identifier, resolved against the store when the transfer runs.
    Named {
        identifier: String,
        options: AccountOptions,
    },
}

impl AccountRef {
    pub fn named(identifier: &str, options: AccountOptions) -> Self {
        AccountRef::Named {
            identifier: identifier.to_string(),
            options,
        }
    }
}

impl From<Account> for AccountRef {
    fn from(account: Account) -> Self {
        AccountRef::Resolved(account)
    }
}

impl From<&str> for AccountRef {
    fn from(identifier: &str) -> Self {
        AccountRef::named(identifier, AccountOptions::default())
    }
}

/// Everything needed to propose a transfer, in either account form.
///
/// Unless overridden with [`TransferRequest::ensure_accounts`], named
/// accounts are created on demand, while a request built from resolved
/// accounts requires both to exist already.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub money: Money,
    pub from: AccountRef,
    pub to: AccountRef,
    pub code: Arc<str>,
    pub metadata: Metadata,
    ensure_accounts: Option<bool>,
}

impl TransferRequest {
    pub fn new(money: Money, from: impl Into<AccountRef>, to: impl Into<AccountRef>, code: &str) -> Self {
        Self {
            money,
            from: from.into(),
            to: to.into(),
            code: Arc::from(code),
            metadata: Metadata::new(),
            ensure_accounts: None,
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn ensure_accounts(mut self, ensure: bool) -> Self {
        self.ensure_accounts = Some(ensure);
        self
    }

    pub fn ensures_accounts(&self) -> bool {
        self.ensure_accounts.unwrap_or_else(|| {
            matches!(self.from, AccountRef::Named { .. }) || matches!(self.to, AccountRef::Named { .. })
        })
    }
}

/// How far a transfer got. Reported alongside the error when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferStage {
    Proposed,
    Validated,
    AccountsResolved,
    Locked,
    LinesRecorded,
    BalancesUpdated,
    Committed,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::Proposed => "proposed",
            TransferStage::Validated => "validated",
            TransferStage::AccountsResolved => "accounts resolved",
            TransferStage::Locked => "locked",
            TransferStage::LinesRecorded => "lines recorded",
            TransferStage::BalancesUpdated => "balances updated",
            TransferStage::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// A committed transfer: balances on `transfer` are the post-commit ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub transfer: Transfer,
    pub debit: LedgerLine,
    pub credit: LedgerLine,
}

#[derive(Debug)]
pub enum TransferOutcome {
    Committed(Receipt),
    /// Nothing was persisted, auto-provisioned account rows included.
    /// `stage` is the last stage reached.
    Failed {
        stage: TransferStage,
        error: LedgerError,
    },
}

impl TransferOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransferOutcome::Committed(_))
    }

    pub fn into_result(self) -> Result<Receipt, LedgerError> {
        match self {
            TransferOutcome::Committed(receipt) => Ok(receipt),
            TransferOutcome::Failed { error, .. } => Err(error),
        }
    }
}
