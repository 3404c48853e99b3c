use std::sync::Arc;

use dualentry_core::{AccountBalance, AccountKey, BalanceId, BalanceStore, Currency, Money};

use crate::{config::LedgerConfig, error::LedgerError};

/// Options narrowing which account an identifier refers to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountOptions {
    /// Falls back to the configured default currency.
    pub currency: Option<Currency>,
    pub scope: Option<String>,
}

impl AccountOptions {
    pub fn currency(mut self, currency: &str) -> Self {
        self.currency = Some(Currency::new(currency));
        self
    }

    pub fn scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub(crate) fn key(&self, identifier: &str, config: &LedgerConfig) -> Result<AccountKey, LedgerError> {
        let currency = self
            .currency
            .clone()
            .unwrap_or_else(|| config.default_currency.clone());
        Ok(AccountKey::new(identifier, currency, self.scope.as_deref())?)
    }
}

/// A snapshot of one account: its identity, balance and positive-only flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// Store key of the balance row, `None` until the row exists.
    pub id: Option<BalanceId>,
    pub identifier: Arc<str>,
    pub scope: Option<Arc<str>>,
    pub currency: Currency,
    pub balance: Money,
    pub positive_only: bool,
}

impl Account {
    /// A zero-balance account that has not been persisted.
    pub fn unsaved(key: &AccountKey, config: &LedgerConfig) -> Self {
        Self {
            id: None,
            identifier: Arc::from(key.identifier()),
            scope: key.scope().map(Arc::from),
            currency: key.currency().clone(),
            balance: Money::zero(key.currency().clone()),
            positive_only: config.positive_only(key.identifier()),
        }
    }

    pub fn from_balance(row: &AccountBalance, config: &LedgerConfig) -> Self {
        Self {
            id: Some(row.id),
            identifier: Arc::from(row.key.identifier()),
            scope: row.key.scope().map(Arc::from),
            currency: row.key.currency().clone(),
            balance: row.balance(),
            positive_only: config.positive_only(row.key.identifier()),
        }
    }

    pub fn key(&self) -> Result<AccountKey, LedgerError> {
        Ok(AccountKey::new(
            &self.identifier,
            self.currency.clone(),
            self.scope.as_deref(),
        )?)
    }

    /// Reads the account without locking or creating it.
    pub fn lookup(
        store: &dyn BalanceStore,
        config: &LedgerConfig,
        identifier: &str,
        opts: &AccountOptions,
    ) -> Result<Option<Account>, LedgerError> {
        let key = opts.key(identifier, config)?;
        Ok(store
            .find(&key)?
            .map(|row| Account::from_balance(&row, config)))
    }

    /// Persists a new zero-balance account. Fails with `DuplicateAccount`
    /// if the row already exists.
    pub fn make(
        store: &dyn BalanceStore,
        config: &LedgerConfig,
        identifier: &str,
        opts: &AccountOptions,
    ) -> Result<Account, LedgerError> {
        let key = opts.key(identifier, config)?;
        let row = store.create(&key)?;
        tracing::info!(account = %key, "Account created");
        Ok(Account::from_balance(&row, config))
    }

    pub(crate) fn require(
        store: &dyn BalanceStore,
        config: &LedgerConfig,
        key: &AccountKey,
    ) -> Result<Account, LedgerError> {
        match store.find(key)? {
            Some(row) => Ok(Account::from_balance(&row, config)),
            None => Err(LedgerError::AccountNotFound(key.clone())),
        }
    }
}
