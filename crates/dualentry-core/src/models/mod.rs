use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, Neg, Sub},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

pub mod read;
pub mod write;

/// Opaque key/value data carried by both lines of a transfer.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub type BalanceId = i64;
pub type LineId = i64;

/// ISO-style currency code. Compared and ordered by its text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(Arc<str>);

impl Currency {
    pub fn new(code: &str) -> Self {
        Self(Arc::from(code))
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Currency {
    fn from(code: &str) -> Self {
        Currency::new(code)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An exact amount in the minor unit of `currency`.
///
/// The arithmetic operators panic when the currencies differ: mixing
/// currencies is a programming error, never a user-facing one. Use
/// [`Money::checked_add`] and [`Money::checked_sub`] where overflow must be
/// reported instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: i64, currency: impl Into<Currency>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    pub fn zero(currency: impl Into<Currency>) -> Self {
        Self::new(0, currency)
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub fn checked_add(&self, other: &Money) -> Option<Money> {
        self.assert_same_currency(other);
        self.amount
            .checked_add(other.amount)
            .map(|amount| Money::new(amount, self.currency.clone()))
    }

    pub fn checked_sub(&self, other: &Money) -> Option<Money> {
        self.assert_same_currency(other);
        self.amount
            .checked_sub(other.amount)
            .map(|amount| Money::new(amount, self.currency.clone()))
    }

    fn assert_same_currency(&self, other: &Money) {
        assert_eq!(
            self.currency, other.currency,
            "arithmetic between {} and {} amounts",
            self.currency, other.currency
        );
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        self.assert_same_currency(&rhs);
        Money::new(self.amount + rhs.amount, self.currency)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        self.assert_same_currency(&rhs);
        Money::new(self.amount - rhs.amount, self.currency)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money::new(-self.amount, self.currency)
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.currency != other.currency {
            return None;
        }
        Some(self.amount.cmp(&other.amount))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Identity of an account balance row: `(scope, currency, identifier)`.
///
/// The derived ordering follows the field order and is the global order in
/// which locks are taken. A missing scope is stored as the empty string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountKey {
    scope: Arc<str>,
    currency: Currency,
    identifier: Arc<str>,
}

impl AccountKey {
    pub fn new(identifier: &str, currency: Currency, scope: Option<&str>) -> Result<Self, StorageError> {
        let scope = match scope {
            None => "",
            Some("") => return Err(StorageError::InvalidScope),
            Some(s) => s,
        };
        Ok(Self {
            scope: Arc::from(scope),
            currency,
            identifier: Arc::from(identifier),
        })
    }

    /// Builds a key from a stored row, where the empty scope means "no scope".
    pub fn from_stored(identifier: &str, currency: &str, scope: &str) -> Self {
        Self {
            scope: Arc::from(scope),
            currency: Currency::new(currency),
            identifier: Arc::from(identifier),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn scope(&self) -> Option<&str> {
        if self.scope.is_empty() {
            None
        } else {
            Some(&self.scope)
        }
    }

    /// The scope as persisted, `""` when unscoped.
    pub fn stored_scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope() {
            Some(scope) => write!(f, "{}/{}:{}", scope, self.identifier, self.currency),
            None => write!(f, "{}:{}", self.identifier, self.currency),
        }
    }
}
