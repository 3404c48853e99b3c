//! Validation applied to a proposed transfer before anything is written.
//!
//! Each check is pure. [`validate`] runs them in a fixed order and stops at
//! the first failure.

use crate::{config::LedgerConfig, error::LedgerError, transfer::Transfer};

pub fn validate(transfer: &Transfer, config: &LedgerConfig) -> Result<(), LedgerError> {
    positive_amount(transfer)?;
    valid_definition(transfer, config)?;
    matching_currency(transfer)?;
    positive_balance_if_enforced(transfer)?;
    distinct_accounts(transfer)?;
    Ok(())
}

pub fn positive_amount(transfer: &Transfer) -> Result<(), LedgerError> {
    if transfer.money.is_positive() {
        return Ok(());
    }
    Err(LedgerError::PositiveAmountOnly(transfer.money.clone()))
}

pub fn valid_definition(transfer: &Transfer, config: &LedgerConfig) -> Result<(), LedgerError> {
    let pairs = config
        .allowed_pairs(&transfer.code)
        .ok_or_else(|| LedgerError::UndefinedTransferCode(transfer.code.to_string()))?;

    let pair = (
        transfer.from.identifier.to_string(),
        transfer.to.identifier.to_string(),
    );
    if pairs.contains(&pair) {
        return Ok(());
    }
    Err(LedgerError::UndefinedTransferPair {
        code: transfer.code.to_string(),
        from: pair.0,
        to: pair.1,
    })
}

pub fn matching_currency(transfer: &Transfer) -> Result<(), LedgerError> {
    let money = &transfer.money.currency;
    if *money == transfer.from.currency && *money == transfer.to.currency {
        return Ok(());
    }
    Err(LedgerError::MismatchedCurrencies {
        money: money.clone(),
        from: transfer.from.currency.clone(),
        to: transfer.to.currency.clone(),
    })
}

/// Only positive-only accounts are held to a non-negative balance.
pub fn positive_balance_if_enforced(transfer: &Transfer) -> Result<(), LedgerError> {
    let from = &transfer.from;
    if !from.positive_only || from.balance >= transfer.money {
        return Ok(());
    }
    Err(LedgerError::InsufficientBalance {
        account: from.key()?,
        balance: from.balance.clone(),
        requested: transfer.money.clone(),
    })
}

pub fn distinct_accounts(transfer: &Transfer) -> Result<(), LedgerError> {
    let from = transfer.from.key()?;
    if from != transfer.to.key()? {
        return Ok(());
    }
    Err(LedgerError::SameAccount(from))
}
