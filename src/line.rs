use dualentry_core::{
    AccountBalance, AccountKey, LedgerLine, LineId, Metadata, Money, NewLedgerLine, StoreTransaction,
};

use crate::error::LedgerError;

/// Appends one line to `account`, recording the balance it leaves behind.
/// The partner link is filled in later by [`link_partner`].
pub fn insert(
    tx: &mut dyn StoreTransaction,
    signed: &Money,
    account: &AccountBalance,
    partner: &AccountKey,
    code: &str,
    metadata: &Metadata,
) -> Result<LedgerLine, LedgerError> {
    let balance_after = account
        .balance()
        .checked_add(signed)
        .ok_or_else(|| LedgerError::BalanceOverflow(account.key.clone()))?;

    let line = tx.insert_line(&NewLedgerLine {
        account: account.key.clone(),
        partner: partner.clone(),
        amount: signed.amount,
        balance_amount: balance_after.amount,
        code: code.into(),
        metadata: metadata.clone(),
        account_balance_id: account.id,
    })?;
    Ok(line)
}

pub fn link_partner(
    tx: &mut dyn StoreTransaction,
    line: &mut LedgerLine,
    partner_line_id: LineId,
) -> Result<(), LedgerError> {
    tx.link_partner(line.id, partner_line_id)?;
    line.partner_line_id = Some(partner_line_id);
    Ok(())
}
