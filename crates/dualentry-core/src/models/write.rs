use std::sync::Arc;

use super::{AccountKey, BalanceId, Metadata};

#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerLine {
    pub account: AccountKey,
    pub partner: AccountKey,
    pub amount: i64,
    pub balance_amount: i64,
    pub code: Arc<str>,
    pub metadata: Metadata,
    pub account_balance_id: BalanceId,
}
