use std::sync::Arc;

use time::OffsetDateTime;

use super::{AccountKey, BalanceId, LineId, Metadata, Money};

/// A persisted balance row. `balance_amount` is authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountBalance {
    pub id: BalanceId,
    pub key: AccountKey,
    pub balance_amount: i64,
    pub inserted_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl AccountBalance {
    pub fn balance(&self) -> Money {
        Money::new(self.balance_amount, self.key.currency().clone())
    }
}

/// One side of a transfer. Immutable apart from the one-time partner link.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerLine {
    pub id: LineId,
    pub account: AccountKey,
    pub partner: AccountKey,
    pub amount: i64,
    pub balance_amount: i64,
    pub code: Arc<str>,
    pub metadata: Metadata,
    pub partner_line_id: Option<LineId>,
    pub account_balance_id: BalanceId,
    pub inserted_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl LedgerLine {
    pub fn money(&self) -> Money {
        Money::new(self.amount, self.account.currency().clone())
    }
}
