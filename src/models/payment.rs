//! Payment document: ledger projection of one on-chain payout
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-lender delta observed for one payout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub user_address: String,
    pub amount: Decimal,
    pub interest: Decimal,
    pub total: Decimal,
}

impl Distribution {
    pub fn new(user_address: impl Into<String>, amount: Decimal, interest: Decimal) -> Self {
        Self {
            user_address: user_address.into(),
            amount,
            interest,
            total: amount + interest,
        }
    }
}

/// Payment model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    /// `<tx_hash>:<log_index>`
    pub payment_key: String,
    pub tx_hash: String,
    pub loan_id: String,
    pub user_address: String,
    pub payment_amount: Decimal,
    pub payment_time: DateTime<Utc>,
    pub asset: String,
    pub distributions: Vec<Distribution>,
    pub fully_repaid: bool,
    /// Set once the loan document reflects this payment
    pub applied: bool,
}

impl Payment {
    pub fn total_distributed(&self) -> Decimal {
        self.distributions.iter().map(|d| d.total).sum()
    }
}
