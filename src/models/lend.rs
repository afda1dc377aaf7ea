//! Lend (allowance) document: one lender's committed capital
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// A deposit event already booked into this allowance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositReceipt {
    /// `<tx_hash>:<log_index>`
    pub event_key: String,
    pub tx_hash: String,
    pub amount: Decimal,
    pub reinvest: bool,
    pub block_number: u64,
    pub observed_at: DateTime<Utc>,
}

/// Lend model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lend {
    pub id: Uuid,
    pub user_address: String,
    /// Total ever approved
    pub lending_amount_approved: Decimal,
    /// Currently uncommitted
    pub available_amount: Decimal,
    /// Currently loaned out
    pub utilised_amount: Decimal,
    /// Longest loan term accepted, in months. Zero accepts any term.
    pub duration_preference: u32,
    /// Loans funded from this allowance
    pub loans: Vec<String>,
    pub deposits: Vec<DepositReceipt>,
    /// Set when a debit was skipped because the balance was stale
    pub needs_reconciliation: bool,
    pub opened_on: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lend {
    pub fn new(user_address: &str, amount: Decimal, duration_preference: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_address: super::normalize_address(user_address),
            lending_amount_approved: amount,
            available_amount: amount,
            utilised_amount: Decimal::ZERO,
            duration_preference,
            loans: Vec::new(),
            deposits: Vec::new(),
            needs_reconciliation: false,
            opened_on: now,
            updated_at: now,
        }
    }

    pub fn admits_duration(&self, months: u32) -> bool {
        self.duration_preference == 0 || self.duration_preference >= months
    }

    pub fn has_deposit(&self, event_key: &str) -> bool {
        self.deposits.iter().any(|d| d.event_key == event_key)
    }

    pub fn funds_loan(&self, loan_id: &str) -> bool {
        self.loans.iter().any(|l| l.eq_ignore_ascii_case(loan_id))
    }

    /// Adds fresh capital to both the approved and available balances.
    pub fn top_up(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.lending_amount_approved += amount;
        self.available_amount += amount;
        self.updated_at = now;
    }

    /// Books a deposit receipt. Returns false when the receipt was already
    /// booked, in which case nothing changes.
    pub fn record_deposit(&mut self, receipt: DepositReceipt) -> bool {
        if self.has_deposit(&receipt.event_key) {
            return false;
        }
        self.top_up(receipt.amount, receipt.observed_at);
        self.deposits.push(receipt);
        true
    }

    /// Moves `amount` from available to utilised and records the funded loan.
    pub fn commit_to_loan(&mut self, loan_id: &str, amount: Decimal, now: DateTime<Utc>) {
        self.available_amount -= amount;
        self.utilised_amount += amount;
        self.loans.push(loan_id.to_string());
        self.updated_at = now;
    }

    /// `available + utilised == approved`
    pub fn is_balanced(&self) -> bool {
        self.available_amount + self.utilised_amount == self.lending_amount_approved
    }
}

/// Request to create or top up an allowance
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAllowanceRequest {
    #[validate(length(equal = 42), custom = "validate_hex_address")]
    pub user_address: String,

    #[validate(custom = "validate_positive")]
    pub allowance_amount: Decimal,

    #[validate(range(max = 360))]
    pub duration_preference: u32,
}

fn validate_hex_address(address: &str) -> Result<(), ValidationError> {
    match address.strip_prefix("0x") {
        Some(hex_part) if hex_part.chars().all(|c| c.is_ascii_hexdigit()) => Ok(()),
        _ => Err(ValidationError::new("invalid_address")),
    }
}

fn validate_positive(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_positive() && !amount.is_zero() {
        Ok(())
    } else {
        Err(ValidationError::new("amount_must_be_positive"))
    }
}
