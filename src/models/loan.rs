//! Loan document: one borrower draw and its lender-side ledgers
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of the authoritative repayment schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub due_principal: Decimal,
    pub due_interest: Decimal,
    pub due_timestamp: Option<DateTime<Utc>>,
    pub paid: bool,
}

/// Principal a lender put into a loan and what came back so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LenderInvestment {
    pub user_address: String,
    pub amount: Decimal,
    pub amount_received: Decimal,
    pub received_interest: Decimal,
    pub total_received: Decimal,
    pub remaining_amount: Decimal,
}

/// Expected monthly cashflow owed to a lender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LenderReceivable {
    pub user_address: String,
    pub amount: Decimal,
    pub interest: Decimal,
    pub total_amount: Decimal,
    pub remaining_amount: Decimal,
}

/// Allowance debit that could not be applied because the cached balance was
/// lower than the on-chain contribution. Needs manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationFlag {
    pub lender: String,
    pub required: Decimal,
    pub available: Decimal,
    pub detected_at: DateTime<Utc>,
}

/// Loan model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Uuid,
    /// Chain-assigned loan identifier (bytes32 hex)
    pub loan_id: String,
    /// Borrower wallet
    pub user_address: String,

    pub loan_amount: Decimal,
    pub up_front_payment: Decimal,
    pub total_amount_payable: Decimal,
    pub remaining_amount: Decimal,
    /// Annual rate in percent
    pub interest_rate: Decimal,
    pub interest: Decimal,
    pub loan_duration: u32,
    pub number_of_monthly_installments: u32,
    pub monthly_payable_amount: Decimal,
    pub interest_payable_month: Decimal,
    pub principal_payable_month: Decimal,

    pub asset: String,
    pub asset_borrowed: Decimal,
    pub asset_remaining: Decimal,
    pub asset_price: Decimal,
    pub asset_released_per_month: Decimal,
    pub liquidation_factor: Decimal,
    pub liquidation_price: Option<Decimal>,

    pub amortization_schedule: Vec<Installment>,
    pub opened_on: DateTime<Utc>,
    pub last_payment_date: DateTime<Utc>,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub loan_end: DateTime<Utc>,
    pub months_not_paid: u32,
    pub reminder_days_before: Option<i64>,

    pub lenders_capital_invested: Vec<LenderInvestment>,
    pub receivable_amount_monthly_by_lenders: Vec<LenderReceivable>,

    pub is_active: bool,
    pub is_liquidated: bool,
    pub is_repaid: bool,
    pub is_defaulted: bool,
    pub allowances_updated: bool,
    pub reconciliation_flags: Vec<ReconciliationFlag>,
    /// Payment keys already folded into this document
    #[serde(default)]
    pub applied_payments: Vec<String>,

    pub creation_tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    pub fn is_terminal(&self) -> bool {
        self.is_repaid || self.is_liquidated || self.is_defaulted
    }

    pub fn investment(&self, lender: &str) -> Option<&LenderInvestment> {
        self.lenders_capital_invested
            .iter()
            .find(|l| l.user_address.eq_ignore_ascii_case(lender))
    }

    pub fn investment_mut(&mut self, lender: &str) -> Option<&mut LenderInvestment> {
        self.lenders_capital_invested
            .iter_mut()
            .find(|l| l.user_address.eq_ignore_ascii_case(lender))
    }

    /// Outstanding principal across all lenders
    pub fn lenders_remaining(&self) -> Decimal {
        self.lenders_capital_invested
            .iter()
            .map(|l| l.remaining_amount)
            .sum()
    }

    pub fn paid_installments(&self) -> usize {
        self.amortization_schedule.iter().filter(|i| i.paid).count()
    }

    pub fn has_applied(&self, payment_key: &str) -> bool {
        self.applied_payments.iter().any(|k| k == payment_key)
    }
}
