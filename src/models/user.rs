//! User document, keyed by wallet address
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Lend, Loan};

/// User model
///
/// Running totals are derived from the user's Lend and Loan records and are
/// not authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub user_address: String,
    pub loans: Vec<String>,
    pub lendings: Vec<Uuid>,
    pub payments: Vec<String>,
    pub total_capital_lent: Decimal,
    pub total_capital_borrowed: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_address: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_address: super::normalize_address(user_address),
            loans: Vec::new(),
            lendings: Vec::new(),
            payments: Vec::new(),
            total_capital_lent: Decimal::ZERO,
            total_capital_borrowed: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn link_lending(&mut self, lend: &Lend) {
        if !self.lendings.contains(&lend.id) {
            self.lendings.push(lend.id);
        }
        self.total_capital_lent = lend.lending_amount_approved;
        self.updated_at = Utc::now();
    }

    /// Links the loan and recomputes the borrowed total from every loan the
    /// borrower holds.
    pub fn link_loan(&mut self, loan: &Loan, borrower_loans: &[Loan]) {
        if !self.loans.iter().any(|l| l == &loan.loan_id) {
            self.loans.push(loan.loan_id.clone());
        }
        self.total_capital_borrowed = borrower_loans.iter().map(|l| l.loan_amount).sum();
        self.updated_at = Utc::now();
    }

    pub fn link_payment(&mut self, payment_key: &str) {
        if !self.payments.iter().any(|p| p == payment_key) {
            self.payments.push(payment_key.to_string());
            self.updated_at = Utc::now();
        }
    }
}
