//! Read accessors over reconciled loans

use std::sync::Arc;

use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{normalize_address, Loan, Payment};
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct LoanService {
    store: Arc<dyn LedgerStore>,
}

impl LoanService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn get_loan(&self, loan_id: &str) -> ReconcileResult<Loan> {
        self.store
            .find_loan(loan_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("Loan", loan_id))
    }

    pub async fn loans_for_borrower(&self, borrower: &str) -> ReconcileResult<Vec<Loan>> {
        self.store
            .loans_by_borrower(&normalize_address(borrower))
            .await
    }

    /// Payments in the order they were made
    pub async fn payments_for_loan(&self, loan_id: &str) -> ReconcileResult<Vec<Payment>> {
        self.store.payments_for_loan(loan_id).await
    }

    /// Loans carrying an allowance divergence that needs an operator
    pub async fn loans_needing_reconciliation(&self) -> ReconcileResult<Vec<Loan>> {
        Ok(self
            .store
            .list_loans()
            .await?
            .into_iter()
            .filter(|l| !l.reconciliation_flags.is_empty())
            .collect())
    }
}
