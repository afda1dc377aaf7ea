//! Post-match allowance booking
//!
//! Debits each lender's allowance by the contribution the contract actually
//! recorded for a loan. The sequence is resumable: a lend already listing the
//! loan is never debited twice, and the loan's `allowances_updated` flag is
//! only set once every lender has been visited.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ReconcileResult;
use crate::models::{Loan, ReconciliationFlag};
use crate::store::LedgerStore;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BookingReport {
    pub debited: usize,
    pub already_booked: usize,
    pub flagged: usize,
}

#[derive(Clone)]
pub struct AllowanceLedger {
    store: Arc<dyn LedgerStore>,
}

impl AllowanceLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Books `loan.lenders_capital_invested` against the lenders' allowances
    /// and persists the loan with `allowances_updated` set.
    ///
    /// A lender whose cached balance cannot cover the contribution is not
    /// debited: the divergence is flagged on both documents and left for
    /// manual reconciliation.
    pub async fn book_loan(&self, loan: &mut Loan) -> ReconcileResult<BookingReport> {
        let mut report = BookingReport::default();
        if loan.allowances_updated {
            return Ok(report);
        }

        let now = Utc::now();
        let investments = loan.lenders_capital_invested.clone();

        for investment in &investments {
            let lender = &investment.user_address;
            let required = investment.amount;

            let Some(mut lend) = self.store.find_lend(lender).await? else {
                warn!(
                    loan_id = %loan.loan_id,
                    lender = %lender,
                    required = %required,
                    "No allowance on record for contributing lender"
                );
                flag(loan, lender, required, Decimal::ZERO, now);
                report.flagged += 1;
                continue;
            };

            if lend.funds_loan(&loan.loan_id) {
                report.already_booked += 1;
                continue;
            }

            if lend.available_amount < required {
                warn!(
                    loan_id = %loan.loan_id,
                    lender = %lender,
                    required = %required,
                    available = %lend.available_amount,
                    "Stale allowance balance, skipping debit"
                );
                flag(loan, lender, required, lend.available_amount, now);
                if !lend.needs_reconciliation {
                    lend.needs_reconciliation = true;
                    lend.updated_at = now;
                    self.store.update_lend(&lend).await?;
                }
                report.flagged += 1;
                continue;
            }

            lend.commit_to_loan(&loan.loan_id, required, now);
            self.store.update_lend(&lend).await?;
            info!(
                loan_id = %loan.loan_id,
                lender = %lender,
                amount = %required,
                available = %lend.available_amount,
                "Allowance debited"
            );
            report.debited += 1;
        }

        loan.allowances_updated = true;
        loan.updated_at = now;
        self.store.update_loan(loan).await?;

        Ok(report)
    }
}

fn flag(
    loan: &mut Loan,
    lender: &str,
    required: Decimal,
    available: Decimal,
    now: DateTime<Utc>,
) {
    if loan
        .reconciliation_flags
        .iter()
        .any(|f| f.lender.eq_ignore_ascii_case(lender))
    {
        return;
    }
    loan.reconciliation_flags.push(ReconciliationFlag {
        lender: lender.to_string(),
        required,
        available,
        detected_at: now,
    });
}
