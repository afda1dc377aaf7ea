use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EventHandler, EventOutcome};
use crate::chain::{EventMeta, OnChainContribution, OnChainInstallment, OnChainLoan};
use crate::error::{ReconcileError, ReconcileResult};
use crate::finance::{periods_after, round_btc, round_usdc};
use crate::models::{
    normalize_address, Installment, LenderInvestment, LenderReceivable, Loan, Notification,
    NotificationKind,
};

impl EventHandler {
    /// Creates the loan from the contract's stored terms and books the
    /// lenders' allowances. Keyed by `loan_id`; a loan whose allowances are
    /// not booked yet resumes booking instead of being skipped.
    pub(super) async fn handle_loan_created(
        &self,
        meta: &EventMeta,
        loan_id: &str,
        event_amount: Decimal,
        event_collateral: Decimal,
        borrower: &str,
    ) -> ReconcileResult<EventOutcome> {
        let loan_id = loan_id.to_lowercase();
        let borrower = normalize_address(borrower);

        if let Some(mut existing) = self.store.find_loan(&loan_id).await? {
            if existing.allowances_updated {
                debug!(loan_id = %loan_id, "Loan already recorded");
                return Ok(EventOutcome::Duplicate);
            }
            let report = self.ledger.book_loan(&mut existing).await?;
            info!(
                loan_id = %loan_id,
                debited = report.debited,
                flagged = report.flagged,
                "Resumed allowance booking"
            );
            self.finish_loan_creation(&existing, &loan_id).await?;
            return Ok(EventOutcome::Applied);
        }

        let Some(_) = self.store.find_user(&borrower).await? else {
            warn!(loan_id = %loan_id, borrower = %borrower, "Borrower not found, skipping loan");
            return Ok(EventOutcome::Skipped);
        };

        let on_chain = self.chain.loan(&loan_id).await?;
        let schedule = self.chain.installment_schedule(&loan_id).await?;
        let contributions = self.chain.contributions(&loan_id).await?;

        if on_chain.principal != event_amount {
            warn!(
                loan_id = %loan_id,
                event_amount = %event_amount,
                principal = %on_chain.principal,
                "Event amount differs from stored principal, using stored principal"
            );
        }

        let mut loan = build_loan(
            &loan_id,
            &borrower,
            event_collateral,
            &on_chain,
            &schedule,
            &contributions,
            meta,
        )?;

        if !self.store.create_loan(&loan).await? {
            debug!(loan_id = %loan_id, "Loan created concurrently");
            return Ok(EventOutcome::Duplicate);
        }

        let report = self.ledger.book_loan(&mut loan).await?;
        self.finish_loan_creation(&loan, &loan_id).await?;

        info!(
            loan_id = %loan_id,
            borrower = %borrower,
            principal = %loan.loan_amount,
            lenders = loan.lenders_capital_invested.len(),
            debited = report.debited,
            flagged = report.flagged,
            block = meta.block_number,
            tx_hash = %meta.tx_hash,
            "Loan recorded"
        );
        Ok(EventOutcome::Applied)
    }

    async fn finish_loan_creation(&self, loan: &Loan, loan_id: &str) -> ReconcileResult<()> {
        if let Some(mut user) = self.store.find_user(&loan.user_address).await? {
            let borrower_loans = self.store.loans_by_borrower(&loan.user_address).await?;
            user.link_loan(loan, &borrower_loans);
            self.store.update_user(&user).await?;
        }

        self.notify(
            Notification::new(NotificationKind::LoanOpened, loan_id, &loan.user_address)
                .for_loan(loan_id)
                .with_amount(loan.loan_amount),
        )
        .await
    }
}

/// Projects the contract's loan state into a ledger document.
///
/// Interest is the contract rate applied once to the principal over the whole
/// term; per-installment figures are the totals split evenly.
pub fn build_loan(
    loan_id: &str,
    borrower: &str,
    event_collateral: Decimal,
    on_chain: &OnChainLoan,
    schedule: &[OnChainInstallment],
    contributions: &[OnChainContribution],
    meta: &EventMeta,
) -> ReconcileResult<Loan> {
    if on_chain.duration == 0 {
        return Err(ReconcileError::Validation(format!(
            "loan {} has a zero-month duration",
            loan_id
        )));
    }

    let installments = Decimal::from(on_chain.duration);
    let principal = on_chain.principal;
    let interest = round_usdc(on_chain.interest_rate / dec!(100) * principal);

    let collateral = if on_chain.collateral > Decimal::ZERO {
        on_chain.collateral
    } else {
        event_collateral
    };

    let lenders_capital_invested = contributions
        .iter()
        .map(|c| LenderInvestment {
            user_address: normalize_address(&c.lender),
            amount: c.amount,
            amount_received: Decimal::ZERO,
            received_interest: Decimal::ZERO,
            total_received: Decimal::ZERO,
            remaining_amount: c.amount,
        })
        .collect::<Vec<_>>();

    let receivable_amount_monthly_by_lenders = contributions
        .iter()
        .map(|c| LenderReceivable {
            user_address: normalize_address(&c.lender),
            amount: round_usdc(c.amount / installments),
            interest: round_usdc(c.receivable_interest / installments),
            total_amount: round_usdc((c.amount + c.receivable_interest) / installments),
            remaining_amount: c.amount,
        })
        .collect();

    let invested: Decimal = lenders_capital_invested.iter().map(|l| l.amount).sum();
    if !contributions.is_empty() && invested != principal {
        warn!(
            loan_id = %loan_id,
            invested = %invested,
            principal = %principal,
            "Lender contributions do not add up to the principal"
        );
    }

    // Follows the lender side so the per-lender sum always matches
    let remaining_amount = if contributions.is_empty() {
        principal
    } else {
        invested
    };

    let start = on_chain.start_time;
    let out_of_range = || {
        ReconcileError::Arithmetic(format!(
            "loan {} term of {} months runs past the supported date range",
            loan_id, on_chain.duration
        ))
    };
    let next_payment_date = periods_after(start, 1).ok_or_else(out_of_range)?;
    let loan_end = periods_after(start, i64::from(on_chain.duration)).ok_or_else(out_of_range)?;
    let now = Utc::now();

    Ok(Loan {
        id: Uuid::new_v4(),
        loan_id: loan_id.to_lowercase(),
        user_address: normalize_address(borrower),
        loan_amount: principal,
        up_front_payment: on_chain.borrower_deposit,
        total_amount_payable: principal + interest,
        remaining_amount,
        interest_rate: on_chain.interest_rate,
        interest,
        loan_duration: on_chain.duration,
        number_of_monthly_installments: on_chain.duration,
        monthly_payable_amount: on_chain.monthly_payment,
        interest_payable_month: round_usdc(interest / installments),
        principal_payable_month: round_usdc(principal / installments),
        asset: "BTC".to_string(),
        asset_borrowed: collateral,
        asset_remaining: collateral,
        asset_price: on_chain.btc_price_at_creation,
        asset_released_per_month: round_btc(collateral / installments),
        liquidation_factor: principal - on_chain.borrower_deposit,
        liquidation_price: None,
        amortization_schedule: schedule
            .iter()
            .map(|i| Installment {
                due_principal: i.due_principal,
                due_interest: i.due_interest,
                due_timestamp: i.due_timestamp,
                paid: i.paid,
            })
            .collect(),
        opened_on: start,
        last_payment_date: start,
        next_payment_date: Some(next_payment_date),
        loan_end,
        months_not_paid: 0,
        reminder_days_before: None,
        lenders_capital_invested,
        receivable_amount_monthly_by_lenders,
        is_active: true,
        is_liquidated: false,
        is_repaid: false,
        is_defaulted: false,
        allowances_updated: false,
        reconciliation_flags: Vec::new(),
        applied_payments: Vec::new(),
        creation_tx_hash: meta.tx_hash.clone(),
        created_at: now,
        updated_at: now,
    })
}
