use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EventHandler, EventOutcome};
use crate::chain::{EventMeta, OnChainContribution, OnChainInstallment};
use crate::error::{ReconcileError, ReconcileResult};
use crate::finance::{periods_after, round_btc};
use crate::models::{
    normalize_address, Distribution, Installment, Loan, Notification, NotificationKind, Payment,
};

impl EventHandler {
    /// Records a payout and moves the lender ledgers by what the contract
    /// repaid since the last observation.
    ///
    /// The payment is stored unapplied first, then folded into the loan (the
    /// loan remembers the payment key in the same write), then marked
    /// applied. Distributions are measured against the loan at apply time, so
    /// a payment resumed after a later one was applied only moves what is
    /// still unaccounted for.
    pub(super) async fn handle_payout(
        &self,
        meta: &EventMeta,
        loan_id: &str,
        borrower: &str,
        amount: Decimal,
        fully_repaid: bool,
    ) -> ReconcileResult<EventOutcome> {
        let payment_key = meta.event_key();
        let borrower = normalize_address(borrower);

        let Some(mut loan) = self.store.find_loan(loan_id).await? else {
            warn!(loan_id = %loan_id, tx_hash = %meta.tx_hash, "Loan not found, skipping payout");
            return Ok(EventOutcome::Skipped);
        };

        let mut payment = match self.store.find_payment(&payment_key).await? {
            Some(payment) if payment.applied => {
                debug!(payment_key = %payment_key, "Payout already recorded");
                return Ok(EventOutcome::Duplicate);
            }
            Some(payment) => {
                debug!(payment_key = %payment_key, "Resuming unapplied payout");
                payment
            }
            None => {
                let payment = Payment {
                    id: Uuid::new_v4(),
                    payment_key: payment_key.clone(),
                    tx_hash: meta.tx_hash.clone(),
                    loan_id: loan.loan_id.clone(),
                    user_address: borrower.clone(),
                    payment_amount: amount,
                    payment_time: meta.timestamp,
                    asset: loan.asset.clone(),
                    distributions: Vec::new(),
                    fully_repaid,
                    applied: false,
                };
                if !self.store.create_payment(&payment).await? {
                    debug!(payment_key = %payment_key, "Payout recorded concurrently");
                    return Ok(EventOutcome::Duplicate);
                }
                payment
            }
        };

        if !loan.has_applied(&payment_key) {
            let contributions = self.chain.contributions(&loan.loan_id).await?;
            let schedule = self.chain.installment_schedule(&loan.loan_id).await?;
            let price = self.chain.price().await?;

            payment.distributions = compute_distributions(&loan, &contributions);
            self.store.update_payment(&payment).await?;

            apply_payment(&mut loan, &payment, &schedule, price, meta.timestamp)?;
            self.store.update_loan(&loan).await?;
        }

        payment.applied = true;
        self.store.update_payment(&payment).await?;

        if let Some(mut user) = self.store.find_user(&borrower).await? {
            if !user.payments.contains(&payment_key) {
                user.link_payment(&payment_key);
                self.store.update_user(&user).await?;
            }
        }

        self.notify(
            Notification::new(NotificationKind::PaymentRecorded, &payment_key, &borrower)
                .for_loan(&loan.loan_id)
                .with_amount(amount),
        )
        .await?;

        info!(
            loan_id = %loan.loan_id,
            amount = %amount,
            distributed = %payment.total_distributed(),
            remaining = %loan.remaining_amount,
            fully_repaid,
            block = meta.block_number,
            tx_hash = %meta.tx_hash,
            "Payout recorded"
        );
        Ok(EventOutcome::Applied)
    }

    /// Marks one schedule entry paid. Balances move on Payout only.
    pub(super) async fn handle_installment_paid(
        &self,
        meta: &EventMeta,
        loan_id: &str,
        index: u64,
    ) -> ReconcileResult<EventOutcome> {
        let Some(mut loan) = self.store.find_loan(loan_id).await? else {
            warn!(loan_id = %loan_id, index, "Loan not found, skipping installment");
            return Ok(EventOutcome::Skipped);
        };

        let slot = usize::try_from(index).unwrap_or(usize::MAX);
        let refreshed = slot >= loan.amortization_schedule.len();
        if refreshed {
            let schedule = self.chain.installment_schedule(&loan.loan_id).await?;
            loan.amortization_schedule = schedule.iter().map(to_installment).collect();
        }

        let Some(entry) = loan.amortization_schedule.get_mut(slot) else {
            warn!(loan_id = %loan_id, index, "Installment index outside the schedule");
            return Ok(EventOutcome::Skipped);
        };

        if entry.paid && !refreshed {
            debug!(loan_id = %loan_id, index, "Installment already marked paid");
            return Ok(EventOutcome::Duplicate);
        }

        entry.paid = true;
        loan.last_payment_date = loan.last_payment_date.max(meta.timestamp);
        loan.updated_at = Utc::now();
        self.store.update_loan(&loan).await?;

        info!(
            loan_id = %loan.loan_id,
            index,
            paid = loan.paid_installments(),
            block = meta.block_number,
            "Installment marked paid"
        );
        Ok(EventOutcome::Applied)
    }
}

fn to_installment(i: &OnChainInstallment) -> Installment {
    Installment {
        due_principal: i.due_principal,
        due_interest: i.due_interest,
        due_timestamp: i.due_timestamp,
        paid: i.paid,
    }
}

/// Per-lender movement since the ledger last saw the contract. A contract
/// figure below the recorded one yields a zero delta, never a negative one.
pub fn compute_distributions(loan: &Loan, contributions: &[OnChainContribution]) -> Vec<Distribution> {
    contributions
        .iter()
        .filter_map(|c| {
            let Some(prev) = loan.investment(&c.lender) else {
                warn!(loan_id = %loan.loan_id, lender = %c.lender, "Contribution for unknown lender");
                return None;
            };

            let principal = clamp_delta(c.repaid_principal - prev.amount_received, loan, &c.lender);
            let interest = clamp_delta(c.repaid_interest - prev.received_interest, loan, &c.lender);
            Some(Distribution::new(prev.user_address.clone(), principal, interest))
        })
        .collect()
}

fn clamp_delta(delta: Decimal, loan: &Loan, lender: &str) -> Decimal {
    if delta < Decimal::ZERO {
        warn!(
            loan_id = %loan.loan_id,
            lender = %lender,
            delta = %delta,
            "Contract reports less than already recorded, ignoring"
        );
        return Decimal::ZERO;
    }
    delta
}

/// Folds a payment into the loan document.
///
/// A non-final payment on a liquidated or defaulted loan still moves the
/// ledgers but leaves the payment dates of the closed loan alone.
pub fn apply_payment(
    loan: &mut Loan,
    payment: &Payment,
    schedule: &[OnChainInstallment],
    price: Decimal,
    at: DateTime<Utc>,
) -> ReconcileResult<()> {
    for d in &payment.distributions {
        let Some(investment) = loan.investment_mut(&d.user_address) else {
            continue;
        };
        investment.amount_received += d.amount;
        investment.received_interest += d.interest;
        investment.total_received += d.total;
        investment.remaining_amount =
            (investment.amount - investment.amount_received).max(Decimal::ZERO);
        let remaining = investment.remaining_amount;

        if let Some(receivable) = loan
            .receivable_amount_monthly_by_lenders
            .iter_mut()
            .find(|r| r.user_address.eq_ignore_ascii_case(&d.user_address))
        {
            receivable.remaining_amount = remaining;
        }
    }

    if loan.amortization_schedule.is_empty() {
        loan.amortization_schedule = schedule.iter().map(to_installment).collect();
    } else {
        for (stored, authoritative) in loan.amortization_schedule.iter_mut().zip(schedule) {
            if authoritative.paid {
                stored.paid = true;
            }
        }
    }

    loan.remaining_amount = loan.lenders_remaining();
    if price > Decimal::ZERO {
        loan.asset_remaining = round_btc(loan.remaining_amount / price);
    }

    if payment.fully_repaid {
        loan.is_active = false;
        loan.is_repaid = true;
        loan.remaining_amount = Decimal::ZERO;
        loan.asset_remaining = Decimal::ZERO;
        loan.next_payment_date = None;
        for investment in &mut loan.lenders_capital_invested {
            investment.remaining_amount = Decimal::ZERO;
        }
        for receivable in &mut loan.receivable_amount_monthly_by_lenders {
            receivable.remaining_amount = Decimal::ZERO;
        }
    } else if !loan.is_terminal() {
        let next = periods_after(at, 1).ok_or_else(|| {
            ReconcileError::Arithmetic(format!("payment time {} out of range", at))
        })?;
        // An older payment resumed late never pulls the due date back
        loan.next_payment_date = Some(loan.next_payment_date.map_or(next, |due| due.max(next)));
    }

    loan.liquidation_factor = loan.remaining_amount;
    loan.last_payment_date = loan.last_payment_date.max(at);
    loan.months_not_paid = 0;
    loan.applied_payments.push(payment.payment_key.clone());
    loan.updated_at = Utc::now();
    Ok(())
}
