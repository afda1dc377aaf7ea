//! Lender-side operations: allowances, liquidity and matching

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use super::matching::{match_lenders_for_loan, MatchResult};
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{normalize_address, CreateAllowanceRequest, Lend};
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct LendingService {
    store: Arc<dyn LedgerStore>,
}

impl LendingService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Creates the lender's allowance, or tops up the existing one and
    /// replaces its duration preference.
    pub async fn create_allowance(&self, request: CreateAllowanceRequest) -> ReconcileResult<Lend> {
        request.validate()?;

        let address = normalize_address(&request.user_address);
        let now = Utc::now();

        let fresh = Lend::new(
            &address,
            request.allowance_amount,
            request.duration_preference,
            now,
        );
        let lend = if self.store.create_lend(&fresh).await? {
            fresh
        } else {
            let mut existing = self
                .store
                .find_lend(&address)
                .await?
                .ok_or_else(|| ReconcileError::not_found("Lend", address.clone()))?;
            existing.top_up(request.allowance_amount, now);
            existing.duration_preference = request.duration_preference;
            self.store.update_lend(&existing).await?;
            existing
        };

        if let Some(mut user) = self.store.find_user(&address).await? {
            user.link_lending(&lend);
            self.store.update_user(&user).await?;
        }

        info!(
            lender = %address,
            amount = %request.allowance_amount,
            approved = %lend.lending_amount_approved,
            "Allowance created/updated"
        );
        Ok(lend)
    }

    pub async fn lending_for(&self, lender: &str) -> ReconcileResult<Lend> {
        self.store
            .find_lend(lender)
            .await?
            .ok_or_else(|| ReconcileError::not_found("Lend", normalize_address(lender)))
    }

    /// Allowances a borrower may draw from, largest approved amount first
    pub async fn matchable_allowances(&self, borrower: &str) -> ReconcileResult<Vec<Lend>> {
        let borrower = normalize_address(borrower);
        let mut lends: Vec<Lend> = self
            .store
            .list_lends()
            .await?
            .into_iter()
            .filter(|l| l.user_address != borrower && l.lending_amount_approved > Decimal::ZERO)
            .collect();
        lends.sort_by(|a, b| b.lending_amount_approved.cmp(&a.lending_amount_approved));
        Ok(lends)
    }

    /// Proposes lenders for a loan. Nothing is booked here; the allowance
    /// ledger only debits what the contract later reports.
    pub async fn match_lenders(
        &self,
        borrower: &str,
        loan_amount: Decimal,
        interest_rate: Decimal,
        duration_months: u32,
    ) -> ReconcileResult<MatchResult> {
        let allowances = self.matchable_allowances(borrower).await?;
        let result = match_lenders_for_loan(&allowances, loan_amount, interest_rate, duration_months);

        if !result.success {
            let available = allowances.iter().map(|l| l.available_amount).sum();
            return Err(ReconcileError::InsufficientLiquidity {
                requested: loan_amount,
                available,
            });
        }
        Ok(result)
    }

    /// Uncommitted capital whose duration preference admits `duration_months`
    pub async fn available_liquidity(
        &self,
        duration_months: u32,
        exclude: Option<&str>,
    ) -> ReconcileResult<Decimal> {
        let exclude = exclude.map(normalize_address);
        Ok(self
            .store
            .list_lends()
            .await?
            .iter()
            .filter(|l| Some(&l.user_address) != exclude.as_ref())
            .filter(|l| l.admits_duration(duration_months))
            .map(|l| l.available_amount.max(Decimal::ZERO))
            .sum())
    }
}
