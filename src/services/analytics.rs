//! Pool-wide statistics

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ReconcileResult;
use crate::store::LedgerStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_usd_invested: Decimal,
    pub total_available: Decimal,
    pub total_utilised: Decimal,
    pub unique_lenders: usize,
    pub unique_borrowers: usize,
    pub total_loaned_usd: Decimal,
    pub total_loaned_btc: Decimal,
    pub active_loans: usize,
}

#[derive(Clone)]
pub struct AnalyticsService {
    store: Arc<dyn LedgerStore>,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn pool_stats(&self) -> ReconcileResult<PoolStats> {
        let lends = self.store.list_lends().await?;
        let loans = self.store.list_loans().await?;

        let borrowers: HashSet<&str> = loans.iter().map(|l| l.user_address.as_str()).collect();

        Ok(PoolStats {
            total_usd_invested: lends.iter().map(|l| l.lending_amount_approved).sum(),
            total_available: lends.iter().map(|l| l.available_amount).sum(),
            total_utilised: lends.iter().map(|l| l.utilised_amount).sum(),
            unique_lenders: lends.len(),
            unique_borrowers: borrowers.len(),
            total_loaned_usd: loans.iter().map(|l| l.loan_amount).sum(),
            total_loaned_btc: loans.iter().map(|l| l.asset_borrowed).sum(),
            active_loans: loans.iter().filter(|l| l.is_active).count(),
        })
    }
}
