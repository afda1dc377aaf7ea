//! Per-event ledger mutations
//!
//! Every handler is an idempotent upsert keyed by the event's natural key.
//! A handler returns `Ok(Skipped)` when a referenced document is missing
//! (nothing is written) and `Err` only for failures the orchestrator must
//! count, transient ones included.

mod deposit;
mod liquidation;
mod loan_created;
mod payout;

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::chain::{ChainClient, ChainEvent, EventPayload};
use crate::error::ReconcileResult;
use crate::models::Notification;
use crate::services::AllowanceLedger;
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventOutcome {
    /// The ledger changed
    Applied,
    /// Already reflected in the ledger; nothing written
    Duplicate,
    /// A referenced document is missing; nothing written
    Skipped,
}

#[derive(Clone)]
pub struct EventHandler {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    ledger: AllowanceLedger,
}

impl EventHandler {
    pub fn new(store: Arc<dyn LedgerStore>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            ledger: AllowanceLedger::new(store.clone()),
            store,
            chain,
        }
    }

    pub async fn handle_event(&self, event: &ChainEvent) -> ReconcileResult<EventOutcome> {
        let meta = &event.meta;
        match &event.payload {
            EventPayload::Deposit {
                lender,
                amount,
                reinvest,
            } => self.handle_deposit(meta, lender, *amount, *reinvest).await,
            EventPayload::LoanCreated {
                loan_id,
                amount,
                collateral,
                borrower,
            } => {
                self.handle_loan_created(meta, loan_id, *amount, *collateral, borrower)
                    .await
            }
            EventPayload::Payout {
                loan_id,
                borrower,
                amount,
                fully_repaid,
            } => {
                self.handle_payout(meta, loan_id, borrower, *amount, *fully_repaid)
                    .await
            }
            EventPayload::InstallmentPaid { loan_id, index } => {
                self.handle_installment_paid(meta, loan_id, *index).await
            }
            EventPayload::LoanLiquidated {
                loan_id,
                btc_price,
                ..
            } => self.handle_liquidation(meta, loan_id, *btc_price).await,
        }
    }

    /// Outbox insert; a second call with the same key is a no-op
    async fn notify(&self, notification: Notification) -> ReconcileResult<()> {
        if self.store.create_notification(&notification).await? {
            debug!(key = %notification.key, user = %notification.user_address, "Notification queued");
        }
        Ok(())
    }
}
