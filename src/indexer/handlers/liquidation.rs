use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{EventHandler, EventOutcome};
use crate::chain::EventMeta;
use crate::error::ReconcileResult;
use crate::models::{Notification, NotificationKind};

impl EventHandler {
    pub(super) async fn handle_liquidation(
        &self,
        meta: &EventMeta,
        loan_id: &str,
        btc_price: Decimal,
    ) -> ReconcileResult<EventOutcome> {
        let Some(mut loan) = self.store.find_loan(loan_id).await? else {
            warn!(loan_id = %loan_id, tx_hash = %meta.tx_hash, "Loan not found, skipping liquidation");
            return Ok(EventOutcome::Skipped);
        };

        let outcome = if loan.is_liquidated {
            debug!(loan_id = %loan_id, "Loan already liquidated");
            EventOutcome::Duplicate
        } else {
            loan.is_active = false;
            loan.is_liquidated = true;
            loan.liquidation_price = Some(btc_price);
            loan.next_payment_date = None;
            loan.updated_at = Utc::now();
            self.store.update_loan(&loan).await?;
            EventOutcome::Applied
        };

        // Keyed by loan, so a replay only fills in a missing notification
        self.notify(
            Notification::new(NotificationKind::LoanLiquidated, &loan.loan_id, &loan.user_address)
                .for_loan(&loan.loan_id)
                .with_amount(loan.remaining_amount),
        )
        .await?;

        if outcome == EventOutcome::Duplicate {
            return Ok(outcome);
        }

        info!(
            loan_id = %loan.loan_id,
            borrower = %loan.user_address,
            btc_price = %btc_price,
            remaining = %loan.remaining_amount,
            block = meta.block_number,
            "Loan liquidated"
        );
        Ok(outcome)
    }
}
