use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{EventHandler, EventOutcome};
use crate::chain::EventMeta;
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{normalize_address, DepositReceipt, Lend, Notification, NotificationKind};

impl EventHandler {
    /// Books a lender deposit into their allowance, keyed by
    /// `<tx_hash>:<log_index>`.
    pub(super) async fn handle_deposit(
        &self,
        meta: &EventMeta,
        lender: &str,
        amount: Decimal,
        reinvest: bool,
    ) -> ReconcileResult<EventOutcome> {
        let lender = normalize_address(lender);
        let event_key = meta.event_key();

        let Some(mut user) = self.store.find_user(&lender).await? else {
            warn!(lender = %lender, tx_hash = %meta.tx_hash, "User not found, skipping deposit");
            return Ok(EventOutcome::Skipped);
        };

        let receipt = DepositReceipt {
            event_key: event_key.clone(),
            tx_hash: meta.tx_hash.clone(),
            amount,
            reinvest,
            block_number: meta.block_number,
            observed_at: meta.timestamp,
        };

        let (lend, outcome) = match self.store.find_lend(&lender).await? {
            Some(mut lend) => {
                if lend.record_deposit(receipt) {
                    self.store.update_lend(&lend).await?;
                    (lend, EventOutcome::Applied)
                } else {
                    debug!(lender = %lender, event_key = %event_key, "Deposit already booked");
                    (lend, EventOutcome::Duplicate)
                }
            }
            None => {
                let mut lend = Lend::new(&lender, Decimal::ZERO, 0, meta.timestamp);
                lend.record_deposit(receipt);
                if !self.store.create_lend(&lend).await? {
                    // Another writer created it between the read and the insert
                    return Err(ReconcileError::Database(format!(
                        "lend for {} appeared concurrently",
                        lender
                    )));
                }
                (lend, EventOutcome::Applied)
            }
        };

        // Everything below is safe to repeat, so a replay finishes a
        // deposit interrupted after the lend write
        if !user.lendings.contains(&lend.id)
            || user.total_capital_lent != lend.lending_amount_approved
        {
            user.link_lending(&lend);
            self.store.update_user(&user).await?;
        }

        self.notify(
            Notification::new(NotificationKind::DepositReceived, &event_key, &lender)
                .with_amount(amount),
        )
        .await?;

        if outcome == EventOutcome::Applied {
            info!(
                lender = %lender,
                amount = %amount,
                reinvest,
                block = meta.block_number,
                tx_hash = %meta.tx_hash,
                approved = %lend.lending_amount_approved,
                "Deposit booked"
            );
        }
        Ok(outcome)
    }
}
