//! Background loan monitor: missed-period tracking, defaults and reminders
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::ReconcileResult;
use crate::finance::PAYMENT_PERIOD_DAYS;
use crate::models::{Loan, Notification, NotificationKind};
use crate::store::LedgerStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub checked: usize,
    pub defaulted: Vec<String>,
    pub reminders: usize,
}

/// Whole 30-day periods elapsed since the due date, counting the one that is
/// already late.
pub fn missed_periods(due: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    if now <= due {
        return 0;
    }
    let late_days = (now - due).num_days();
    u32::try_from(late_days / PAYMENT_PERIOD_DAYS + 1).unwrap_or(u32::MAX)
}

pub struct LoanMonitor {
    store: Arc<dyn LedgerStore>,
    config: MonitorConfig,
    write_gate: Arc<Mutex<()>>,
}

impl LoanMonitor {
    pub fn new(store: Arc<dyn LedgerStore>, config: MonitorConfig, write_gate: Arc<Mutex<()>>) -> Self {
        Self {
            store,
            config,
            write_gate,
        }
    }

    pub async fn start(self: Arc<Self>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            default_after = self.config.default_after_missed,
            "Starting loan monitor"
        );

        loop {
            tokio::time::sleep(self.config.interval).await;

            match self.run_once(Utc::now()).await {
                Ok(report) => {
                    for loan_id in &report.defaulted {
                        warn!(loan_id = %loan_id, "Loan defaulted");
                    }
                    debug!(checked = report.checked, reminders = report.reminders, "Monitor pass complete");
                }
                Err(e) => error!(code = e.error_code(), "Error checking loans: {}", e),
            }
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> ReconcileResult<MonitorReport> {
        let mut report = MonitorReport::default();
        if !self.store.try_acquire_writer_lock().await? {
            return Ok(report);
        }
        let _gate = self.write_gate.lock().await;

        let loans = self.store.list_loans().await?;
        for mut loan in loans.into_iter().filter(|l| l.is_active && !l.is_terminal()) {
            let Some(due) = loan.next_payment_date else {
                continue;
            };
            report.checked += 1;

            let missed = missed_periods(due, now);
            if missed >= self.config.default_after_missed.max(1) {
                self.mark_defaulted(&mut loan, missed, now).await?;
                report.defaulted.push(loan.loan_id.clone());
                continue;
            }

            if missed != loan.months_not_paid {
                loan.months_not_paid = missed;
                loan.updated_at = now;
                self.store.update_loan(&loan).await?;
            }

            if self.remind(&loan, due, now).await? {
                report.reminders += 1;
            }
        }

        Ok(report)
    }

    async fn mark_defaulted(
        &self,
        loan: &mut Loan,
        missed: u32,
        now: DateTime<Utc>,
    ) -> ReconcileResult<()> {
        loan.months_not_paid = missed;
        loan.is_defaulted = true;
        loan.is_active = false;
        loan.updated_at = now;
        self.store.update_loan(loan).await?;

        let notification =
            Notification::new(NotificationKind::LoanDefaulted, &loan.loan_id, &loan.user_address)
                .for_loan(&loan.loan_id)
                .with_amount(loan.remaining_amount);
        self.store.create_notification(&notification).await?;

        info!(loan_id = %loan.loan_id, missed, "Loan marked defaulted");
        Ok(())
    }

    /// Queues one reminder per due date while inside the lead window.
    async fn remind(&self, loan: &Loan, due: DateTime<Utc>, now: DateTime<Utc>) -> ReconcileResult<bool> {
        let lead = loan
            .reminder_days_before
            .unwrap_or(self.config.reminder_days_before);
        let window_opens = Duration::try_days(lead).and_then(|d| due.checked_sub_signed(d));
        match window_opens {
            Some(opens) if lead > 0 && now < due && now >= opens => {}
            _ => return Ok(false),
        }

        let source = format!("{}:{}", loan.loan_id, due.format("%Y-%m-%d"));
        let notification =
            Notification::new(NotificationKind::PaymentReminder, &source, &loan.user_address)
                .for_loan(&loan.loan_id)
                .with_amount(loan.monthly_payable_amount);
        let queued = self.store.create_notification(&notification).await?;
        if queued {
            debug!(loan_id = %loan.loan_id, due = %due, "Payment reminder queued");
        }
        Ok(queued)
    }
}
