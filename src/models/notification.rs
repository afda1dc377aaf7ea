//! Notification outbox records. Delivery lives outside this service.
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DepositReceived,
    LoanOpened,
    PaymentRecorded,
    LoanLiquidated,
    LoanDefaulted,
    PaymentReminder,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::DepositReceived => "deposit_received",
            NotificationKind::LoanOpened => "loan_opened",
            NotificationKind::PaymentRecorded => "payment_recorded",
            NotificationKind::LoanLiquidated => "loan_liquidated",
            NotificationKind::LoanDefaulted => "loan_defaulted",
            NotificationKind::PaymentReminder => "payment_reminder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// `<kind>:<idempotency key>`
    pub key: String,
    pub kind: NotificationKind,
    pub user_address: String,
    pub loan_id: Option<String>,
    pub amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, source_key: &str, user_address: &str) -> Self {
        Self {
            key: format!("{}:{}", kind.as_str(), source_key),
            kind,
            user_address: user_address.to_string(),
            loan_id: None,
            amount: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_loan(mut self, loan_id: &str) -> Self {
        self.loan_id = Some(loan_id.to_string());
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }
}
