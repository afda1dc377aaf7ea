//! Persisted documents for the lending ledger

pub mod lend;
pub mod loan;
pub mod notification;
pub mod payment;
pub mod user;

pub use lend::{CreateAllowanceRequest, DepositReceipt, Lend};
pub use loan::{Installment, LenderInvestment, LenderReceivable, Loan, ReconciliationFlag};
pub use notification::{Notification, NotificationKind};
pub use payment::{Distribution, Payment};
pub use user::User;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wallet addresses are compared case-insensitively on chain; the ledger keys
/// them lowercase.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Progress marker of the chain poller for one contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerCursor {
    pub contract_address: String,
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}
