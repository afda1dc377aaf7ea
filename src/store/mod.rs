//! Document store behind the ledger
//!
//! Every entity is read and written as a whole document, keyed by its natural
//! idempotency key. `create_*` is create-if-absent and reports whether the
//! document was actually inserted, so a redelivered event can never produce a
//! second record.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::error::ReconcileResult;
use crate::models::{IndexerCursor, Lend, Loan, Notification, Payment, User};

/// Which persistence backend a store writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process memory only; for tests and local runs
    Memory,
    Postgres,
}

impl StoreBackend {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_user(&self, address: &str) -> ReconcileResult<Option<User>>;
    async fn create_user(&self, user: &User) -> ReconcileResult<bool>;
    async fn update_user(&self, user: &User) -> ReconcileResult<()>;

    async fn find_lend(&self, lender: &str) -> ReconcileResult<Option<Lend>>;
    async fn create_lend(&self, lend: &Lend) -> ReconcileResult<bool>;
    async fn update_lend(&self, lend: &Lend) -> ReconcileResult<()>;
    async fn list_lends(&self) -> ReconcileResult<Vec<Lend>>;

    async fn find_loan(&self, loan_id: &str) -> ReconcileResult<Option<Loan>>;
    async fn create_loan(&self, loan: &Loan) -> ReconcileResult<bool>;
    async fn update_loan(&self, loan: &Loan) -> ReconcileResult<()>;
    async fn list_loans(&self) -> ReconcileResult<Vec<Loan>>;
    async fn loans_by_borrower(&self, borrower: &str) -> ReconcileResult<Vec<Loan>>;

    async fn find_payment(&self, payment_key: &str) -> ReconcileResult<Option<Payment>>;
    async fn create_payment(&self, payment: &Payment) -> ReconcileResult<bool>;
    async fn update_payment(&self, payment: &Payment) -> ReconcileResult<()>;
    async fn payments_for_loan(&self, loan_id: &str) -> ReconcileResult<Vec<Payment>>;

    async fn create_notification(&self, notification: &Notification) -> ReconcileResult<bool>;
    async fn list_notifications(&self) -> ReconcileResult<Vec<Notification>>;

    async fn load_cursor(&self, contract_address: &str) -> ReconcileResult<Option<IndexerCursor>>;
    async fn save_cursor(&self, cursor: &IndexerCursor) -> ReconcileResult<()>;

    /// Claims the single reconciliation writer slot. Returns false when
    /// another process holds it.
    async fn try_acquire_writer_lock(&self) -> ReconcileResult<bool>;

    async fn ping(&self) -> ReconcileResult<()>;

    fn backend(&self) -> StoreBackend;
}
