use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{LedgerStore, StoreBackend};
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{normalize_address, IndexerCursor, Lend, Loan, Notification, Payment, User};

#[derive(Debug, Default)]
struct MemoryState {
    users: BTreeMap<String, User>,
    lends: BTreeMap<String, Lend>,
    loans: BTreeMap<String, Loan>,
    payments: BTreeMap<String, Payment>,
    notifications: BTreeMap<String, Notification>,
    cursors: BTreeMap<String, IndexerCursor>,
}

/// In-process store. Documents are cloned in and out, so callers never hold
/// references into the maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert_absent<T: Clone>(map: &mut BTreeMap<String, T>, key: String, doc: &T) -> bool {
    if map.contains_key(&key) {
        return false;
    }
    map.insert(key, doc.clone());
    true
}

fn replace_existing<T: Clone>(
    map: &mut BTreeMap<String, T>,
    entity: &'static str,
    key: String,
    doc: &T,
) -> ReconcileResult<()> {
    match map.get_mut(&key) {
        Some(slot) => {
            *slot = doc.clone();
            Ok(())
        }
        None => Err(ReconcileError::not_found(entity, key)),
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_user(&self, address: &str) -> ReconcileResult<Option<User>> {
        let state = self.state.read().await;
        Ok(state.users.get(&normalize_address(address)).cloned())
    }

    async fn create_user(&self, user: &User) -> ReconcileResult<bool> {
        let mut state = self.state.write().await;
        Ok(insert_absent(
            &mut state.users,
            normalize_address(&user.user_address),
            user,
        ))
    }

    async fn update_user(&self, user: &User) -> ReconcileResult<()> {
        let mut state = self.state.write().await;
        replace_existing(
            &mut state.users,
            "User",
            normalize_address(&user.user_address),
            user,
        )
    }

    async fn find_lend(&self, lender: &str) -> ReconcileResult<Option<Lend>> {
        let state = self.state.read().await;
        Ok(state.lends.get(&normalize_address(lender)).cloned())
    }

    async fn create_lend(&self, lend: &Lend) -> ReconcileResult<bool> {
        let mut state = self.state.write().await;
        Ok(insert_absent(
            &mut state.lends,
            normalize_address(&lend.user_address),
            lend,
        ))
    }

    async fn update_lend(&self, lend: &Lend) -> ReconcileResult<()> {
        let mut state = self.state.write().await;
        replace_existing(
            &mut state.lends,
            "Lend",
            normalize_address(&lend.user_address),
            lend,
        )
    }

    async fn list_lends(&self) -> ReconcileResult<Vec<Lend>> {
        let state = self.state.read().await;
        Ok(state.lends.values().cloned().collect())
    }

    async fn find_loan(&self, loan_id: &str) -> ReconcileResult<Option<Loan>> {
        let state = self.state.read().await;
        Ok(state.loans.get(&loan_id.to_lowercase()).cloned())
    }

    async fn create_loan(&self, loan: &Loan) -> ReconcileResult<bool> {
        let mut state = self.state.write().await;
        Ok(insert_absent(
            &mut state.loans,
            loan.loan_id.to_lowercase(),
            loan,
        ))
    }

    async fn update_loan(&self, loan: &Loan) -> ReconcileResult<()> {
        let mut state = self.state.write().await;
        replace_existing(&mut state.loans, "Loan", loan.loan_id.to_lowercase(), loan)
    }

    async fn list_loans(&self) -> ReconcileResult<Vec<Loan>> {
        let state = self.state.read().await;
        Ok(state.loans.values().cloned().collect())
    }

    async fn loans_by_borrower(&self, borrower: &str) -> ReconcileResult<Vec<Loan>> {
        let borrower = normalize_address(borrower);
        let state = self.state.read().await;
        Ok(state
            .loans
            .values()
            .filter(|l| l.user_address == borrower)
            .cloned()
            .collect())
    }

    async fn find_payment(&self, payment_key: &str) -> ReconcileResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state.payments.get(payment_key).cloned())
    }

    async fn create_payment(&self, payment: &Payment) -> ReconcileResult<bool> {
        let mut state = self.state.write().await;
        Ok(insert_absent(
            &mut state.payments,
            payment.payment_key.clone(),
            payment,
        ))
    }

    async fn update_payment(&self, payment: &Payment) -> ReconcileResult<()> {
        let mut state = self.state.write().await;
        replace_existing(
            &mut state.payments,
            "Payment",
            payment.payment_key.clone(),
            payment,
        )
    }

    async fn payments_for_loan(&self, loan_id: &str) -> ReconcileResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.loan_id.eq_ignore_ascii_case(loan_id))
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.payment_time);
        Ok(payments)
    }

    async fn create_notification(&self, notification: &Notification) -> ReconcileResult<bool> {
        let mut state = self.state.write().await;
        Ok(insert_absent(
            &mut state.notifications,
            notification.key.clone(),
            notification,
        ))
    }

    async fn list_notifications(&self) -> ReconcileResult<Vec<Notification>> {
        let state = self.state.read().await;
        Ok(state.notifications.values().cloned().collect())
    }

    async fn load_cursor(&self, contract_address: &str) -> ReconcileResult<Option<IndexerCursor>> {
        let state = self.state.read().await;
        Ok(state.cursors.get(&contract_address.to_lowercase()).cloned())
    }

    async fn save_cursor(&self, cursor: &IndexerCursor) -> ReconcileResult<()> {
        let mut state = self.state.write().await;
        state
            .cursors
            .insert(cursor.contract_address.to_lowercase(), cursor.clone());
        Ok(())
    }

    async fn try_acquire_writer_lock(&self) -> ReconcileResult<bool> {
        // A memory store is private to its process
        Ok(true)
    }

    async fn ping(&self) -> ReconcileResult<()> {
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }
}
