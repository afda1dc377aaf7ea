//! Reconciliation Tests
//!
//! Drives the orchestrator end to end against the in-memory store and a
//! scripted chain, checking that replays are no-ops, that one bad event does
//! not stop the others and that the cursor only moves past clean ranges.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use bitmor_server::chain::{
    ChainClient, ChainEvent, EventKind, EventMeta, EventPayload, OnChainContribution,
    OnChainInstallment, OnChainLoan,
};
use bitmor_server::config::{IndexerConfig, MonitorConfig};
use bitmor_server::error::{ReconcileError, ReconcileResult};
use bitmor_server::indexer::{LoanMonitor, ReconciliationService};
use bitmor_server::models::{
    IndexerCursor, Lend, Loan, Notification, NotificationKind, Payment, User,
};
use bitmor_server::routes;
use bitmor_server::services::LoanService;
use bitmor_server::state::AppState;
use bitmor_server::store::{LedgerStore, MemoryStore, StoreBackend};

const CONTRACT: &str = "0x00000000000000000000000000000000000000c0";
const LENDER_1: &str = "0x1111111111111111111111111111111111111111";
const LENDER_2: &str = "0x2222222222222222222222222222222222222222";
const BORROWER: &str = "0x4444444444444444444444444444444444444444";
const LOAN_A: &str = "0x00000000000000000000000000000000000000000000000000000000000000aa";
const LOAN_B: &str = "0x00000000000000000000000000000000000000000000000000000000000000bb";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

// ============================================================================
// Scripted Chain
// ============================================================================

#[derive(Default)]
struct FakeChain {
    head: Mutex<u64>,
    events: Mutex<Vec<ChainEvent>>,
    loans: Mutex<HashMap<String, OnChainLoan>>,
    schedules: Mutex<HashMap<String, Vec<OnChainInstallment>>>,
    contributions: Mutex<HashMap<String, Vec<OnChainContribution>>>,
    /// Loan id -> whether the injected failure is transient
    failing: Mutex<HashMap<String, bool>>,
    /// Schedule reads left to time out
    schedule_timeouts: Mutex<u32>,
}

impl FakeChain {
    fn new(head: u64) -> Self {
        let chain = Self::default();
        *chain.head.lock().unwrap() = head;
        chain
    }

    fn push(&self, block: u64, log_index: u64, payload: EventPayload) {
        self.events.lock().unwrap().push(ChainEvent {
            meta: EventMeta {
                tx_hash: format!("0x{:064x}", block * 1000 + log_index),
                log_index,
                block_number: block,
                timestamp: t0() + Duration::hours(block as i64),
            },
            payload,
        });
    }

    fn deposit(&self, block: u64, lender: &str, amount: Decimal) {
        self.push(
            block,
            0,
            EventPayload::Deposit {
                lender: lender.to_string(),
                amount,
                reinvest: false,
            },
        );
    }

    /// A 12-month loan funded 60/40 by the two lenders
    fn open_loan(&self, block: u64, loan_id: &str, principal: Decimal) {
        let l1 = principal * dec!(0.6);
        let l2 = principal - l1;
        self.loans.lock().unwrap().insert(
            loan_id.to_string(),
            OnChainLoan {
                borrower: BORROWER.to_string(),
                principal,
                borrower_deposit: principal / dec!(4),
                collateral: dec!(0.75),
                interest_rate: dec!(10),
                duration: 12,
                monthly_payment: dec!(4583.33),
                start_time: t0(),
                btc_price_at_creation: dec!(100000),
                is_active: true,
                fully_repaid: false,
            },
        );
        let installment = OnChainInstallment {
            due_principal: principal / dec!(12),
            due_interest: principal / dec!(120),
            due_timestamp: None,
            paid: false,
        };
        self.schedules
            .lock()
            .unwrap()
            .insert(loan_id.to_string(), vec![installment; 12]);
        self.contributions.lock().unwrap().insert(
            loan_id.to_string(),
            vec![
                contribution(LENDER_1, l1, Decimal::ZERO, Decimal::ZERO),
                contribution(LENDER_2, l2, Decimal::ZERO, Decimal::ZERO),
            ],
        );
        self.push(
            block,
            1,
            EventPayload::LoanCreated {
                loan_id: loan_id.to_string(),
                amount: principal,
                collateral: dec!(0.75),
                borrower: BORROWER.to_string(),
            },
        );
    }

    fn repay(&self, loan_id: &str, repaid: [(Decimal, Decimal); 2]) {
        let mut contributions = self.contributions.lock().unwrap();
        if let Some(list) = contributions.get_mut(loan_id) {
            for (c, (principal, interest)) in list.iter_mut().zip(repaid) {
                c.repaid_principal = principal;
                c.repaid_interest = interest;
            }
        }
    }

    fn mark_paid(&self, loan_id: &str, index: usize) {
        if let Some(schedule) = self.schedules.lock().unwrap().get_mut(loan_id) {
            schedule[index].paid = true;
        }
    }

    fn fail_loan(&self, loan_id: &str, transient: bool) {
        self.failing
            .lock()
            .unwrap()
            .insert(loan_id.to_string(), transient);
    }

    fn time_out_next_schedule_read(&self) {
        *self.schedule_timeouts.lock().unwrap() += 1;
    }

    fn set_duration(&self, loan_id: &str, months: u32) {
        if let Some(loan) = self.loans.lock().unwrap().get_mut(loan_id) {
            loan.duration = months;
        }
    }

    fn heal_loan(&self, loan_id: &str) {
        self.failing.lock().unwrap().remove(loan_id);
    }

    fn check(&self, loan_id: &str) -> ReconcileResult<()> {
        match self.failing.lock().unwrap().get(loan_id) {
            Some(true) => Err(ReconcileError::Rpc("connection reset".to_string())),
            Some(false) => Err(ReconcileError::Decode("short return data".to_string())),
            None => Ok(()),
        }
    }
}

fn contribution(
    lender: &str,
    amount: Decimal,
    repaid_principal: Decimal,
    repaid_interest: Decimal,
) -> OnChainContribution {
    OnChainContribution {
        lender: lender.to_string(),
        amount,
        receivable_interest: amount / dec!(10),
        repaid_principal,
        repaid_interest,
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn block_number(&self) -> ReconcileResult<u64> {
        Ok(*self.head.lock().unwrap())
    }

    async fn events(&self, kind: EventKind, from: u64, to: u64) -> ReconcileResult<Vec<ChainEvent>> {
        let mut events: Vec<ChainEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .filter(|e| e.meta.block_number >= from && e.meta.block_number <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));
        Ok(events)
    }

    async fn loan(&self, loan_id: &str) -> ReconcileResult<OnChainLoan> {
        self.check(loan_id)?;
        self.loans
            .lock()
            .unwrap()
            .get(loan_id)
            .cloned()
            .ok_or_else(|| ReconcileError::not_found("Loan", loan_id))
    }

    async fn installment_schedule(&self, loan_id: &str) -> ReconcileResult<Vec<OnChainInstallment>> {
        self.check(loan_id)?;
        {
            let mut timeouts = self.schedule_timeouts.lock().unwrap();
            if *timeouts > 0 {
                *timeouts -= 1;
                return Err(ReconcileError::Timeout("eth_call".to_string()));
            }
        }
        Ok(self
            .schedules
            .lock()
            .unwrap()
            .get(loan_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn contributions(&self, loan_id: &str) -> ReconcileResult<Vec<OnChainContribution>> {
        self.check(loan_id)?;
        Ok(self
            .contributions
            .lock()
            .unwrap()
            .get(loan_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn price(&self) -> ReconcileResult<Decimal> {
        Ok(dec!(100000))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    chain: Arc<FakeChain>,
    service: Arc<ReconciliationService>,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    for address in [LENDER_1, LENDER_2, BORROWER] {
        store.create_user(&User::new(address)).await.unwrap();
    }
    let chain = Arc::new(FakeChain::new(100));
    let service = Arc::new(ReconciliationService::new(
        store.clone(),
        chain.clone(),
        IndexerConfig::new(CONTRACT),
    ));
    Harness {
        store,
        chain,
        service,
    }
}

// ============================================================================
// Store With Injected Write Failures
// ============================================================================

/// Memory store whose next write to a chosen lend or loan fails once
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_lend: Mutex<Option<String>>,
    fail_loan: Mutex<Option<String>>,
}

impl FlakyStore {
    fn fail_next_lend_write(&self, lender: &str) {
        *self.fail_lend.lock().unwrap() = Some(lender.to_string());
    }

    fn fail_next_loan_write(&self, loan_id: &str) {
        *self.fail_loan.lock().unwrap() = Some(loan_id.to_string());
    }
}

fn trip(armed: &Mutex<Option<String>>, key: &str) -> ReconcileResult<()> {
    let mut armed = armed.lock().unwrap();
    if armed.as_deref() == Some(key) {
        *armed = None;
        return Err(ReconcileError::Database("connection closed".to_string()));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn find_user(&self, address: &str) -> ReconcileResult<Option<User>> {
        self.inner.find_user(address).await
    }
    async fn create_user(&self, user: &User) -> ReconcileResult<bool> {
        self.inner.create_user(user).await
    }
    async fn update_user(&self, user: &User) -> ReconcileResult<()> {
        self.inner.update_user(user).await
    }

    async fn find_lend(&self, lender: &str) -> ReconcileResult<Option<Lend>> {
        self.inner.find_lend(lender).await
    }
    async fn create_lend(&self, lend: &Lend) -> ReconcileResult<bool> {
        self.inner.create_lend(lend).await
    }
    async fn update_lend(&self, lend: &Lend) -> ReconcileResult<()> {
        trip(&self.fail_lend, &lend.user_address)?;
        self.inner.update_lend(lend).await
    }
    async fn list_lends(&self) -> ReconcileResult<Vec<Lend>> {
        self.inner.list_lends().await
    }

    async fn find_loan(&self, loan_id: &str) -> ReconcileResult<Option<Loan>> {
        self.inner.find_loan(loan_id).await
    }
    async fn create_loan(&self, loan: &Loan) -> ReconcileResult<bool> {
        self.inner.create_loan(loan).await
    }
    async fn update_loan(&self, loan: &Loan) -> ReconcileResult<()> {
        trip(&self.fail_loan, &loan.loan_id)?;
        self.inner.update_loan(loan).await
    }
    async fn list_loans(&self) -> ReconcileResult<Vec<Loan>> {
        self.inner.list_loans().await
    }
    async fn loans_by_borrower(&self, borrower: &str) -> ReconcileResult<Vec<Loan>> {
        self.inner.loans_by_borrower(borrower).await
    }

    async fn find_payment(&self, payment_key: &str) -> ReconcileResult<Option<Payment>> {
        self.inner.find_payment(payment_key).await
    }
    async fn create_payment(&self, payment: &Payment) -> ReconcileResult<bool> {
        self.inner.create_payment(payment).await
    }
    async fn update_payment(&self, payment: &Payment) -> ReconcileResult<()> {
        self.inner.update_payment(payment).await
    }
    async fn payments_for_loan(&self, loan_id: &str) -> ReconcileResult<Vec<Payment>> {
        self.inner.payments_for_loan(loan_id).await
    }

    async fn create_notification(&self, notification: &Notification) -> ReconcileResult<bool> {
        self.inner.create_notification(notification).await
    }
    async fn list_notifications(&self) -> ReconcileResult<Vec<Notification>> {
        self.inner.list_notifications().await
    }

    async fn load_cursor(&self, contract_address: &str) -> ReconcileResult<Option<IndexerCursor>> {
        self.inner.load_cursor(contract_address).await
    }
    async fn save_cursor(&self, cursor: &IndexerCursor) -> ReconcileResult<()> {
        self.inner.save_cursor(cursor).await
    }

    async fn try_acquire_writer_lock(&self) -> ReconcileResult<bool> {
        self.inner.try_acquire_writer_lock().await
    }

    async fn ping(&self) -> ReconcileResult<()> {
        self.inner.ping().await
    }

    fn backend(&self) -> StoreBackend {
        self.inner.backend()
    }
}

struct FlakyHarness {
    store: Arc<FlakyStore>,
    chain: Arc<FakeChain>,
    service: Arc<ReconciliationService>,
}

async fn flaky_harness() -> FlakyHarness {
    let store = Arc::new(FlakyStore::default());
    for address in [LENDER_1, LENDER_2, BORROWER] {
        store.create_user(&User::new(address)).await.unwrap();
    }
    let chain = Arc::new(FakeChain::new(100));
    let service = Arc::new(ReconciliationService::new(
        store.clone(),
        chain.clone(),
        IndexerConfig::new(CONTRACT),
    ));
    FlakyHarness {
        store,
        chain,
        service,
    }
}

async fn notifications_of(store: &MemoryStore, kind: NotificationKind) -> usize {
    store
        .list_notifications()
        .await
        .unwrap()
        .iter()
        .filter(|n| n.kind == kind)
        .count()
}

// ============================================================================
// Deposits
// ============================================================================

#[tokio::test]
async fn test_deposit_replay_books_once() {
    let h = harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));

    let first = h.service.run_tick().await.unwrap();
    let second = h.service.run_tick().await.unwrap();

    assert_eq!(first.applied, 1);
    assert_eq!(second.applied, 0);
    assert_eq!(second.duplicate, 1);

    let lend = h.store.find_lend(LENDER_1).await.unwrap().unwrap();
    assert_eq!(lend.lending_amount_approved, dec!(30000));
    assert_eq!(lend.available_amount, dec!(30000));
    assert_eq!(lend.deposits.len(), 1);
    assert!(lend.is_balanced());

    assert_eq!(
        notifications_of(&h.store, NotificationKind::DepositReceived).await,
        1
    );

    let user = h.store.find_user(LENDER_1).await.unwrap().unwrap();
    assert_eq!(user.lendings, vec![lend.id]);
    assert_eq!(user.total_capital_lent, dec!(30000));
}

#[tokio::test]
async fn test_second_deposit_tops_up() {
    let h = harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));
    h.chain.deposit(11, LENDER_1, dec!(5000));

    h.service.run_tick().await.unwrap();

    let lend = h.store.find_lend(LENDER_1).await.unwrap().unwrap();
    assert_eq!(lend.lending_amount_approved, dec!(35000));
    assert_eq!(lend.deposits.len(), 2);
}

#[tokio::test]
async fn test_deposit_from_unknown_user_skipped() {
    let h = harness().await;
    h.chain
        .deposit(10, "0x9999999999999999999999999999999999999999", dec!(100));

    let report = h.service.run_tick().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert!(h.store.list_lends().await.unwrap().is_empty());
}

// ============================================================================
// Loan Creation and Allowance Booking
// ============================================================================

#[tokio::test]
async fn test_loan_creation_books_allowances_once() {
    let h = harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));
    h.chain.deposit(11, LENDER_2, dec!(20000));
    h.chain.open_loan(20, LOAN_A, dec!(50000));

    h.service.run_tick().await.unwrap();
    let replay = h.service.run_tick().await.unwrap();
    assert_eq!(replay.applied, 0);
    assert_eq!(replay.duplicate, 3);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.allowances_updated);
    assert!(loan.is_active);
    assert_eq!(loan.loan_amount, dec!(50000));
    assert_eq!(loan.interest, dec!(5000));
    assert_eq!(loan.total_amount_payable, dec!(55000));
    assert_eq!(loan.remaining_amount, dec!(50000));
    assert_eq!(loan.lenders_remaining(), loan.remaining_amount);
    assert_eq!(loan.liquidation_factor, dec!(37500));
    assert_eq!(loan.amortization_schedule.len(), 12);
    assert_eq!(loan.next_payment_date, Some(t0() + Duration::days(30)));
    assert_eq!(loan.loan_end, t0() + Duration::days(360));

    let l1 = h.store.find_lend(LENDER_1).await.unwrap().unwrap();
    assert_eq!(l1.available_amount, Decimal::ZERO);
    assert_eq!(l1.utilised_amount, dec!(30000));
    assert_eq!(l1.loans, vec![LOAN_A.to_string()]);
    assert!(l1.is_balanced());

    let l2 = h.store.find_lend(LENDER_2).await.unwrap().unwrap();
    assert_eq!(l2.utilised_amount, dec!(20000));

    let borrower = h.store.find_user(BORROWER).await.unwrap().unwrap();
    assert_eq!(borrower.loans, vec![LOAN_A.to_string()]);
    assert_eq!(borrower.total_capital_borrowed, dec!(50000));

    assert_eq!(notifications_of(&h.store, NotificationKind::LoanOpened).await, 1);
}

#[tokio::test]
async fn test_stale_allowance_is_flagged_not_debited() {
    let h = harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));
    h.chain.deposit(11, LENDER_2, dec!(5000));
    h.chain.open_loan(20, LOAN_A, dec!(50000));

    let report = h.service.run_tick().await.unwrap();
    assert_eq!(report.failed, 0);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.allowances_updated);
    assert_eq!(loan.reconciliation_flags.len(), 1);
    assert_eq!(loan.reconciliation_flags[0].lender, LENDER_2);
    assert_eq!(loan.reconciliation_flags[0].required, dec!(20000));
    assert_eq!(loan.reconciliation_flags[0].available, dec!(5000));

    let l2 = h.store.find_lend(LENDER_2).await.unwrap().unwrap();
    assert_eq!(l2.available_amount, dec!(5000));
    assert!(l2.needs_reconciliation);
    assert!(l2.loans.is_empty());

    let l1 = h.store.find_lend(LENDER_1).await.unwrap().unwrap();
    assert_eq!(l1.utilised_amount, dec!(30000));
    assert!(!l1.needs_reconciliation);
}

#[tokio::test]
async fn test_flagged_loans_listed_for_operator() {
    let h = harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));
    h.chain.deposit(11, LENDER_2, dec!(5000));
    h.chain.open_loan(20, LOAN_A, dec!(50000));
    h.service.run_tick().await.unwrap();

    let loans = LoanService::new(h.store.clone());

    let flagged = loans.loans_needing_reconciliation().await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].loan_id, LOAN_A);

    assert_eq!(loans.loans_for_borrower(BORROWER).await.unwrap().len(), 1);
    assert!(loans.payments_for_loan(LOAN_A).await.unwrap().is_empty());

    let err = loans.get_loan(LOAN_B).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotFound { .. }));
}

#[tokio::test]
async fn test_interrupted_booking_resumes_without_double_debit() {
    let h = flaky_harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));
    h.chain.deposit(11, LENDER_2, dec!(20000));
    h.service.run_tick().await.unwrap();

    h.store.fail_next_lend_write(LENDER_2);
    h.chain.open_loan(20, LOAN_A, dec!(50000));

    let first = h.service.run_tick().await.unwrap();
    assert_eq!(first.failed, 1);
    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(!loan.allowances_updated);
    let l1 = h.store.find_lend(LENDER_1).await.unwrap().unwrap();
    assert_eq!(l1.utilised_amount, dec!(30000));

    let second = h.service.run_tick().await.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(second.applied, 1);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.allowances_updated);
    assert!(loan.reconciliation_flags.is_empty());

    for (lender, amount) in [(LENDER_1, dec!(30000)), (LENDER_2, dec!(20000))] {
        let lend = h.store.find_lend(lender).await.unwrap().unwrap();
        assert_eq!(lend.utilised_amount, amount, "{}", lender);
        assert_eq!(lend.available_amount, Decimal::ZERO, "{}", lender);
        assert_eq!(lend.loans.len(), 1, "{}", lender);
    }

    let third = h.service.run_tick().await.unwrap();
    assert_eq!(third.applied, 0);
}

#[tokio::test]
async fn test_loan_term_past_date_range_is_rejected() {
    let h = harness().await;
    h.chain.open_loan(20, LOAN_A, dec!(50000));
    h.chain.set_duration(LOAN_A, 4_000_000);
    h.chain.open_loan(21, LOAN_B, dec!(50000));

    let report = h.service.run_tick().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.cursor, Some(100));
    assert!(h.store.find_loan(LOAN_A).await.unwrap().is_none());
    assert!(h.store.find_loan(LOAN_B).await.unwrap().is_some());

    // The loop keeps running on later ticks
    assert!(h.service.run_tick().await.is_ok());
}

#[tokio::test]
async fn test_loan_for_unknown_borrower_skipped() {
    let h = harness().await;
    h.chain.open_loan(20, LOAN_A, dec!(50000));
    h.chain.push(
        21,
        0,
        EventPayload::LoanCreated {
            loan_id: LOAN_B.to_string(),
            amount: dec!(1000),
            collateral: dec!(0.01),
            borrower: "0x9999999999999999999999999999999999999999".to_string(),
        },
    );

    let report = h.service.run_tick().await.unwrap();

    assert!(h.store.find_loan(LOAN_B).await.unwrap().is_none());
    assert_eq!(report.skipped, 1);
}

// ============================================================================
// Payouts and Installments
// ============================================================================

async fn funded_loan() -> Harness {
    let h = harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));
    h.chain.deposit(11, LENDER_2, dec!(20000));
    h.chain.open_loan(20, LOAN_A, dec!(50000));
    h.service.run_tick().await.unwrap();
    h
}

fn payout(amount: Decimal, fully_repaid: bool) -> EventPayload {
    EventPayload::Payout {
        loan_id: LOAN_A.to_string(),
        borrower: BORROWER.to_string(),
        amount,
        fully_repaid,
    }
}

#[tokio::test]
async fn test_payout_moves_lender_ledgers_by_delta() {
    let h = funded_loan().await;
    h.chain
        .repay(LOAN_A, [(dec!(2500), dec!(250)), (dec!(2000), dec!(200))]);
    h.chain.mark_paid(LOAN_A, 0);
    h.chain.push(60, 0, payout(dec!(4950), false));

    h.service.run_tick().await.unwrap();
    let replay = h.service.run_tick().await.unwrap();
    assert_eq!(replay.applied, 0);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    let l1 = loan.investment(LENDER_1).unwrap();
    assert_eq!(l1.amount_received, dec!(2500));
    assert_eq!(l1.received_interest, dec!(250));
    assert_eq!(l1.total_received, dec!(2750));
    assert_eq!(l1.remaining_amount, dec!(27500));

    assert_eq!(loan.remaining_amount, dec!(45500));
    assert_eq!(loan.lenders_remaining(), loan.remaining_amount);
    assert_eq!(loan.liquidation_factor, dec!(45500));
    assert_eq!(loan.asset_remaining, dec!(0.455));
    assert_eq!(loan.paid_installments(), 1);
    assert_eq!(loan.months_not_paid, 0);

    let paid_at = t0() + Duration::hours(60);
    assert_eq!(loan.last_payment_date, paid_at);
    assert_eq!(loan.next_payment_date, Some(paid_at + Duration::days(30)));

    let payments = h.store.payments_for_loan(LOAN_A).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert!(payments[0].applied);
    assert_eq!(payments[0].total_distributed(), dec!(4950));

    let borrower = h.store.find_user(BORROWER).await.unwrap().unwrap();
    assert_eq!(borrower.payments.len(), 1);
    assert_eq!(
        notifications_of(&h.store, NotificationKind::PaymentRecorded).await,
        1
    );
}

#[tokio::test]
async fn test_consecutive_payouts_apply_only_new_repayments() {
    let h = funded_loan().await;
    h.chain
        .repay(LOAN_A, [(dec!(2500), dec!(250)), (dec!(2000), dec!(200))]);
    h.chain.push(60, 0, payout(dec!(4950), false));
    h.service.run_tick().await.unwrap();

    h.chain
        .repay(LOAN_A, [(dec!(5000), dec!(500)), (dec!(4000), dec!(400))]);
    h.chain.push(70, 0, payout(dec!(4950), false));
    h.service.run_tick().await.unwrap();

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    let l2 = loan.investment(LENDER_2).unwrap();
    assert_eq!(l2.amount_received, dec!(4000));
    assert_eq!(l2.received_interest, dec!(400));
    assert_eq!(loan.remaining_amount, dec!(41000));

    let payments = h.store.payments_for_loan(LOAN_A).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[1].distributions[1].amount, dec!(2000));
}

#[tokio::test]
async fn test_final_payout_closes_loan() {
    let h = funded_loan().await;
    h.chain
        .repay(LOAN_A, [(dec!(30000), dec!(3000)), (dec!(20000), dec!(2000))]);
    h.chain.push(60, 0, payout(dec!(55000), true));

    h.service.run_tick().await.unwrap();

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.is_repaid);
    assert!(!loan.is_active);
    assert_eq!(loan.remaining_amount, Decimal::ZERO);
    assert_eq!(loan.asset_remaining, Decimal::ZERO);
    assert_eq!(loan.next_payment_date, None);
    assert!(loan
        .receivable_amount_monthly_by_lenders
        .iter()
        .all(|r| r.remaining_amount.is_zero()));
}

#[tokio::test]
async fn test_interrupted_payout_resumes_once() {
    let h = flaky_harness().await;
    h.chain.deposit(10, LENDER_1, dec!(30000));
    h.chain.deposit(11, LENDER_2, dec!(20000));
    h.chain.open_loan(20, LOAN_A, dec!(50000));
    h.service.run_tick().await.unwrap();

    h.chain
        .repay(LOAN_A, [(dec!(2500), dec!(250)), (dec!(2000), dec!(200))]);
    h.chain.push(60, 0, payout(dec!(4950), false));
    h.store.fail_next_loan_write(LOAN_A);

    let first = h.service.run_tick().await.unwrap();
    assert_eq!(first.failed, 1);
    let stored = h.store.payments_for_loan(LOAN_A).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].applied);

    let second = h.service.run_tick().await.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(second.applied, 1);
    h.service.run_tick().await.unwrap();

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert_eq!(loan.investment(LENDER_1).unwrap().amount_received, dec!(2500));
    assert_eq!(loan.investment(LENDER_2).unwrap().amount_received, dec!(2000));
    assert_eq!(loan.remaining_amount, dec!(45500));
    assert_eq!(loan.applied_payments.len(), 1);

    let payments = h.store.payments_for_loan(LOAN_A).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert!(payments[0].applied);
    assert_eq!(payments[0].total_distributed(), dec!(4950));
}

#[tokio::test]
async fn test_resumed_payout_does_not_repeat_later_payout() {
    let h = funded_loan().await;
    // Contract figures are cumulative across both payouts
    h.chain
        .repay(LOAN_A, [(dec!(2000), dec!(200)), (dec!(1000), dec!(100))]);
    h.chain.push(60, 0, payout(dec!(1650), false));
    h.chain.push(60, 1, payout(dec!(1650), false));
    h.chain.time_out_next_schedule_read();

    let first = h.service.run_tick().await.unwrap();
    assert_eq!(first.applied, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.cursor, None);

    let second = h.service.run_tick().await.unwrap();
    assert_eq!(second.applied, 1);
    assert_eq!(second.failed, 0);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    let l1 = loan.investment(LENDER_1).unwrap();
    assert_eq!(l1.amount_received, dec!(2000));
    assert_eq!(l1.received_interest, dec!(200));
    assert_eq!(l1.remaining_amount, dec!(28000));
    assert_eq!(loan.investment(LENDER_2).unwrap().amount_received, dec!(1000));
    assert_eq!(loan.remaining_amount, dec!(47000));

    let payments = h.store.payments_for_loan(LOAN_A).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert!(payments.iter().all(|p| p.applied));
    let distributed: Decimal = payments.iter().map(|p| p.total_distributed()).sum();
    assert_eq!(distributed, dec!(3300));
}

#[tokio::test]
async fn test_payout_for_unknown_loan_skipped() {
    let h = harness().await;
    h.chain.push(60, 0, payout(dec!(100), false));

    let report = h.service.run_tick().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert!(h.store.payments_for_loan(LOAN_A).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_installment_paid_is_set_semantics() {
    let h = funded_loan().await;
    h.chain.push(
        61,
        0,
        EventPayload::InstallmentPaid {
            loan_id: LOAN_A.to_string(),
            index: 2,
        },
    );
    h.chain.push(
        62,
        0,
        EventPayload::InstallmentPaid {
            loan_id: LOAN_A.to_string(),
            index: 99,
        },
    );

    let first = h.service.run_tick().await.unwrap();
    assert_eq!(first.applied, 1);
    assert_eq!(first.skipped, 1);

    let second = h.service.run_tick().await.unwrap();
    assert_eq!(second.applied, 0);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.amortization_schedule[2].paid);
    assert_eq!(loan.paid_installments(), 1);
    // Balances only move on payouts
    assert_eq!(loan.remaining_amount, dec!(50000));
}

// ============================================================================
// Liquidation
// ============================================================================

#[tokio::test]
async fn test_liquidation_is_terminal_and_idempotent() {
    let h = funded_loan().await;
    h.chain.push(
        80,
        0,
        EventPayload::LoanLiquidated {
            loan_id: LOAN_A.to_string(),
            borrower: BORROWER.to_string(),
            btc_price: dec!(48000),
        },
    );

    let first = h.service.run_tick().await.unwrap();
    let second = h.service.run_tick().await.unwrap();
    assert_eq!(first.applied, 1);
    assert_eq!(second.applied, 0);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.is_liquidated);
    assert!(!loan.is_active);
    assert_eq!(loan.liquidation_price, Some(dec!(48000)));
    assert_eq!(
        notifications_of(&h.store, NotificationKind::LoanLiquidated).await,
        1
    );
}

#[tokio::test]
async fn test_payout_after_liquidation_keeps_loan_closed() {
    let h = funded_loan().await;
    h.chain.push(
        80,
        0,
        EventPayload::LoanLiquidated {
            loan_id: LOAN_A.to_string(),
            borrower: BORROWER.to_string(),
            btc_price: dec!(48000),
        },
    );
    h.service.run_tick().await.unwrap();

    h.chain
        .repay(LOAN_A, [(dec!(3000), Decimal::ZERO), (dec!(2000), Decimal::ZERO)]);
    h.chain.push(90, 0, payout(dec!(5000), false));
    let report = h.service.run_tick().await.unwrap();
    assert_eq!(report.applied, 1);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.is_liquidated);
    assert!(!loan.is_active);
    assert_eq!(loan.next_payment_date, None);
    assert_eq!(loan.remaining_amount, dec!(45000));
    assert_eq!(loan.liquidation_factor, dec!(45000));
}

// ============================================================================
// Failure Isolation and Cursor
// ============================================================================

#[tokio::test]
async fn test_transient_failure_isolated_and_cursor_held() {
    let h = harness().await;
    h.chain.deposit(10, LENDER_1, dec!(60000));
    h.chain.deposit(11, LENDER_2, dec!(40000));
    h.chain.open_loan(20, LOAN_A, dec!(50000));
    h.chain.open_loan(21, LOAN_B, dec!(50000));
    h.chain.fail_loan(LOAN_B, true);

    let first = h.service.run_tick().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.applied, 3);
    assert_eq!(first.cursor, None);
    assert!(h.store.find_loan(LOAN_A).await.unwrap().is_some());
    assert!(h.store.find_loan(LOAN_B).await.unwrap().is_none());

    h.chain.heal_loan(LOAN_B);
    let second = h.service.run_tick().await.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(second.applied, 1);
    assert_eq!(second.cursor, Some(100));

    let l1 = h.store.find_lend(LENDER_1).await.unwrap().unwrap();
    assert_eq!(l1.utilised_amount, dec!(60000));
    assert_eq!(l1.loans.len(), 2);
}

#[tokio::test]
async fn test_permanent_failure_does_not_block_cursor() {
    let h = harness().await;
    h.chain.open_loan(20, LOAN_A, dec!(50000));
    h.chain.fail_loan(LOAN_A, false);

    let report = h.service.run_tick().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.cursor, Some(100));
    let cursor = h.store.load_cursor(CONTRACT).await.unwrap().unwrap();
    assert_eq!(cursor.last_processed_block, 100);
}

#[tokio::test]
async fn test_cursor_catches_up_after_downtime() {
    let h = harness().await;
    h.service.run_tick().await.unwrap();

    *h.chain.head.lock().unwrap() = 1_000;
    h.chain.deposit(150, LENDER_1, dec!(1000));

    let report = h.service.run_tick().await.unwrap();

    assert_eq!(report.from_block, Some(101));
    assert_eq!(report.cursor, Some(1_000));
    assert_eq!(report.applied, 1);
    assert_eq!(
        h.service.last_report().await.unwrap().cursor,
        Some(1_000)
    );
}

// ============================================================================
// Loan Monitor
// ============================================================================

#[tokio::test]
async fn test_monitor_sends_one_reminder_per_due_date() {
    let h = funded_loan().await;
    let monitor = LoanMonitor::new(
        h.store.clone(),
        MonitorConfig::default(),
        h.service.write_gate(),
    );
    let due = t0() + Duration::days(30);

    let early = monitor.run_once(due - Duration::days(10)).await.unwrap();
    assert_eq!(early.reminders, 0);

    let first = monitor.run_once(due - Duration::days(2)).await.unwrap();
    let again = monitor.run_once(due - Duration::days(1)).await.unwrap();
    assert_eq!(first.reminders, 1);
    assert_eq!(again.reminders, 0);
    assert_eq!(
        notifications_of(&h.store, NotificationKind::PaymentReminder).await,
        1
    );
}

#[tokio::test]
async fn test_monitor_defaults_after_missed_periods() {
    let h = funded_loan().await;
    let monitor = LoanMonitor::new(
        h.store.clone(),
        MonitorConfig::default(),
        h.service.write_gate(),
    );
    let due = t0() + Duration::days(30);

    let late = monitor.run_once(due + Duration::days(35)).await.unwrap();
    assert!(late.defaulted.is_empty());
    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert_eq!(loan.months_not_paid, 2);

    let report = monitor.run_once(due + Duration::days(61)).await.unwrap();
    assert_eq!(report.defaulted, vec![LOAN_A.to_string()]);

    let loan = h.store.find_loan(LOAN_A).await.unwrap().unwrap();
    assert!(loan.is_defaulted);
    assert!(!loan.is_active);
    assert_eq!(
        notifications_of(&h.store, NotificationKind::LoanDefaulted).await,
        1
    );

    // Terminal loans are left alone
    let after = monitor.run_once(due + Duration::days(200)).await.unwrap();
    assert_eq!(after.checked, 0);
}

// ============================================================================
// Operational Endpoints
// ============================================================================

#[tokio::test]
async fn test_health_and_status_endpoints() {
    let h = funded_loan().await;
    let app = routes::router(AppState::new(h.store.clone(), h.service.clone()));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["store"], "memory");

    let response = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["last_tick"]["cursor"], 100);
    assert_eq!(status["pool"]["active_loans"], 1);
}
