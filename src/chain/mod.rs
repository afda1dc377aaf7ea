//! Read/event surface of the lending-pool contract
//!
//! The reconciliation core only talks to the chain through [`ChainClient`],
//! which is constructed once in `main` and injected. Tests substitute an
//! in-memory fake.

pub mod abi;
pub mod rpc;
pub mod types;

pub use rpc::JsonRpcChainClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::ReconcileResult;

/// Contract events the engine consumes, in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Deposit,
    LoanCreated,
    Payout,
    InstallmentPaid,
    LoanLiquidated,
}

impl EventKind {
    /// Upstream state first: a loan must exist before a payout references it.
    pub const PROCESSING_ORDER: [EventKind; 5] = [
        EventKind::Deposit,
        EventKind::LoanCreated,
        EventKind::Payout,
        EventKind::InstallmentPaid,
        EventKind::LoanLiquidated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Deposit => "Deposit",
            EventKind::LoanCreated => "LoanCreated",
            EventKind::Payout => "Payout",
            EventKind::InstallmentPaid => "InstallmentPaid",
            EventKind::LoanLiquidated => "LoanLiquidated",
        }
    }

    /// keccak256 of the canonical event signature
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::Deposit => abi::DEPOSIT_TOPIC,
            EventKind::LoanCreated => abi::LOAN_CREATED_TOPIC,
            EventKind::Payout => abi::PAYOUT_TOPIC,
            EventKind::InstallmentPaid => abi::INSTALLMENT_PAID_TOPIC,
            EventKind::LoanLiquidated => abi::LOAN_LIQUIDATED_TOPIC,
        }
    }
}

/// Where an event was observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventMeta {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    /// `<tx_hash>:<log_index>`, unique per emitted log
    pub fn event_key(&self) -> String {
        format!("{}:{}", self.tx_hash, self.log_index)
    }
}

/// Decoded event arguments. Amounts are already scaled to whole tokens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventPayload {
    Deposit {
        lender: String,
        amount: Decimal,
        reinvest: bool,
    },
    LoanCreated {
        loan_id: String,
        amount: Decimal,
        collateral: Decimal,
        borrower: String,
    },
    Payout {
        loan_id: String,
        borrower: String,
        amount: Decimal,
        fully_repaid: bool,
    },
    InstallmentPaid {
        loan_id: String,
        index: u64,
    },
    LoanLiquidated {
        loan_id: String,
        borrower: String,
        btc_price: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainEvent {
    pub meta: EventMeta,
    pub payload: EventPayload,
}

impl ChainEvent {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Deposit { .. } => EventKind::Deposit,
            EventPayload::LoanCreated { .. } => EventKind::LoanCreated,
            EventPayload::Payout { .. } => EventKind::Payout,
            EventPayload::InstallmentPaid { .. } => EventKind::InstallmentPaid,
            EventPayload::LoanLiquidated { .. } => EventKind::LoanLiquidated,
        }
    }
}

/// `loans(id)` as stored by the contract
#[derive(Debug, Clone, PartialEq)]
pub struct OnChainLoan {
    pub borrower: String,
    pub principal: Decimal,
    pub borrower_deposit: Decimal,
    /// cbBTC staked as collateral
    pub collateral: Decimal,
    /// Whole percent over the full term
    pub interest_rate: Decimal,
    /// Months
    pub duration: u32,
    pub monthly_payment: Decimal,
    pub start_time: DateTime<Utc>,
    pub btc_price_at_creation: Decimal,
    pub is_active: bool,
    pub fully_repaid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnChainInstallment {
    pub due_principal: Decimal,
    pub due_interest: Decimal,
    pub due_timestamp: Option<DateTime<Utc>>,
    pub paid: bool,
}

/// One lender's share of a loan and what the contract has paid back so far
#[derive(Debug, Clone, PartialEq)]
pub struct OnChainContribution {
    pub lender: String,
    pub amount: Decimal,
    pub receivable_interest: Decimal,
    pub repaid_principal: Decimal,
    pub repaid_interest: Decimal,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block
    async fn block_number(&self) -> ReconcileResult<u64>;

    /// Events of one kind in `[from_block, to_block]`, ordered by block then
    /// log index
    async fn events(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> ReconcileResult<Vec<ChainEvent>>;

    async fn loan(&self, loan_id: &str) -> ReconcileResult<OnChainLoan>;

    async fn installment_schedule(&self, loan_id: &str)
        -> ReconcileResult<Vec<OnChainInstallment>>;

    async fn contributions(&self, loan_id: &str) -> ReconcileResult<Vec<OnChainContribution>>;

    /// Current BTC/USD
    async fn price(&self) -> ReconcileResult<Decimal>;
}
