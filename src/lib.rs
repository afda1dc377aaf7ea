//! BitMor reconciliation server library
//!
//! Keeps the off-chain lending ledger (lender allowances, loans, payments)
//! consistent with the lending-pool contract, and exposes the allocation
//! engine and financial kernel used to quote and fund loans.

pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod finance;
pub mod indexer;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
