//! Business logic services for the lending ledger

pub mod allowance_ledger;
mod analytics;
mod lending;
mod loans;
pub mod matching;

pub use allowance_ledger::{AllowanceLedger, BookingReport};
pub use analytics::{AnalyticsService, PoolStats};
pub use lending::LendingService;
pub use loans::LoanService;
pub use matching::{match_lenders_for_loan, MatchResult, MatchedLender};
