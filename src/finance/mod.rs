//! Numeric kernel: fixed-point rounding, amortization and APR solving.
//!
//! All money is `rust_decimal::Decimal`. Binary floating point never touches a
//! monetary value.

pub mod amortization;
pub mod apr;
pub mod quote;

pub use amortization::{
    build_schedule, monthly_payment, monthly_rate, AmortizationPeriod, AmortizationSchedule,
    ScheduleInput,
};
pub use apr::{calculate_apr, solve_monthly_rate};
pub use quote::{build_quote, LoanQuote, LoanQuoteInput};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

/// Display precision for USD amounts
pub const CENT_DP: u32 = 2;
/// USDC token precision
pub const USDC_DP: u32 = 6;
/// cbBTC token precision
pub const BTC_DP: u32 = 8;

/// Fixed 30-day period used for payment dates
pub const PAYMENT_PERIOD_DAYS: i64 = 30;

/// `start` moved by whole payment periods; `None` when the date leaves
/// chrono's range.
pub fn periods_after(start: DateTime<Utc>, periods: i64) -> Option<DateTime<Utc>> {
    PAYMENT_PERIOD_DAYS
        .checked_mul(periods)
        .and_then(Duration::try_days)
        .and_then(|d| start.checked_add_signed(d))
}

pub fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CENT_DP, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_usdc(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(USDC_DP, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_btc(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(BTC_DP, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rounding_is_half_up() {
        assert_eq!(round_cents(dec!(833.335)), dec!(833.34));
        assert_eq!(round_cents(dec!(833.334)), dec!(833.33));
        assert_eq!(round_btc(dec!(0.123456785)), dec!(0.12345679));
        assert_eq!(round_usdc(dec!(1.0000005)), dec!(1.000001));
    }

    #[test]
    fn test_periods_after() {
        let start = DateTime::from_timestamp(1_767_225_600, 0).unwrap();
        assert_eq!(periods_after(start, 2), Some(start + Duration::days(60)));
        assert_eq!(periods_after(start, 4_000_000_000), None);
        assert_eq!(periods_after(start, i64::MAX), None);
    }
}
