//! Fixed-payment amortization with collateral tracking

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::{round_btc, round_cents};
use crate::error::{ReconcileError, ReconcileResult};

const MONTHS_PER_YEAR: Decimal = dec!(12);
const PERCENT: Decimal = dec!(100);

/// Monthly rate from an annual percentage (10 -> 0.008333...)
pub fn monthly_rate(annual_rate_pct: Decimal) -> Decimal {
    annual_rate_pct / PERCENT / MONTHS_PER_YEAR
}

/// `M = P·r / (1 - (1+r)^-n)`, unrounded.
///
/// `(1+r)^-n` is computed as a product of discount factors so large rates
/// underflow towards zero instead of overflowing.
pub fn monthly_payment(principal: Decimal, rate: Decimal, term: u32) -> ReconcileResult<Decimal> {
    if term == 0 {
        return Err(ReconcileError::Validation(
            "term must be at least one month".to_string(),
        ));
    }
    if rate.is_sign_negative() {
        return Err(ReconcileError::Validation(format!(
            "rate must not be negative, got {}",
            rate
        )));
    }
    if rate.is_zero() {
        return Ok(principal / Decimal::from(term));
    }

    let factor = Decimal::ONE
        .checked_div(Decimal::ONE + rate)
        .ok_or_else(|| ReconcileError::Arithmetic("discount factor overflow".to_string()))?;
    let mut discount = Decimal::ONE;
    for _ in 0..term {
        discount = discount
            .checked_mul(factor)
            .ok_or_else(|| ReconcileError::Arithmetic("discount overflow".to_string()))?;
    }

    let denominator = Decimal::ONE - discount;
    if denominator.is_zero() {
        return Ok(principal / Decimal::from(term));
    }

    principal
        .checked_mul(rate)
        .and_then(|numerator| numerator.checked_div(denominator))
        .ok_or_else(|| ReconcileError::Arithmetic("monthly payment overflow".to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInput {
    pub principal: Decimal,
    pub annual_rate_pct: Decimal,
    pub term_months: u32,
    /// BTC held as collateral at origination
    pub collateral_btc: Decimal,
    /// BTC/USD at origination
    pub btc_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmortizationPeriod {
    pub month: u32,
    pub payment: Decimal,
    pub interest: Decimal,
    pub principal: Decimal,
    pub remaining_balance: Decimal,
    pub btc_redeemed: Decimal,
    pub remaining_collateral: Decimal,
    pub liquidation_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmortizationSchedule {
    pub monthly_payment: Decimal,
    pub monthly_rate: Decimal,
    pub initial_liquidation_price: Decimal,
    pub total_interest: Decimal,
    pub total_payment: Decimal,
    pub periods: Vec<AmortizationPeriod>,
}

impl AmortizationSchedule {
    pub fn total_principal(&self) -> Decimal {
        self.periods.iter().map(|p| p.principal).sum()
    }
}

/// Builds the per-period breakdown in whole cents.
///
/// Every period pays the rounded fixed payment; the last period pays whatever
/// balance is left, so the principal column always sums to the principal.
pub fn build_schedule(input: &ScheduleInput) -> ReconcileResult<AmortizationSchedule> {
    if input.principal <= Decimal::ZERO {
        return Err(ReconcileError::Validation(format!(
            "principal must be positive, got {}",
            input.principal
        )));
    }

    let rate = monthly_rate(input.annual_rate_pct);
    let payment = round_cents(monthly_payment(input.principal, rate, input.term_months)?);

    let initial_liquidation_price = if input.collateral_btc > Decimal::ZERO {
        round_cents(input.principal / input.collateral_btc)
    } else {
        Decimal::ZERO
    };

    let mut balance = input.principal;
    let mut collateral = input.collateral_btc;
    let mut total_interest = Decimal::ZERO;
    let mut total_payment = Decimal::ZERO;
    let mut periods = Vec::with_capacity(input.term_months as usize);

    for month in 1..=input.term_months {
        let interest = round_cents(balance * rate);
        let principal = if month == input.term_months {
            balance
        } else {
            (payment - interest).max(Decimal::ZERO).min(balance)
        };

        balance -= principal;
        total_interest += interest;
        total_payment += principal + interest;

        let btc_redeemed = if input.btc_price > Decimal::ZERO {
            round_btc(principal / input.btc_price)
        } else {
            Decimal::ZERO
        };
        collateral = (collateral - btc_redeemed).max(Decimal::ZERO);

        let liquidation_price = if collateral > Decimal::ZERO {
            round_cents(balance / collateral)
        } else {
            Decimal::ZERO
        };

        periods.push(AmortizationPeriod {
            month,
            payment: principal + interest,
            interest,
            principal,
            remaining_balance: balance,
            btc_redeemed,
            remaining_collateral: collateral,
            liquidation_price,
        });
    }

    Ok(AmortizationSchedule {
        monthly_payment: payment,
        monthly_rate: rate,
        initial_liquidation_price,
        total_interest,
        total_payment,
        periods,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_is_straight_line() {
        let payment = monthly_payment(dec!(1200), Decimal::ZERO, 12).unwrap();
        assert_eq!(payment, dec!(100));
    }

    #[test]
    fn test_zero_term_rejected() {
        assert!(monthly_payment(dec!(1200), dec!(0.01), 0).is_err());
    }

    #[test]
    fn test_non_positive_principal_rejected() {
        let input = ScheduleInput {
            principal: Decimal::ZERO,
            annual_rate_pct: dec!(10),
            term_months: 12,
            collateral_btc: dec!(1),
            btc_price: dec!(100000),
        };
        assert!(build_schedule(&input).is_err());
    }

    #[test]
    fn test_large_rate_does_not_overflow() {
        let payment = monthly_payment(dec!(100000), Decimal::ONE, 360).unwrap();
        // At 100% a month the payment converges to P·r
        assert!((payment - dec!(100000)).abs() < dec!(0.000001));
    }
}
