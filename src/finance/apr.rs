//! Implied-rate solver

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::amortization::monthly_payment;
use crate::error::{ReconcileError, ReconcileResult};

/// Largest accepted gap between the computed and the target payment
pub const PAYMENT_TOLERANCE: Decimal = dec!(0.000001);

const MAX_ITERATIONS: u32 = 200;
const MIN_INTERVAL: Decimal = dec!(0.0000000000000000000001);

/// Finds the monthly rate in `[0, 1]` whose fixed payment equals
/// `target_payment` by bisection. Payment is strictly increasing in rate on
/// that interval, which is what makes bisection valid here.
pub fn solve_monthly_rate(
    target_payment: Decimal,
    term: u32,
    principal: Decimal,
) -> ReconcileResult<Decimal> {
    if principal <= Decimal::ZERO || target_payment <= Decimal::ZERO {
        return Err(ReconcileError::Validation(
            "principal and payment must be positive".to_string(),
        ));
    }

    let mut low = Decimal::ZERO;
    let mut high = Decimal::ONE;

    if target_payment <= monthly_payment(principal, low, term)? {
        return Ok(Decimal::ZERO);
    }
    if target_payment > monthly_payment(principal, high, term)? {
        return Err(ReconcileError::Validation(format!(
            "payment {} implies a monthly rate above 100%",
            target_payment
        )));
    }

    let two = dec!(2);
    for _ in 0..MAX_ITERATIONS {
        let guess = (low + high) / two;
        let guessed_payment = monthly_payment(principal, guess, term)?;

        if (guessed_payment - target_payment).abs() <= PAYMENT_TOLERANCE {
            return Ok(guess);
        }
        if guessed_payment > target_payment {
            high = guess;
        } else {
            low = guess;
        }
        if high - low < MIN_INTERVAL {
            return Ok(guess);
        }
    }

    Ok((low + high) / two)
}

/// Annualized rate in percent implied by a fixed monthly payment
pub fn calculate_apr(
    monthly_payment: Decimal,
    term: u32,
    net_loan_amount: Decimal,
) -> ReconcileResult<Decimal> {
    let rate = solve_monthly_rate(monthly_payment, term, net_loan_amount)?;
    Ok(rate * dec!(12) * dec!(100))
}
