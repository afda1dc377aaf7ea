//! Greedy lender matching over available allowances
//!
//! Pure function: it proposes `(lender, amount)` pairs and never mutates an
//! allowance. Booking happens later, from the contributions the contract
//! actually recorded.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use uuid::Uuid;

use crate::models::Lend;

/// Largest shortfall treated as a rounding residue rather than missing
/// liquidity
pub const ROUNDING_TOLERANCE: Decimal = dec!(0.01);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedLender {
    pub lender_address: String,
    pub lender_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub success: bool,
    pub lenders: Vec<MatchedLender>,
    pub total_matched: Decimal,
}

impl MatchResult {
    pub fn sum(&self) -> Decimal {
        self.lenders.iter().map(|l| l.amount).sum()
    }
}

/// Splits `loan_amount` across allowances.
///
/// 1. Preference pass: allowances whose duration preference admits
///    `duration_months` (0 admits everything), in the order given.
/// 2. Fallback pass: every allowance not matched yet, preference ignored.
/// 3. A leftover no larger than [`ROUNDING_TOLERANCE`] is added to the first
///    matched lender instead of failing the match, but only while the
///    allowances together hold at least `loan_amount`. This tilts the first
///    lender's share slightly; it is a product policy, kept on purpose. A
///    real shortfall, however small, fails.
///
/// `_interest_rate` is part of the matching request but does not influence
/// the allocation.
pub fn match_lenders_for_loan(
    allowances: &[Lend],
    loan_amount: Decimal,
    _interest_rate: Decimal,
    duration_months: u32,
) -> MatchResult {
    let mut remaining = loan_amount;
    let mut lenders: Vec<MatchedLender> = Vec::new();

    if loan_amount <= Decimal::ZERO {
        return MatchResult {
            success: false,
            lenders,
            total_matched: Decimal::ZERO,
        };
    }

    for allowance in allowances {
        if remaining <= Decimal::ZERO {
            break;
        }
        if allowance.available_amount <= Decimal::ZERO {
            continue;
        }
        if !allowance.admits_duration(duration_months) {
            continue;
        }
        remaining -= take(allowance, remaining, &mut lenders);
    }

    if remaining > Decimal::ZERO {
        for allowance in allowances {
            if remaining <= Decimal::ZERO {
                break;
            }
            if lenders
                .iter()
                .any(|l| l.lender_address == allowance.user_address)
            {
                continue;
            }
            if allowance.available_amount <= Decimal::ZERO {
                continue;
            }
            remaining -= take(allowance, remaining, &mut lenders);
        }
    }

    let total_available: Decimal = allowances
        .iter()
        .map(|a| a.available_amount.max(Decimal::ZERO))
        .sum();
    if remaining > Decimal::ZERO
        && remaining <= ROUNDING_TOLERANCE
        && total_available >= loan_amount
    {
        if let Some(first) = lenders.first_mut() {
            first.amount += remaining;
            remaining = Decimal::ZERO;
        }
    }

    let total_matched: Decimal = lenders.iter().map(|l| l.amount).sum();
    let success = remaining <= Decimal::ZERO;

    tracing::debug!(
        loan_amount = %loan_amount,
        total_matched = %total_matched,
        lenders = lenders.len(),
        success,
        "Lender matching finished"
    );

    MatchResult {
        success,
        lenders,
        total_matched,
    }
}

fn take(allowance: &Lend, remaining: Decimal, lenders: &mut Vec<MatchedLender>) -> Decimal {
    let contribution = allowance.available_amount.min(remaining);
    lenders.push(MatchedLender {
        lender_address: allowance.user_address.clone(),
        lender_id: allowance.id,
        amount: contribution,
    });
    contribution
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn allowance(address: &str, available: Decimal, pref: u32) -> Lend {
        Lend::new(address, available, pref, Utc::now())
    }

    #[test]
    fn test_preference_pass_comes_first() {
        let allowances = vec![
            allowance("0xshort", dec!(100), 3),
            allowance("0xlong", dec!(100), 24),
        ];
        let result = match_lenders_for_loan(&allowances, dec!(100), dec!(10), 12);
        assert!(result.success);
        assert_eq!(result.lenders.len(), 1);
        assert_eq!(result.lenders[0].lender_address, "0xlong");
    }

    #[test]
    fn test_fallback_ignores_preference() {
        let allowances = vec![
            allowance("0xshort", dec!(100), 3),
            allowance("0xlong", dec!(50), 24),
        ];
        let result = match_lenders_for_loan(&allowances, dec!(120), dec!(10), 12);
        assert!(result.success);
        assert_eq!(result.lenders[0].lender_address, "0xlong");
        assert_eq!(result.lenders[0].amount, dec!(50));
        assert_eq!(result.lenders[1].lender_address, "0xshort");
        assert_eq!(result.lenders[1].amount, dec!(70));
    }

    #[test]
    fn test_sub_cent_shortfall_is_insufficient() {
        let allowances = vec![
            allowance("0xa", dec!(60), 0),
            allowance("0xb", dec!(39.995), 0),
        ];
        let result = match_lenders_for_loan(&allowances, dec!(100), dec!(10), 12);
        assert!(!result.success);
        assert_eq!(result.sum(), dec!(99.995));
    }

    #[test]
    fn test_zero_amount_fails() {
        let allowances = vec![allowance("0xa", dec!(60), 0)];
        let result = match_lenders_for_loan(&allowances, Decimal::ZERO, dec!(10), 12);
        assert!(!result.success);
        assert!(result.lenders.is_empty());
    }
}
