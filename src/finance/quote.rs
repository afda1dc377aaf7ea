//! Pre-origination loan quote shown to a borrower

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::amortization::{build_schedule, AmortizationPeriod, ScheduleInput};
use super::apr::calculate_apr;
use super::{round_cents, round_usdc};
use crate::error::{ReconcileError, ReconcileResult};

/// Opening fee charged on the lender principal
pub const OPENING_FEE_RATE: Decimal = dec!(0.01);

#[derive(Debug, Clone, Deserialize)]
pub struct LoanQuoteInput {
    /// BTC the borrower wants to buy
    pub btc_amount: Decimal,
    pub btc_price: Decimal,
    pub term_months: u32,
    pub annual_rate_pct: Decimal,
    /// Split of the total computed by the contract (`computeLoanParts`)
    pub borrower_deposit: Decimal,
    pub lender_principal: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiquidationPoint {
    pub month: u32,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanQuote {
    pub loan_amount: Decimal,
    pub opening_fee: Decimal,
    pub down_payment: Decimal,
    pub upfront_payment: Decimal,
    pub principal: Decimal,
    pub monthly_payment: Decimal,
    pub total_interest: Decimal,
    pub total_payment: Decimal,
    pub apr: Decimal,
    pub annual_rate_pct: Decimal,
    pub term_months: u32,
    pub schedule: Vec<AmortizationPeriod>,
    pub liquidation_chart: Vec<LiquidationPoint>,
    pub initial_btc_collateral: Decimal,
    pub btc_price: Decimal,
}

pub fn build_quote(input: &LoanQuoteInput) -> ReconcileResult<LoanQuote> {
    if input.btc_amount <= Decimal::ZERO || input.btc_price <= Decimal::ZERO {
        return Err(ReconcileError::Validation(
            "btc amount and price must be positive".to_string(),
        ));
    }

    let loan_amount = round_usdc(input.btc_amount * input.btc_price);
    let opening_fee = round_cents(input.lender_principal * OPENING_FEE_RATE);

    let schedule = build_schedule(&ScheduleInput {
        principal: input.lender_principal,
        annual_rate_pct: input.annual_rate_pct,
        term_months: input.term_months,
        collateral_btc: input.btc_amount,
        btc_price: input.btc_price,
    })?;

    let apr = round_cents(calculate_apr(
        schedule.monthly_payment,
        input.term_months,
        input.lender_principal,
    )?);

    let mut liquidation_chart = Vec::with_capacity(schedule.periods.len() + 1);
    liquidation_chart.push(LiquidationPoint {
        month: 0,
        price: schedule.initial_liquidation_price,
    });
    liquidation_chart.extend(schedule.periods.iter().map(|p| LiquidationPoint {
        month: p.month,
        price: p.liquidation_price,
    }));

    Ok(LoanQuote {
        loan_amount,
        opening_fee,
        down_payment: input.borrower_deposit,
        upfront_payment: input.borrower_deposit + opening_fee,
        principal: input.lender_principal,
        monthly_payment: schedule.monthly_payment,
        total_interest: schedule.total_interest,
        total_payment: schedule.total_payment,
        apr,
        annual_rate_pct: input.annual_rate_pct,
        term_months: input.term_months,
        schedule: schedule.periods,
        liquidation_chart,
        initial_btc_collateral: input.btc_amount,
        btc_price: input.btc_price,
    })
}
