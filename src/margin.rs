//! Margin calculation: the pure core of the engine.
//!
//! Initial margin is locked to open a position and equals notional divided
//! by leverage. Maintenance margin is the equity floor below which the
//! position is forcibly closed, a fixed rate of the entry notional.
//!
//! Nothing here does I/O. Every function is deterministic given its inputs,
//! which is what lets the scanner's evaluation step be tested without timers.

use crate::types::{Leverage, Price, Quote, Side};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Everything derived at open time. Rounded, so it can be persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginRequirement {
    pub notional: Quote,
    pub initial: Quote,
    pub maintenance: Quote,
    pub liquidation_price: Price,
}

/// Saturates instead of overflowing. open paths go through `checked_notional` first,
/// so only out-of-range marks against an accepted position can reach the bound.
pub fn notional_value(size: Decimal, price: Price) -> Quote {
    Quote::new(size.abs().saturating_mul(price.value()))
}

/// `None` when size * price does not fit in a Decimal.
pub fn checked_notional(size: Decimal, price: Price) -> Option<Quote> {
    size.abs().checked_mul(price.value()).map(Quote::new)
}

pub fn margin_required(notional: Quote, leverage: Leverage) -> Quote {
    Quote::new(notional.value() / leverage.as_decimal())
}

/// Futures variant: margin is a contract-defined fraction of notional.
pub fn margin_required_for_ratio(notional: Quote, margin_ratio: Decimal) -> Quote {
    Quote::new(notional.value().saturating_mul(margin_ratio))
}

pub fn maintenance_margin(notional: Quote, maintenance_margin_rate: Decimal) -> Quote {
    Quote::new(notional.value().saturating_mul(maintenance_margin_rate))
}

pub fn liquidation_price(
    side: Side,
    entry_price: Price,
    leverage: Leverage,
    maintenance_margin_rate: Decimal,
) -> Price {
    liquidation_price_for_fraction(
        side,
        entry_price,
        leverage.initial_margin_fraction(),
        maintenance_margin_rate,
    )
}

/// Liquidation price for an arbitrary initial margin fraction.
/// long: entry * (1 - imf + mmr), short: entry * (1 + imf - mmr)
pub fn liquidation_price_for_fraction(
    side: Side,
    entry_price: Price,
    initial_margin_fraction: Decimal,
    maintenance_margin_rate: Decimal,
) -> Price {
    let liq_price = match side {
        Side::Long => {
            entry_price
                .value()
                .saturating_mul(Decimal::ONE - initial_margin_fraction + maintenance_margin_rate)
        }
        Side::Short => {
            entry_price
                .value()
                .saturating_mul(Decimal::ONE + initial_margin_fraction - maintenance_margin_rate)
        }
    };

    Price::new_unchecked(liq_price.max(dec!(0.00000001)))
}

// 3.1: long: (current - entry) * size, short: (entry - current) * size
pub fn pnl(side: Side, entry_price: Price, size: Decimal, current_price: Price) -> Quote {
    let per_unit = current_price.value() - entry_price.value();
    Quote::new((side.sign() * per_unit).saturating_mul(size.abs()))
}

/// (margin + pnl) / notional. a flat book has no ratio to speak of, so it reads as infinitely safe.
pub fn margin_ratio(margin_used: Quote, unrealized_pnl: Quote, notional: Quote) -> Decimal {
    if notional.value().is_zero() {
        return Decimal::MAX;
    }
    saturating_div(margin_used.add(unrealized_pnl).value(), notional.value())
}

/// Maintenance margin expressed as a ratio of the entry notional.
pub fn maintenance_threshold(maintenance: Quote, entry_notional: Quote) -> Decimal {
    if entry_notional.value().is_zero() {
        return Decimal::ZERO;
    }
    saturating_div(maintenance.value(), entry_notional.value())
}

/// Division for ratios against a non-zero denominator. an out-of-range quotient pins to the
/// bound with the quotient's sign.
pub fn saturating_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    numerator.checked_div(denominator).unwrap_or_else(|| {
        if numerator.is_sign_negative() != denominator.is_sign_negative() {
            Decimal::MIN
        } else {
            Decimal::MAX
        }
    })
}

/// Display leverage for contract-margined positions: floor(notional / margin), never below 1x.
pub fn derived_leverage(notional: Quote, margin: Quote) -> Leverage {
    let raw = if margin.value() > Decimal::ZERO {
        (notional.value() / margin.value()).floor()
    } else {
        Decimal::ONE
    };
    raw.to_u32().and_then(Leverage::new).unwrap_or(Leverage::ONE)
}

/// Requirement for a leverage-margined position.
pub fn calculate_margin_requirement(
    side: Side,
    size: Decimal,
    entry_price: Price,
    leverage: Leverage,
    maintenance_margin_rate: Decimal,
) -> MarginRequirement {
    let notional = notional_value(size, entry_price);
    MarginRequirement {
        notional: notional.rounded(),
        initial: margin_required(notional, leverage).rounded(),
        maintenance: maintenance_margin(notional, maintenance_margin_rate).rounded(),
        liquidation_price: liquidation_price(side, entry_price, leverage, maintenance_margin_rate)
            .rounded(),
    }
}

/// Requirement for a contract-margined position.
pub fn calculate_contract_requirement(
    side: Side,
    size: Decimal,
    entry_price: Price,
    margin_ratio: Decimal,
    maintenance_margin_rate: Decimal,
) -> MarginRequirement {
    let notional = notional_value(size, entry_price);
    MarginRequirement {
        notional: notional.rounded(),
        initial: margin_required_for_ratio(notional, margin_ratio).rounded(),
        maintenance: maintenance_margin(notional, maintenance_margin_rate).rounded(),
        liquidation_price: liquidation_price_for_fraction(
            side,
            entry_price,
            margin_ratio,
            maintenance_margin_rate,
        )
        .rounded(),
    }
}
