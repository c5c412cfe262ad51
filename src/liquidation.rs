//! Liquidation conditions and settlement arithmetic.
//!
//! A position is liquidatable once its equity (margin + unrealized PnL) has
//! fallen to or below its maintenance margin. Both sides of that comparison are
//! expressed on the entry notional, so the trigger fires exactly at the
//! recorded liquidation price.
//!
//! Settlement computes what goes back to the user. Payouts are floored at zero;
//! any deficit is reported as a shortfall for manual review, never charged to
//! unrelated balances.

use crate::margin;
use crate::position::Position;
use crate::types::{Bps, Price, Quote};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationParams {
    /// Fee charged on the notional at the liquidation mark.
    pub fee: Bps,
    /// Equity below `at_risk_buffer * maintenance` is reported as at risk.
    pub at_risk_buffer: Decimal,
}

impl Default for LiquidationParams {
    fn default() -> Self {
        Self {
            fee: Bps::new(50),
            at_risk_buffer: dec!(1.2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskStatus {
    Safe,
    AtRisk,
    Liquidatable,
}

/// Point-in-time view of one position against a mark price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub mark_price: Price,
    pub unrealized_pnl: Quote,
    pub equity: Quote,
    /// Equity over notional at the mark. reported, not used for the trigger.
    pub margin_ratio: Decimal,
    /// Equity over entry notional. this is what the trigger compares.
    pub equity_ratio: Decimal,
    pub threshold: Decimal,
    pub status: RiskStatus,
}

pub fn assess_position(position: &Position, mark: Price, params: &LiquidationParams) -> Assessment {
    let unrealized_pnl = position.pnl_at(mark);
    let equity = position.margin_required.add(unrealized_pnl);
    let notional_at_mark = position.notional_at(mark);

    let margin_ratio = margin::margin_ratio(position.margin_required, unrealized_pnl, notional_at_mark);
    let entry_notional = position.entry_notional();
    let equity_ratio = if entry_notional.is_zero() {
        Decimal::MAX
    } else {
        margin::saturating_div(equity.value(), entry_notional.value())
    };

    Assessment {
        mark_price: mark,
        unrealized_pnl,
        equity,
        margin_ratio,
        equity_ratio,
        threshold: position.maintenance_threshold(),
        status: classify(equity, position.maintenance_margin, params.at_risk_buffer),
    }
}

fn classify(equity: Quote, maintenance: Quote, at_risk_buffer: Decimal) -> RiskStatus {
    if equity <= maintenance {
        RiskStatus::Liquidatable
    } else if equity < maintenance.mul(at_risk_buffer) {
        RiskStatus::AtRisk
    } else {
        RiskStatus::Safe
    }
}

pub fn liquidation_fee(notional: Quote, fee: Bps) -> Quote {
    notional.mul(fee.as_fraction())
}

/// Amounts produced by taking a position to a terminal state. all rounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub exit_price: Price,
    pub pnl: Quote,
    pub fee: Quote,
    /// pnl - fee. what the position record keeps.
    pub realized_pnl: Quote,
    /// Notional at the exit price.
    pub exit_value: Quote,
    /// What goes back to the user's available balance. never negative.
    pub payout: Quote,
    /// How far margin + pnl - fee fell below zero.
    pub shortfall: Quote,
}

impl Settlement {
    pub fn has_shortfall(&self) -> bool {
        !self.shortfall.is_zero()
    }

    /// Adjustment passed with the margin release so the user receives exactly `payout`.
    pub fn release_adjustment(&self, margin: Quote) -> Quote {
        self.payout.sub(margin)
    }
}

pub fn settle_liquidation(position: &Position, mark: Price, params: &LiquidationParams) -> Settlement {
    let exit_value = position.notional_at(mark);
    let fee = liquidation_fee(exit_value, params.fee).rounded();
    settle(position, mark, fee, exit_value)
}

pub fn settle_close(position: &Position, exit: Price) -> Settlement {
    let exit_value = position.notional_at(exit);
    settle(position, exit, Quote::zero(), exit_value)
}

fn settle(position: &Position, exit: Price, fee: Quote, exit_value: Quote) -> Settlement {
    let pnl = position.pnl_at(exit).rounded();
    let remaining = position.margin_required.add(pnl).sub(fee);

    Settlement {
        exit_price: exit.rounded(),
        pnl,
        fee,
        realized_pnl: pnl.sub(fee),
        exit_value: exit_value.rounded(),
        payout: remaining.floor_zero(),
        shortfall: remaining.negate().floor_zero(),
    }
}
