// 4.0: position records. one row per margin or futures position, from open to its terminal state.
// 4.1 has the lifecycle transition at the bottom. open -> closed | liquidated, exactly once.

use crate::contract::FuturesContract;
use crate::margin::{
    self, calculate_contract_requirement, calculate_margin_requirement, derived_leverage,
    MarginRequirement,
};
use crate::types::{ContractId, Leverage, PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionKind {
    Margin,
    Futures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => f.write_str("open"),
            PositionStatus::Closed => f.write_str("closed"),
            PositionStatus::Liquidated => f.write_str("liquidated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    /// Symbol priced by the oracle. for futures this is the contract's underlying.
    pub symbol: Symbol,
    pub kind: PositionKind,
    pub contract_id: Option<ContractId>,
    pub side: Side,
    /// Exposure in units of the base asset. always positive, side carries direction.
    pub size: Decimal,
    pub entry_price: Price,
    pub leverage: Leverage,
    /// Fraction of entry notional locked as margin. 1/leverage, or the contract ratio.
    pub initial_margin_fraction: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub margin_required: Quote,
    pub maintenance_margin: Quote,
    pub liquidation_price: Price,
    pub unrealized_pnl: Quote,
    pub realized_pnl: Quote,
    pub status: PositionStatus,
    pub exit_price: Option<Price>,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
}

impl Position {
    /// New leverage-margined position. caller has already validated the leverage cap.
    #[allow(clippy::too_many_arguments)]
    pub fn open_margin(
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        size: Decimal,
        entry_price: Price,
        leverage: Leverage,
        maintenance_margin_rate: Decimal,
        opened_at: Timestamp,
    ) -> Self {
        let req =
            calculate_margin_requirement(side, size, entry_price, leverage, maintenance_margin_rate);
        Self::from_requirement(
            user_id,
            symbol,
            PositionKind::Margin,
            None,
            side,
            size,
            entry_price,
            leverage,
            leverage.initial_margin_fraction(),
            maintenance_margin_rate,
            req,
            opened_at,
        )
    }

    /// New contract-margined position. `size` is the exposure in base units,
    /// see `FuturesContract::exposure`.
    pub fn open_futures(
        user_id: UserId,
        contract: &FuturesContract,
        side: Side,
        size: Decimal,
        entry_price: Price,
        maintenance_margin_rate: Decimal,
        opened_at: Timestamp,
    ) -> Self {
        let req = calculate_contract_requirement(
            side,
            size,
            entry_price,
            contract.margin_requirement_ratio,
            maintenance_margin_rate,
        );
        let leverage = derived_leverage(req.notional, req.initial);
        Self::from_requirement(
            user_id,
            contract.underlying.clone(),
            PositionKind::Futures,
            Some(contract.id),
            side,
            size,
            entry_price,
            leverage,
            contract.margin_requirement_ratio,
            maintenance_margin_rate,
            req,
            opened_at,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_requirement(
        user_id: UserId,
        symbol: Symbol,
        kind: PositionKind,
        contract_id: Option<ContractId>,
        side: Side,
        size: Decimal,
        entry_price: Price,
        leverage: Leverage,
        initial_margin_fraction: Decimal,
        maintenance_margin_rate: Decimal,
        req: MarginRequirement,
        opened_at: Timestamp,
    ) -> Self {
        Self {
            id: PositionId::new(),
            user_id,
            symbol,
            kind,
            contract_id,
            side,
            size: size.abs(),
            entry_price,
            leverage,
            initial_margin_fraction,
            maintenance_margin_rate,
            margin_required: req.initial,
            maintenance_margin: req.maintenance,
            liquidation_price: req.liquidation_price,
            unrealized_pnl: Quote::zero(),
            realized_pnl: Quote::zero(),
            status: PositionStatus::Open,
            exit_price: None,
            opened_at,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn entry_notional(&self) -> Quote {
        margin::notional_value(self.size, self.entry_price)
    }

    pub fn notional_at(&self, price: Price) -> Quote {
        margin::notional_value(self.size, price)
    }

    pub fn pnl_at(&self, price: Price) -> Quote {
        margin::pnl(self.side, self.entry_price, self.size, price)
    }

    // 4.2: margin + pnl. compared against maintenance margin to decide liquidation
    pub fn equity_at(&self, price: Price) -> Quote {
        self.margin_required.add(self.pnl_at(price))
    }

    pub fn maintenance_threshold(&self) -> Decimal {
        margin::maintenance_threshold(self.maintenance_margin, self.entry_notional())
    }

    /// Recompute the liquidation price from the recorded inputs. must match `liquidation_price`.
    pub fn rederive_liquidation_price(&self) -> Price {
        margin::liquidation_price_for_fraction(
            self.side,
            self.entry_price,
            self.initial_margin_fraction,
            self.maintenance_margin_rate,
        )
        .rounded()
    }

    // 4.3: the one terminal write. fails if anything already moved the position out of open.
    pub fn settle(
        &mut self,
        status: PositionStatus,
        exit_price: Price,
        realized_pnl: Quote,
        at: Timestamp,
    ) -> Result<(), PositionError> {
        if self.status.is_terminal() {
            return Err(PositionError::NotOpen {
                id: self.id,
                status: self.status,
            });
        }
        if !status.is_terminal() {
            return Err(PositionError::InvalidTransition { id: self.id });
        }
        self.status = status;
        self.exit_price = Some(exit_price.rounded());
        self.realized_pnl = realized_pnl.rounded();
        self.unrealized_pnl = Quote::zero();
        self.closed_at = Some(at);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    #[error("Position {id} is already {status}")]
    NotOpen { id: PositionId, status: PositionStatus },

    #[error("Position {id} can only move to closed or liquidated")]
    InvalidTransition { id: PositionId },
}
