//! Futures contract definitions.
//!
//! A contract fixes the multiplier, tick size and margin ratio for every
//! position opened on it. Parameters never change once created; the only
//! mutation is the one-way `active -> expired` status flip.

use crate::types::{ContractId, Price, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuturesContract {
    pub id: ContractId,
    /// Contract symbol, e.g. "BTC-0628".
    pub symbol: Symbol,
    /// Spot symbol the contract settles against, e.g. "BTC/USDT".
    pub underlying: Symbol,
    pub expiry: Timestamp,
    pub contract_size: Decimal,
    pub tick_size: Decimal,
    pub margin_requirement_ratio: Decimal,
    pub status: ContractStatus,
    pub created_at: Timestamp,
}

/// Parameters for a new contract, as received on the command interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub symbol: Symbol,
    pub underlying: Symbol,
    pub expiry: Timestamp,
    pub contract_size: Decimal,
    pub tick_size: Decimal,
    pub margin_requirement_ratio: Decimal,
}

impl ContractSpec {
    pub fn validate(&self, now: Timestamp) -> Result<(), ContractError> {
        if self.symbol.as_str().is_empty() {
            return Err(ContractError::EmptySymbol);
        }
        if self.contract_size <= Decimal::ZERO {
            return Err(ContractError::NonPositive("contract_size", self.contract_size));
        }
        if self.tick_size <= Decimal::ZERO {
            return Err(ContractError::NonPositive("tick_size", self.tick_size));
        }
        if self.margin_requirement_ratio <= Decimal::ZERO
            || self.margin_requirement_ratio > Decimal::ONE
        {
            return Err(ContractError::InvalidMarginRatio(self.margin_requirement_ratio));
        }
        if self.expiry <= now {
            return Err(ContractError::AlreadyExpired(self.expiry));
        }
        Ok(())
    }

    pub fn into_contract(self, now: Timestamp) -> FuturesContract {
        FuturesContract {
            id: ContractId::new(),
            symbol: self.symbol,
            underlying: self.underlying,
            expiry: self.expiry,
            contract_size: self.contract_size,
            tick_size: self.tick_size,
            margin_requirement_ratio: self.margin_requirement_ratio,
            status: ContractStatus::Active,
            created_at: now,
        }
    }
}

impl FuturesContract {
    /// Tradable: not flagged expired and not past its expiry time.
    pub fn is_tradable(&self, now: Timestamp) -> bool {
        self.status == ContractStatus::Active && now < self.expiry
    }

    /// Exposure in units of the underlying for a number of contracts. `None` on overflow.
    pub fn exposure(&self, quantity: Decimal) -> Option<Decimal> {
        quantity.checked_mul(self.contract_size)
    }

    pub fn is_on_tick(&self, price: Price) -> bool {
        (price.value() % self.tick_size).is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractError {
    #[error("Contract symbol is empty")]
    EmptySymbol,

    #[error("{0} must be positive, got {1}")]
    NonPositive(&'static str, Decimal),

    #[error("Margin requirement ratio {0} must be in (0, 1]")]
    InvalidMarginRatio(Decimal),

    #[error("Expiry {0} is not in the future")]
    AlreadyExpired(Timestamp),

    #[error("Margin ratio {margin_ratio} does not cover maintenance rate {maintenance_rate} of the underlying")]
    MarginBelowMaintenance {
        margin_ratio: Decimal,
        maintenance_rate: Decimal,
    },

    #[error("Contract {0} already exists")]
    DuplicateSymbol(Symbol),
}
