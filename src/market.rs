//! Symbol risk parameters.
//!
//! Each tradable symbol has a leverage cap and a maintenance margin rate.
//! The table is built once at startup and shared read-only; edits mean
//! building a new table, and only positions opened afterwards see them.

use crate::types::{Leverage, Symbol};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static per-symbol configuration (immutable after creation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolParams {
    pub max_leverage: Leverage,
    pub maintenance_margin_rate: Decimal,
}

impl SymbolParams {
    pub fn new(max_leverage: u32, maintenance_margin_rate: Decimal) -> Self {
        Self {
            max_leverage: Leverage::new(max_leverage).unwrap_or(Leverage::ONE),
            maintenance_margin_rate,
        }
    }

    /// A position at max leverage must not be liquidatable at entry, so MMR < 1/max_leverage.
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.maintenance_margin_rate <= Decimal::ZERO
            || self.maintenance_margin_rate >= Decimal::ONE
        {
            return Err(MarketError::InvalidMaintenanceRate(self.maintenance_margin_rate));
        }
        if self.maintenance_margin_rate >= self.max_leverage.initial_margin_fraction() {
            return Err(MarketError::MaintenanceAboveInitial {
                maintenance_margin_rate: self.maintenance_margin_rate,
                max_leverage: self.max_leverage,
            });
        }
        Ok(())
    }
}

/// Lookup table with a fallback entry for symbols it does not list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTable {
    entries: HashMap<Symbol, SymbolParams>,
    fallback: SymbolParams,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new(SymbolParams::new(20, dec!(0.025)))
            .with_symbol("BTC/USDT", SymbolParams::new(125, dec!(0.005)))
            .with_symbol("ETH/USDT", SymbolParams::new(100, dec!(0.005)))
            .with_symbol("SOL/USDT", SymbolParams::new(50, dec!(0.01)))
    }
}

impl SymbolTable {
    pub fn new(fallback: SymbolParams) -> Self {
        Self {
            entries: HashMap::new(),
            fallback,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<Symbol>, params: SymbolParams) -> Self {
        self.entries.insert(symbol.into(), params);
        self
    }

    pub fn params(&self, symbol: &Symbol) -> &SymbolParams {
        self.entries.get(symbol).unwrap_or(&self.fallback)
    }

    pub fn is_listed(&self, symbol: &Symbol) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        self.fallback.validate()?;
        for (symbol, params) in &self.entries {
            params
                .validate()
                .map_err(|e| MarketError::InvalidSymbol(symbol.clone(), Box::new(e)))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarketError {
    #[error("Maintenance margin rate {0} must be in (0, 1)")]
    InvalidMaintenanceRate(Decimal),

    #[error("Maintenance margin rate {maintenance_margin_rate} is not below the {max_leverage} initial margin fraction")]
    MaintenanceAboveInitial {
        maintenance_margin_rate: Decimal,
        max_leverage: Leverage,
    },

    #[error("Symbol {0}: {1}")]
    InvalidSymbol(Symbol, Box<MarketError>),
}
