// 8.3: futures contracts. creation, opening against a contract, expiry sweep.
// a futures position is margined by the contract ratio and priced on the underlying.

use super::core::Engine;
use super::positions::{in_range, positive};
use super::results::EngineError;
use super::retry::with_retry;
use crate::contract::{ContractError, ContractSpec, FuturesContract};
use crate::position::Position;
use crate::types::{Price, Side, Symbol, UserId};
use rust_decimal::Decimal;

impl Engine {
    pub async fn create_futures_contract(&self, spec: ContractSpec) -> Result<FuturesContract, EngineError> {
        let now = self.now();
        spec.validate(now).map_err(EngineError::InvalidContract)?;

        // a ratio at or under the maintenance rate would be liquidatable at entry
        let maintenance_rate = self.symbols.params(&spec.underlying).maintenance_margin_rate;
        if spec.margin_requirement_ratio <= maintenance_rate {
            return Err(EngineError::InvalidContract(ContractError::MarginBelowMaintenance {
                margin_ratio: spec.margin_requirement_ratio,
                maintenance_rate,
            }));
        }

        let contract = spec.into_contract(now);
        self.contracts.insert_contract(contract.clone()).await?;
        tracing::info!(
            contract = %contract.symbol,
            underlying = %contract.underlying,
            expiry = %contract.expiry,
            margin_ratio = %contract.margin_requirement_ratio,
            "futures contract created"
        );
        Ok(contract)
    }

    pub async fn open_futures_position(
        &self,
        user_id: &UserId,
        contract_symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Position, EngineError> {
        let quantity = positive(quantity, "quantity")?;
        let entry = Price::new(price)
            .ok_or_else(|| EngineError::InvalidOrder(format!("price must be positive, got {}", price)))?;

        let contract = self.active_contract(contract_symbol).await?;
        if !contract.is_on_tick(entry) {
            return Err(EngineError::InvalidOrder(format!(
                "price {} is not a multiple of tick size {}",
                entry, contract.tick_size
            )));
        }

        let size = contract
            .exposure(quantity)
            .ok_or_else(|| EngineError::InvalidOrder("notional out of range".to_string()))?;
        in_range(size, entry)?;

        let maintenance_rate = self.symbols.params(&contract.underlying).maintenance_margin_rate;
        let position = Position::open_futures(
            user_id.clone(),
            &contract,
            side,
            size,
            entry,
            maintenance_rate,
            self.now(),
        );
        self.open_position(position, None).await
    }

    /// Flip every contract past its expiry to expired. open positions on them are left alone.
    pub async fn expire_contracts(&self) -> Result<Vec<FuturesContract>, EngineError> {
        let expired = self.contracts.expire_contracts(self.now()).await?;
        for contract in &expired {
            tracing::info!(contract = %contract.symbol, expiry = %contract.expiry, "futures contract expired");
        }
        Ok(expired)
    }

    async fn active_contract(&self, symbol: &Symbol) -> Result<FuturesContract, EngineError> {
        let contracts = &self.contracts;
        let found = with_retry(&self.config.retry, "contract_by_symbol", || async move {
            Ok(contracts.contract_by_symbol(symbol).await?)
        })
        .await?;

        let now = self.now();
        found
            .filter(|c| c.is_tradable(now))
            .ok_or_else(|| EngineError::ContractNotFound(symbol.clone()))
    }
}
