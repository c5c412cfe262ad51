// 10.0: command interface. one serde-tagged request enum in, one response enum or ApiError out.
// transport is somebody else's problem, this layer only maps requests onto engine calls.

use crate::contract::{ContractSpec, FuturesContract};
use crate::engine::{CloseResult, Engine, EngineError, PortfolioRiskSummary};
use crate::position::Position;
use crate::risk::{RiskLimits, RiskLimitsUpdate};
use crate::types::{PositionId, Side, Symbol, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum EngineCommand {
    OpenMargin {
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        size: Decimal,
        price: Decimal,
        leverage: u32,
    },
    CloseMargin {
        user_id: UserId,
        position_id: PositionId,
        #[serde(default)]
        price: Option<Decimal>,
    },
    OpenFutures {
        user_id: UserId,
        contract: Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    },
    CreateContract(ContractSpec),
    SetLimits {
        user_id: UserId,
        #[serde(flatten)]
        update: RiskLimitsUpdate,
    },
    PortfolioSummary {
        user_id: UserId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandResponse {
    PositionOpened(Box<Position>),
    PositionClosed(CloseResult),
    ContractCreated(FuturesContract),
    LimitsUpdated(RiskLimits),
    Portfolio(Box<PortfolioRiskSummary>),
}

/// Stable error identifiers for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    LeverageExceeded,
    InsufficientMargin,
    RiskLimitExceeded,
    ContractNotFound,
    PositionNotFound,
    AlreadyClosed,
    NotLiquidatable,
    OracleUnavailable,
    PersistenceFailure,
    BalanceUnavailable,
    BalanceRejected,
    InvalidOrder,
    InvalidContract,
    InvalidRiskLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    /// Which risk limit refused the open, when that is the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let reason = match &err {
            EngineError::RiskLimitExceeded(violation) => Some(violation.reason().to_string()),
            _ => None,
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            reason,
        }
    }
}

impl Engine {
    pub async fn execute(&self, command: EngineCommand) -> Result<CommandResponse, ApiError> {
        self.dispatch(command).await.map_err(|e| {
            if e.is_retryable() {
                tracing::warn!(error = %e, "command failed, retryable");
            } else {
                tracing::debug!(error = %e, "command rejected");
            }
            ApiError::from(e)
        })
    }

    async fn dispatch(&self, command: EngineCommand) -> Result<CommandResponse, EngineError> {
        match command {
            EngineCommand::OpenMargin {
                user_id,
                symbol,
                side,
                size,
                price,
                leverage,
            } => {
                let position = self
                    .open_margin_position(&user_id, &symbol, side, size, price, leverage)
                    .await?;
                Ok(CommandResponse::PositionOpened(Box::new(position)))
            }
            EngineCommand::CloseMargin {
                user_id,
                position_id,
                price,
            } => {
                let closed = self.close_position(&user_id, position_id, price).await?;
                Ok(CommandResponse::PositionClosed(closed))
            }
            EngineCommand::OpenFutures {
                user_id,
                contract,
                side,
                quantity,
                price,
            } => {
                let position = self
                    .open_futures_position(&user_id, &contract, side, quantity, price)
                    .await?;
                Ok(CommandResponse::PositionOpened(Box::new(position)))
            }
            EngineCommand::CreateContract(spec) => {
                Ok(CommandResponse::ContractCreated(self.create_futures_contract(spec).await?))
            }
            EngineCommand::SetLimits { user_id, update } => {
                let limits = self.risk_limits().set_limits(&user_id, &update).await?;
                Ok(CommandResponse::LimitsUpdated(limits))
            }
            EngineCommand::PortfolioSummary { user_id } => {
                let summary = self.portfolio_risk_summary(&user_id).await?;
                Ok(CommandResponse::Portfolio(Box::new(summary)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::{Quote, Timestamp};
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn commands_parse_from_json() {
        let open: EngineCommand = serde_json::from_value(json!({
            "command": "open_margin",
            "user_id": "alice",
            "symbol": "btc/usdt",
            "side": "long",
            "size": "1",
            "price": "45000",
            "leverage": 10
        }))
        .unwrap();
        assert!(matches!(open, EngineCommand::OpenMargin { leverage: 10, .. }));

        let limits: EngineCommand = serde_json::from_value(json!({
            "command": "set_limits",
            "user_id": "alice",
            "max_open_positions": 3
        }))
        .unwrap();
        match limits {
            EngineCommand::SetLimits { update, .. } => {
                assert_eq!(update.max_open_positions, Some(3));
                assert_eq!(update.max_leverage, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn create_contract_parses_into_spec() {
        let create: EngineCommand = serde_json::from_value(json!({
            "command": "create_contract",
            "symbol": "eth-0628",
            "underlying": "eth/usdt",
            "expiry": 1_719_532_800_000_i64,
            "contract_size": "1",
            "tick_size": "0.5",
            "margin_requirement_ratio": "0.1"
        }))
        .unwrap();

        assert_eq!(
            create,
            EngineCommand::CreateContract(ContractSpec {
                symbol: Symbol::new("ETH-0628"),
                underlying: Symbol::new("ETH/USDT"),
                expiry: Timestamp::from_millis(1_719_532_800_000),
                contract_size: dec!(1),
                tick_size: dec!(0.5),
                margin_requirement_ratio: dec!(0.1),
            })
        );
    }

    #[tokio::test]
    async fn leverage_cap_maps_to_error_code() {
        let (engine, handles) = Engine::in_memory(EngineConfig::default(), Timestamp::from_millis(0)).unwrap();
        handles.custody.deposit(&UserId::new("alice"), Quote::new(dec!(100_000)));

        let err = engine
            .execute(EngineCommand::OpenMargin {
                user_id: UserId::new("alice"),
                symbol: Symbol::new("BTC/USDT"),
                side: Side::Long,
                size: dec!(1),
                price: dec!(45000),
                leverage: 150,
            })
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::LeverageExceeded);
        assert!(!err.retryable);
        assert_eq!(serde_json::to_value(err.code).unwrap(), "LEVERAGE_EXCEEDED");
    }

    #[tokio::test]
    async fn risk_refusal_carries_reason() {
        let (engine, handles) = Engine::in_memory(EngineConfig::default(), Timestamp::from_millis(0)).unwrap();
        let alice = UserId::new("alice");
        handles.custody.deposit(&alice, Quote::new(dec!(1_000_000)));

        engine
            .execute(EngineCommand::SetLimits {
                user_id: alice.clone(),
                update: RiskLimitsUpdate {
                    max_position_size: Some(dec!(10_000)),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let err = engine
            .execute(EngineCommand::OpenMargin {
                user_id: alice,
                symbol: Symbol::new("ETH/USDT"),
                side: Side::Short,
                size: dec!(5),
                price: dec!(3000),
                leverage: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RiskLimitExceeded);
        assert_eq!(err.reason.as_deref(), Some("size"));
    }
}
