// 8.0.2: result types and errors for engine operations.

use crate::api::ErrorCode;
use crate::contract::ContractError;
use crate::custody::CustodyError;
use crate::liquidation::Assessment;
use crate::position::PositionStatus;
use crate::price_feed::OracleError;
use crate::risk::{RiskLimitError, RiskViolation};
use crate::store::StoreError;
use crate::types::{PositionId, Price, Quote, Symbol, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    pub position_id: PositionId,
    pub exit_price: Price,
    pub realized_pnl: Quote,
    /// Credited back to the user's available balance.
    pub payout: Quote,
    pub shortfall: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationResult {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub mark_price: Price,
    pub realized_pnl: Quote,
    pub fee: Quote,
    pub payout: Quote,
    pub shortfall: Quote,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Leverage {requested}x exceeds the {max}x cap")]
    LeverageExceeded { requested: u32, max: u32 },

    #[error("Insufficient margin: available {available}, required {required}")]
    InsufficientMargin { available: Quote, required: Quote },

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(RiskViolation),

    #[error("No active futures contract {0}")]
    ContractNotFound(Symbol),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Position {id} is already {status}")]
    AlreadyClosed { id: PositionId, status: PositionStatus },

    #[error("Position {id} is not liquidatable: equity {equity} above maintenance {maintenance}")]
    NotLiquidatable {
        id: PositionId,
        equity: Quote,
        maintenance: Quote,
    },

    #[error("Price oracle unavailable: {0}")]
    OracleUnavailable(OracleError),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Balance service unavailable: {0}")]
    BalanceUnavailable(String),

    #[error("Balance service rejected the request: {0}")]
    BalanceRejected(CustodyError),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid contract: {0}")]
    InvalidContract(ContractError),

    #[error("Invalid risk limits: {0}")]
    InvalidRiskLimits(String),
}

impl EngineError {
    /// Transient infrastructure errors. everything else is a validation outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::OracleUnavailable(_)
                | EngineError::PersistenceFailure(_)
                | EngineError::BalanceUnavailable(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::LeverageExceeded { .. } => ErrorCode::LeverageExceeded,
            EngineError::InsufficientMargin { .. } => ErrorCode::InsufficientMargin,
            EngineError::RiskLimitExceeded(_) => ErrorCode::RiskLimitExceeded,
            EngineError::ContractNotFound(_) => ErrorCode::ContractNotFound,
            EngineError::PositionNotFound(_) => ErrorCode::PositionNotFound,
            EngineError::AlreadyClosed { .. } => ErrorCode::AlreadyClosed,
            EngineError::NotLiquidatable { .. } => ErrorCode::NotLiquidatable,
            EngineError::OracleUnavailable(_) => ErrorCode::OracleUnavailable,
            EngineError::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
            EngineError::BalanceUnavailable(_) => ErrorCode::BalanceUnavailable,
            EngineError::BalanceRejected(_) => ErrorCode::BalanceRejected,
            EngineError::InvalidOrder(_) => ErrorCode::InvalidOrder,
            EngineError::InvalidContract(_) => ErrorCode::InvalidContract,
            EngineError::InvalidRiskLimits(_) => ErrorCode::InvalidRiskLimits,
        }
    }

    pub(super) fn not_liquidatable(id: PositionId, assessment: &Assessment, maintenance: Quote) -> Self {
        EngineError::NotLiquidatable {
            id,
            equity: assessment.equity.rounded(),
            maintenance,
        }
    }
}

impl From<OracleError> for EngineError {
    fn from(err: OracleError) -> Self {
        EngineError::OracleUnavailable(err)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PositionNotFound(id) => EngineError::PositionNotFound(id),
            StoreError::NotOpen { id, status } => EngineError::AlreadyClosed { id, status },
            StoreError::DuplicateContract(symbol) => {
                EngineError::InvalidContract(ContractError::DuplicateSymbol(symbol))
            }
            other => EngineError::PersistenceFailure(other.to_string()),
        }
    }
}

impl From<CustodyError> for EngineError {
    fn from(err: CustodyError) -> Self {
        match err {
            CustodyError::InsufficientBalance { available, required } => {
                EngineError::InsufficientMargin { available, required }
            }
            CustodyError::Unavailable => EngineError::BalanceUnavailable(err.to_string()),
            other => EngineError::BalanceRejected(other),
        }
    }
}

impl From<RiskLimitError> for EngineError {
    fn from(err: RiskLimitError) -> Self {
        match err {
            RiskLimitError::Exceeded(violation) => EngineError::RiskLimitExceeded(violation),
            RiskLimitError::Invalid(..) => EngineError::InvalidRiskLimits(err.to_string()),
            RiskLimitError::Store(store) => store.into(),
        }
    }
}
