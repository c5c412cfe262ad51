//! Forced close of positions whose equity has reached maintenance margin.

use super::core::Engine;
use super::results::{EngineError, LiquidationResult};
use super::retry::with_retry;
use crate::events::{LiquidationEvent, Notification, SettlementSource};
use crate::liquidation::{assess_position, settle_liquidation, RiskStatus};
use crate::position::PositionStatus;
use crate::store::StoreError;
use crate::types::{PositionId, Price};
use uuid::Uuid;

impl Engine {
    /// Liquidate `position_id` at `mark` if it is still open and eligible at that price.
    pub async fn liquidate_position(
        &self,
        position_id: PositionId,
        mark: Price,
    ) -> Result<LiquidationResult, EngineError> {
        let _guard = self.position_locks.lock(&position_id).await;
        let position = self.get_position(position_id).await?;
        if !position.is_open() {
            return Err(EngineError::AlreadyClosed {
                id: position_id,
                status: position.status,
            });
        }

        let params = &self.config.liquidation;
        let assessment = assess_position(&position, mark, params);
        if assessment.status != RiskStatus::Liquidatable {
            return Err(EngineError::not_liquidatable(
                position_id,
                &assessment,
                position.maintenance_margin,
            ));
        }

        let settlement = settle_liquidation(&position, mark, params);
        let event = LiquidationEvent {
            id: Uuid::new_v4(),
            position_id,
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.size,
            liquidation_price: settlement.exit_price,
            liquidation_value: settlement.exit_value,
            liquidation_fee: settlement.fee,
            timestamp: self.now(),
        };

        // status flip and ledger entry land together or not at all
        let store = &self.positions;
        let (exit_price, realized_pnl, entry) = (settlement.exit_price, settlement.realized_pnl, &event);
        with_retry(&self.config.retry, "liquidate_position", || async move {
            match store
                .liquidate_position(position_id, exit_price, realized_pnl, entry.clone())
                .await
            {
                Ok(_) => Ok(()),
                // under the position lock only an earlier attempt of ours can have liquidated it
                Err(StoreError::NotOpen {
                    status: PositionStatus::Liquidated,
                    ..
                }) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        // a refused release reverts the status flip and the ledger entry, the next scan retries
        self.settle_balances(&position, &settlement, SettlementSource::Liquidation)
            .await?;
        tracing::info!(
            position_id = %position_id,
            user_id = %position.user_id,
            symbol = %position.symbol,
            mark = %mark,
            equity = %assessment.equity.rounded(),
            maintenance = %position.maintenance_margin,
            fee = %settlement.fee,
            "position liquidated"
        );
        self.publish(Notification::Liquidation(event)).await;

        Ok(LiquidationResult {
            position_id,
            user_id: position.user_id,
            symbol: position.symbol,
            mark_price: settlement.exit_price,
            realized_pnl: settlement.realized_pnl,
            fee: settlement.fee,
            payout: settlement.payout,
            shortfall: settlement.shortfall,
        })
    }
}
