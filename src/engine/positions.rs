//! Opening and closing positions.
//!
//! Opens serialize per user so the open-position count cannot be raced past
//! its cap. Closes serialize per position and share the terminal write with
//! the liquidation path, so exactly one of them wins.

use super::core::Engine;
use super::results::{CloseResult, EngineError};
use super::retry::with_retry;
use crate::events::{Notification, ReviewReason, ReviewRecord, SettlementSource};
use crate::liquidation::{settle_close, Settlement};
use crate::margin;
use crate::position::{Position, PositionStatus};
use crate::risk;
use crate::store::StoreError;
use crate::types::{Leverage, PositionId, Price, Quote, Side, Symbol, UserId};
use rust_decimal::Decimal;

impl Engine {
    pub async fn open_margin_position(
        &self,
        user_id: &UserId,
        symbol: &Symbol,
        side: Side,
        size: Decimal,
        price: Decimal,
        leverage: u32,
    ) -> Result<Position, EngineError> {
        let size = positive(size, "size")?;
        let entry = Price::new(price)
            .ok_or_else(|| EngineError::InvalidOrder(format!("price must be positive, got {}", price)))?;
        let requested = Leverage::new(leverage)
            .ok_or_else(|| EngineError::InvalidOrder("leverage must be at least 1".to_string()))?;

        in_range(size, entry)?;

        let params = self.symbols.params(symbol);
        if requested > params.max_leverage {
            return Err(EngineError::LeverageExceeded {
                requested: leverage,
                max: params.max_leverage.value(),
            });
        }

        let position = Position::open_margin(
            user_id.clone(),
            symbol.clone(),
            side,
            size,
            entry,
            requested,
            params.maintenance_margin_rate,
            self.now(),
        );
        self.open_position(position, Some(params.max_leverage)).await
    }

    /// Limit checks, margin lock and insert for a freshly built position.
    /// `symbol_cap` is set for leverage-margined opens, futures carry no leverage cap.
    pub(super) async fn open_position(
        &self,
        position: Position,
        symbol_cap: Option<Leverage>,
    ) -> Result<Position, EngineError> {
        if position.margin_required.is_zero() {
            return Err(EngineError::InvalidOrder("position too small to carry margin".to_string()));
        }
        let user_id = &position.user_id;
        let _guard = self.user_locks.lock(user_id).await;

        let registry = &self.risk;
        let limits = with_retry(&self.config.retry, "get_limits", || async move {
            Ok(registry.get_limits(user_id).await?)
        })
        .await?;

        if let Some(symbol_cap) = symbol_cap {
            let max = symbol_cap.value().min(limits.max_leverage);
            if position.leverage.value() > max {
                return Err(EngineError::LeverageExceeded {
                    requested: position.leverage.value(),
                    max,
                });
            }
        }

        let currency = self.config.settlement_currency.as_str();
        let available = with_retry(&self.config.retry, "available_balance", || async move {
            self.balance_call(self.balances.available_balance(user_id, currency))
                .await
        })
        .await?;
        if available < position.margin_required {
            return Err(EngineError::InsufficientMargin {
                available,
                required: position.margin_required,
            });
        }

        let store = &self.positions;
        let open = with_retry(&self.config.retry, "count_open", || async move {
            Ok(store.count_open_for_user(user_id).await?)
        })
        .await?;
        let daily = self.realized_today(user_id).await?;
        risk::check_open(&limits, position.entry_notional().rounded(), open, daily)
            .map_err(EngineError::RiskLimitExceeded)?;

        self.balance_call(self.balances.lock_margin(user_id, position.margin_required))
            .await?;

        let row = &position;
        let inserted = with_retry(&self.config.retry, "insert_position", || async move {
            match store.insert_position(row.clone()).await {
                // a duplicate id means an earlier attempt landed
                Ok(()) | Err(StoreError::DuplicatePosition(_)) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await;
        if let Err(e) = inserted {
            // undo the lock so no margin stays held without a position behind it
            let rollback = self
                .balance_call(self.balances.release_margin(user_id, position.margin_required, Quote::zero()))
                .await;
            if let Err(rollback_err) = rollback {
                tracing::error!(
                    user_id = %user_id,
                    amount = %position.margin_required,
                    error = %rollback_err,
                    "margin rollback failed after insert failure"
                );
                self.flag_for_review(
                    &position,
                    SettlementSource::Open,
                    ReviewReason::RollbackFailed,
                    position.margin_required,
                )
                .await;
            }
            return Err(e);
        }

        tracing::info!(
            position_id = %position.id,
            user_id = %user_id,
            symbol = %position.symbol,
            side = %position.side,
            size = %position.size,
            entry = %position.entry_price,
            leverage = %position.leverage,
            margin = %position.margin_required,
            liquidation_price = %position.liquidation_price,
            "position opened"
        );
        Ok(position)
    }

    /// User-initiated close. prices from the oracle when `price` is not given.
    pub async fn close_position(
        &self,
        user_id: &UserId,
        position_id: PositionId,
        price: Option<Decimal>,
    ) -> Result<CloseResult, EngineError> {
        let requested_exit = match price {
            Some(p) => Some(
                Price::new(p)
                    .ok_or_else(|| EngineError::InvalidOrder(format!("price must be positive, got {}", p)))?,
            ),
            None => None,
        };

        let _guard = self.position_locks.lock(&position_id).await;
        let position = self.get_position(position_id).await?;
        if &position.user_id != user_id {
            return Err(EngineError::PositionNotFound(position_id));
        }
        if !position.is_open() {
            return Err(EngineError::AlreadyClosed {
                id: position_id,
                status: position.status,
            });
        }

        let exit = match requested_exit {
            Some(exit) => exit,
            None => self.mark_price(&position.symbol).await?,
        };
        let settlement = settle_close(&position, exit);

        let store = &self.positions;
        let (exit_price, realized_pnl, closed_at) = (settlement.exit_price, settlement.realized_pnl, self.now());
        with_retry(&self.config.retry, "close_position", || async move {
            match store.close_position(position_id, exit_price, realized_pnl, closed_at).await {
                Ok(_) => Ok(()),
                // under the position lock only an earlier attempt of ours can have closed it
                Err(StoreError::NotOpen {
                    status: PositionStatus::Closed,
                    ..
                }) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        self.settle_balances(&position, &settlement, SettlementSource::Close)
            .await?;
        tracing::info!(
            position_id = %position_id,
            user_id = %user_id,
            exit = %settlement.exit_price,
            realized_pnl = %settlement.realized_pnl,
            "position closed"
        );

        Ok(CloseResult {
            position_id,
            exit_price: settlement.exit_price,
            realized_pnl: settlement.realized_pnl,
            payout: settlement.payout,
            shortfall: settlement.shortfall,
        })
    }

    /// Release margin for a position whose terminal write just landed. If custody does not
    /// take the release, the terminal write is reverted and the custody error returned, so the
    /// operation can be retried. Shortfalls go to the review queue once the release is through.
    pub(super) async fn settle_balances(
        &self,
        position: &Position,
        settlement: &Settlement,
        source: SettlementSource,
    ) -> Result<(), EngineError> {
        let adjustment = settlement.release_adjustment(position.margin_required);
        let release = self
            .balance_call(
                self.balances
                    .release_margin(&position.user_id, position.margin_required, adjustment),
            )
            .await;

        if let Err(e) = release {
            tracing::warn!(
                position_id = %position.id,
                user_id = %position.user_id,
                error = %e,
                "margin release failed, reverting terminal write"
            );
            let store = &self.positions;
            let reverted = with_retry(&self.config.retry, "reopen_position", || async move {
                Ok(store.reopen_position(position.clone()).await?)
            })
            .await;
            if let Err(revert_err) = reverted {
                tracing::error!(
                    position_id = %position.id,
                    error = %revert_err,
                    "terminal write not reverted, margin still locked"
                );
                self.flag_for_review(position, source, ReviewReason::ReleaseFailed, position.margin_required)
                    .await;
            }
            return Err(e);
        }

        if settlement.has_shortfall() {
            self.flag_for_review(position, source, ReviewReason::Shortfall, settlement.shortfall)
                .await;
        }
        Ok(())
    }

    async fn flag_for_review(
        &self,
        position: &Position,
        source: SettlementSource,
        reason: ReviewReason,
        amount: Quote,
    ) {
        let record = ReviewRecord {
            position_id: position.id,
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            source,
            reason,
            amount,
            timestamp: self.now(),
        };
        tracing::warn!(
            position_id = %position.id,
            user_id = %position.user_id,
            reason = ?reason,
            amount = %amount,
            "position flagged for review"
        );
        if let Err(e) = self.positions.flag_for_review(record.clone()).await {
            tracing::error!(position_id = %position.id, error = %e, "review record not persisted");
        }
        self.publish(Notification::Review(record)).await;
    }
}

/// Rejects a size and price whose notional does not fit in a Decimal.
pub(super) fn in_range(size: Decimal, price: Price) -> Result<(), EngineError> {
    margin::checked_notional(size, price)
        .map(|_| ())
        .ok_or_else(|| EngineError::InvalidOrder("notional out of range".to_string()))
}

pub(super) fn positive(value: Decimal, field: &str) -> Result<Decimal, EngineError> {
    if value > Decimal::ZERO {
        Ok(value)
    } else {
        Err(EngineError::InvalidOrder(format!("{} must be positive, got {}", field, value)))
    }
}
