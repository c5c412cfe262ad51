// 11.0: records the engine produces for the outside world. liquidation ledger entries,
// volatility alerts and positions waiting for manual review. all go through a Notifier.

use crate::types::{PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Append-only ledger entry. one per liquidated position, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub id: Uuid,
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    /// Mark price the position was closed at.
    pub liquidation_price: Price,
    /// Notional at that mark.
    pub liquidation_value: Quote,
    pub liquidation_fee: Quote,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityAlert {
    pub symbol: Symbol,
    pub price: Price,
    /// 24h change as a signed fraction, 0.12 = +12%.
    pub change_24h: Decimal,
    pub threshold: Decimal,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementSource {
    Open,
    Close,
    Liquidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    /// Loss ran past the locked margin. the user was paid zero, `amount` is the deficit.
    Shortfall,
    /// Custody refused the release and the terminal write could not be reverted either.
    /// the position is closed in the store while `amount` is still locked.
    ReleaseFailed,
    /// The position insert failed and custody refused to unlock the margin taken for it.
    /// `amount` is locked with no position behind it.
    RollbackFailed,
}

/// Something a human has to settle by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub source: SettlementSource,
    pub reason: ReviewReason,
    pub amount: Quote,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Liquidation(LiquidationEvent),
    Volatility(VolatilityAlert),
    Review(ReviewRecord),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    ChannelClosed,
}

/// Downstream alerting. delivery failures are logged by the caller, never fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;

    fn name(&self) -> &str;
}

/// Forwards every notification into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx
            .send(notification)
            .map_err(|_| NotifyError::ChannelClosed)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Writes notifications to the log and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        match &notification {
            Notification::Liquidation(e) => tracing::info!(
                position_id = %e.position_id,
                user_id = %e.user_id,
                symbol = %e.symbol,
                price = %e.liquidation_price,
                fee = %e.liquidation_fee,
                "position liquidated"
            ),
            Notification::Volatility(a) => tracing::warn!(
                symbol = %a.symbol,
                price = %a.price,
                change_24h = %a.change_24h,
                "volatility alert"
            ),
            Notification::Review(r) => tracing::warn!(
                position_id = %r.position_id,
                user_id = %r.user_id,
                reason = ?r.reason,
                amount = %r.amount,
                "position flagged for review"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn alert() -> Notification {
        Notification::Volatility(VolatilityAlert {
            symbol: Symbol::new("SOL/USDT"),
            price: Price::new_unchecked(dec!(150)),
            change_24h: dec!(-0.14),
            threshold: dec!(0.1),
            timestamp: Timestamp::from_millis(0),
        })
    }

    #[tokio::test]
    async fn channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(alert()).await.unwrap();
        assert_eq!(rx.recv().await, Some(alert()));
    }

    #[tokio::test]
    async fn channel_notifier_reports_closed_receiver() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        assert_eq!(notifier.notify(alert()).await, Err(NotifyError::ChannelClosed));
    }

    #[tokio::test]
    async fn tracing_notifier_accepts_everything() {
        let review = Notification::Review(ReviewRecord {
            position_id: PositionId::new(),
            user_id: UserId::new("alice"),
            symbol: Symbol::new("BTC/USDT"),
            source: SettlementSource::Open,
            reason: ReviewReason::RollbackFailed,
            amount: Quote::new(dec!(4500)),
            timestamp: Timestamp::from_millis(0),
        });
        let notifier = TracingNotifier;
        assert_eq!(notifier.notify(alert()).await, Ok(()));
        assert_eq!(notifier.notify(review).await, Ok(()));
        assert_eq!(notifier.name(), "tracing");
    }

    #[test]
    fn review_reason_wire_names() {
        assert_eq!(serde_json::to_value(ReviewReason::RollbackFailed).unwrap(), "rollback_failed");
        assert_eq!(serde_json::to_value(SettlementSource::Open).unwrap(), "open");
    }

    #[test]
    fn notification_serializes_with_tag() {
        let json = serde_json::to_value(alert()).unwrap();
        assert_eq!(json["type"], "volatility");
        assert_eq!(json["symbol"], "SOL/USDT");
    }
}
