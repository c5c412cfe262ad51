//! Per-user risk limits.
//!
//! Limits are checked once, when a position opens. Changing them never touches
//! positions that are already open. Users without a stored record get the
//! configured defaults.
//!
//! The registry keeps a short-lived cache in front of the store, so a limit
//! change made through another engine instance reaches new opens within one
//! TTL.

use crate::store::{RiskLimitStore, StoreError};
use crate::types::{Quote, Timestamp, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_leverage: u32,
    /// Cap on a single position's notional at entry.
    pub max_position_size: Decimal,
    /// Net realized loss allowed per UTC day before new opens are refused.
    pub max_daily_loss: Decimal,
    pub max_open_positions: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_leverage: 125,
            max_position_size: dec!(1_000_000),
            max_daily_loss: dec!(10_000),
            max_open_positions: 10,
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), RiskLimitError> {
        if self.max_leverage == 0 {
            return Err(RiskLimitError::Invalid("max_leverage", Decimal::ZERO));
        }
        if self.max_position_size <= Decimal::ZERO {
            return Err(RiskLimitError::Invalid("max_position_size", self.max_position_size));
        }
        if self.max_daily_loss <= Decimal::ZERO {
            return Err(RiskLimitError::Invalid("max_daily_loss", self.max_daily_loss));
        }
        if self.max_open_positions == 0 {
            return Err(RiskLimitError::Invalid("max_open_positions", Decimal::ZERO));
        }
        Ok(())
    }

    pub fn apply(&self, update: &RiskLimitsUpdate) -> RiskLimits {
        RiskLimits {
            max_leverage: update.max_leverage.unwrap_or(self.max_leverage),
            max_position_size: update.max_position_size.unwrap_or(self.max_position_size),
            max_daily_loss: update.max_daily_loss.unwrap_or(self.max_daily_loss),
            max_open_positions: update.max_open_positions.unwrap_or(self.max_open_positions),
        }
    }
}

/// Partial update. absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskLimitsUpdate {
    #[serde(default)]
    pub max_leverage: Option<u32>,
    #[serde(default)]
    pub max_position_size: Option<Decimal>,
    #[serde(default)]
    pub max_daily_loss: Option<Decimal>,
    #[serde(default)]
    pub max_open_positions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RiskViolation {
    #[serde(rename = "size")]
    PositionSize { value: Quote, limit: Decimal },
    #[serde(rename = "count")]
    OpenPositions { open: usize, limit: u32 },
    DailyLoss { loss: Decimal, limit: Decimal },
}

impl RiskViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            RiskViolation::PositionSize { .. } => "size",
            RiskViolation::OpenPositions { .. } => "count",
            RiskViolation::DailyLoss { .. } => "daily_loss",
        }
    }
}

impl fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskViolation::PositionSize { value, limit } => {
                write!(f, "position value {} exceeds max position size {}", value, limit)
            }
            RiskViolation::OpenPositions { open, limit } => {
                write!(f, "{} open positions, limit is {}", open, limit)
            }
            RiskViolation::DailyLoss { loss, limit } => {
                write!(f, "realized loss today {} has reached max daily loss {}", loss, limit)
            }
        }
    }
}

/// Open-time check against one user's limits. `daily_realized` is today's net realized PnL.
pub fn check_open(
    limits: &RiskLimits,
    position_value: Quote,
    open_positions: usize,
    daily_realized: Decimal,
) -> Result<(), RiskViolation> {
    if position_value.value() > limits.max_position_size {
        return Err(RiskViolation::PositionSize {
            value: position_value,
            limit: limits.max_position_size,
        });
    }
    if open_positions >= limits.max_open_positions as usize {
        return Err(RiskViolation::OpenPositions {
            open: open_positions,
            limit: limits.max_open_positions,
        });
    }
    let loss = (-daily_realized).max(Decimal::ZERO);
    if loss >= limits.max_daily_loss {
        return Err(RiskViolation::DailyLoss {
            loss,
            limit: limits.max_daily_loss,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskLimitError {
    #[error("{0} must be positive, got {1}")]
    Invalid(&'static str, Decimal),

    #[error("Risk limit exceeded: {0}")]
    Exceeded(RiskViolation),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct CachedLimits {
    limits: RiskLimits,
    fetched_at: Instant,
}

/// Store-backed limits with a TTL cache.
pub struct RiskLimitRegistry {
    store: Arc<dyn RiskLimitStore>,
    defaults: RiskLimits,
    ttl: Duration,
    cache: RwLock<HashMap<UserId, CachedLimits>>,
}

impl RiskLimitRegistry {
    pub fn new(store: Arc<dyn RiskLimitStore>, defaults: RiskLimits, ttl: Duration) -> Self {
        Self {
            store,
            defaults,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn defaults(&self) -> &RiskLimits {
        &self.defaults
    }

    pub async fn get_limits(&self, user_id: &UserId) -> Result<RiskLimits, StoreError> {
        if let Some(cached) = self.cache.read().await.get(user_id) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.limits.clone());
            }
        }

        let limits = self
            .store
            .get_limits(user_id)
            .await?
            .unwrap_or_else(|| self.defaults.clone());

        self.cache.write().await.insert(
            user_id.clone(),
            CachedLimits {
                limits: limits.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(limits)
    }

    pub async fn set_limits(
        &self,
        user_id: &UserId,
        update: &RiskLimitsUpdate,
    ) -> Result<RiskLimits, RiskLimitError> {
        let current = self
            .store
            .get_limits(user_id)
            .await?
            .unwrap_or_else(|| self.defaults.clone());
        let limits = current.apply(update);
        limits.validate()?;

        self.store.put_limits(user_id, limits.clone()).await?;
        self.cache.write().await.remove(user_id);

        tracing::info!(user_id = %user_id, ?limits, "risk limits updated");
        Ok(limits)
    }
}

/// Net realized PnL of positions closed on the same UTC day as `now`.
pub fn realized_today<'a>(
    closed: impl Iterator<Item = (&'a Quote, Option<Timestamp>)>,
    now: Timestamp,
) -> Decimal {
    let today = now.utc_day();
    closed
        .filter(|(_, at)| at.map(|t| t.utc_day()) == Some(today))
        .map(|(pnl, _)| pnl.value())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(ttl: Duration) -> (Arc<MemoryStore>, RiskLimitRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = RiskLimitRegistry::new(store.clone(), RiskLimits::default(), ttl);
        (store, registry)
    }

    #[test]
    fn size_and_count_limits() {
        let limits = RiskLimits {
            max_position_size: dec!(50_000),
            max_open_positions: 2,
            ..RiskLimits::default()
        };

        assert!(check_open(&limits, Quote::new(dec!(45_000)), 1, Decimal::ZERO).is_ok());

        let too_big = check_open(&limits, Quote::new(dec!(60_000)), 0, Decimal::ZERO);
        assert_eq!(too_big.unwrap_err().reason(), "size");

        let too_many = check_open(&limits, Quote::new(dec!(1_000)), 2, Decimal::ZERO);
        assert_eq!(too_many.unwrap_err().reason(), "count");
    }

    #[test]
    fn daily_loss_limit() {
        let limits = RiskLimits {
            max_daily_loss: dec!(1_000),
            ..RiskLimits::default()
        };
        assert!(check_open(&limits, Quote::new(dec!(1)), 0, dec!(-999)).is_ok());
        assert!(check_open(&limits, Quote::new(dec!(1)), 0, dec!(5_000)).is_ok());

        let refused = check_open(&limits, Quote::new(dec!(1)), 0, dec!(-1_000));
        assert_eq!(refused.unwrap_err().reason(), "daily_loss");
    }

    #[test]
    fn realized_today_ignores_other_days() {
        let day = 86_400_000;
        let now = Timestamp::from_millis(3 * day + 10);
        let a = Quote::new(dec!(-300));
        let b = Quote::new(dec!(100));
        let c = Quote::new(dec!(-5_000));
        let rows = vec![
            (&a, Some(Timestamp::from_millis(3 * day + 1))),
            (&b, Some(Timestamp::from_millis(3 * day + 5))),
            (&c, Some(Timestamp::from_millis(2 * day))),
        ];
        assert_eq!(realized_today(rows.into_iter(), now), dec!(-200));
    }

    #[tokio::test]
    async fn defaults_when_unset() {
        let (_, registry) = registry(Duration::from_secs(30));
        let limits = registry.get_limits(&UserId::new("alice")).await.unwrap();
        assert_eq!(limits, RiskLimits::default());
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let (_, registry) = registry(Duration::from_secs(30));
        let user = UserId::new("alice");

        let update = RiskLimitsUpdate {
            max_open_positions: Some(3),
            ..Default::default()
        };
        let limits = registry.set_limits(&user, &update).await.unwrap();
        assert_eq!(limits.max_open_positions, 3);
        assert_eq!(limits.max_leverage, 125);

        let fetched = registry.get_limits(&user).await.unwrap();
        assert_eq!(fetched.max_open_positions, 3);
    }

    #[tokio::test]
    async fn rejects_zero_caps() {
        let (_, registry) = registry(Duration::from_secs(30));
        let update = RiskLimitsUpdate {
            max_position_size: Some(Decimal::ZERO),
            ..Default::default()
        };
        let result = registry.set_limits(&UserId::new("alice"), &update).await;
        assert!(matches!(result, Err(RiskLimitError::Invalid("max_position_size", _))));
    }

    #[tokio::test]
    async fn cache_serves_until_ttl_expires() {
        let (store, registry) = registry(Duration::from_secs(3600));
        let user = UserId::new("alice");
        registry.get_limits(&user).await.unwrap();

        // a write that bypasses this registry stays invisible while cached
        let other = RiskLimits {
            max_open_positions: 1,
            ..RiskLimits::default()
        };
        store.put_limits(&user, other.clone()).await.unwrap();
        assert_eq!(registry.get_limits(&user).await.unwrap().max_open_positions, 10);

        let fresh = RiskLimitRegistry::new(store.clone(), RiskLimits::default(), Duration::ZERO);
        assert_eq!(fresh.get_limits(&user).await.unwrap(), other);
    }
}
