// 8.0 engine/core.rs: the engine handle. owns the collaborators, the symbol table and the locks.
// cheap to clone, every clone shares the same state.

use super::locks::KeyedLocks;
use super::results::EngineError;
use super::retry::with_retry;
use crate::config::{ConfigError, EngineConfig};
use crate::contract::FuturesContract;
use crate::custody::{BalanceService, CustodyError, InMemoryCustody};
use crate::events::{ChannelNotifier, LiquidationEvent, Notification, Notifier, ReviewRecord};
use crate::market::SymbolTable;
use crate::position::Position;
use crate::price_feed::{PriceOracle, StaticPriceOracle, TimedOracle};
use crate::risk::{self, RiskLimitRegistry};
use crate::store::{ContractStore, MemoryStore, PositionStore, RiskLimitStore};
use crate::types::{PositionId, Price, Quote, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// External collaborators the engine is wired to.
#[derive(Clone)]
pub struct Services {
    pub positions: Arc<dyn PositionStore>,
    pub contracts: Arc<dyn ContractStore>,
    pub limits: Arc<dyn RiskLimitStore>,
    pub oracle: Arc<dyn PriceOracle>,
    pub balances: Arc<dyn BalanceService>,
    pub notifier: Arc<dyn Notifier>,
}

/// Handles onto the in-memory collaborators built by `Engine::in_memory`.
pub struct InMemoryHandles {
    pub store: Arc<MemoryStore>,
    pub custody: Arc<InMemoryCustody>,
    pub oracle: Arc<StaticPriceOracle>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub clock: ManualClock,
}

/// Test clock. starts wherever it is set and only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(Arc::new(AtomicI64::new(start.as_millis())))
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, timestamp: Timestamp) {
        self.0.store(timestamp.as_millis(), Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Manual(ManualClock),
}

impl Clock {
    pub fn now(&self) -> Timestamp {
        match self {
            Clock::System => Timestamp::now(),
            Clock::Manual(clock) => clock.now(),
        }
    }
}

/** 8.1: main engine struct */
#[derive(Clone)]
pub struct Engine {
    pub(super) config: Arc<EngineConfig>,
    pub(super) symbols: Arc<SymbolTable>,
    pub(super) positions: Arc<dyn PositionStore>,
    pub(super) contracts: Arc<dyn ContractStore>,
    pub(super) risk: Arc<RiskLimitRegistry>,
    pub(super) oracle: Arc<dyn PriceOracle>,
    pub(super) balances: Arc<dyn BalanceService>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) position_locks: Arc<KeyedLocks<PositionId>>,
    pub(super) user_locks: Arc<KeyedLocks<UserId>>,
    pub(super) clock: Clock,
}

impl Engine {
    pub fn new(config: EngineConfig, services: Services) -> Result<Self, ConfigError> {
        config.validate()?;
        let risk = RiskLimitRegistry::new(
            services.limits,
            config.default_limits.clone(),
            config.risk_limits_ttl,
        );
        Ok(Self {
            symbols: Arc::new(config.symbols.clone()),
            oracle: Arc::new(TimedOracle::new(services.oracle, config.call_timeout)),
            positions: services.positions,
            contracts: services.contracts,
            risk: Arc::new(risk),
            balances: services.balances,
            notifier: services.notifier,
            position_locks: Arc::new(KeyedLocks::new()),
            user_locks: Arc::new(KeyedLocks::new()),
            clock: Clock::System,
            config: Arc::new(config),
        })
    }

    /// Engine over fresh in-memory collaborators, on a manual clock starting at `start`.
    pub fn in_memory(config: EngineConfig, start: Timestamp) -> Result<(Self, InMemoryHandles), ConfigError> {
        let store = Arc::new(MemoryStore::new());
        let custody = Arc::new(InMemoryCustody::new(config.settlement_currency.clone()));
        let oracle = Arc::new(StaticPriceOracle::new());
        let (notifier, notifications) = ChannelNotifier::new();
        let clock = ManualClock::new(start);

        let services = Services {
            positions: store.clone(),
            contracts: store.clone(),
            limits: store.clone(),
            oracle: oracle.clone(),
            balances: custody.clone(),
            notifier: Arc::new(notifier),
        };
        let engine = Engine::new(config, services)?.with_clock(Clock::Manual(clock.clone()));

        Ok((
            engine,
            InMemoryHandles {
                store,
                custody,
                oracle,
                notifications,
                clock,
            },
        ))
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn risk_limits(&self) -> &RiskLimitRegistry {
        &self.risk
    }

    pub fn oracle(&self) -> Arc<dyn PriceOracle> {
        self.oracle.clone()
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    pub async fn get_position(&self, id: PositionId) -> Result<Position, EngineError> {
        let positions = &self.positions;
        with_retry(&self.config.retry, "get_position", || async move {
            Ok(positions.get_position(id).await?)
        })
        .await?
        .ok_or(EngineError::PositionNotFound(id))
    }

    pub async fn positions_for_user(&self, user_id: &UserId) -> Result<Vec<Position>, EngineError> {
        let positions = &self.positions;
        with_retry(&self.config.retry, "positions_for_user", || async move {
            Ok(positions.positions_for_user(user_id).await?)
        })
        .await
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>, EngineError> {
        let positions = &self.positions;
        with_retry(&self.config.retry, "open_positions", || async move {
            Ok(positions.open_positions().await?)
        })
        .await
    }

    /// Mark-to-market write. false when the position left open in the meantime.
    pub(crate) async fn record_unrealized_pnl(&self, id: PositionId, pnl: Quote) -> Result<bool, EngineError> {
        Ok(self.positions.update_unrealized_pnl(id, pnl).await?)
    }

    pub async fn liquidation_events(&self) -> Result<Vec<LiquidationEvent>, EngineError> {
        Ok(self.positions.liquidation_events().await?)
    }

    pub async fn review_queue(&self) -> Result<Vec<ReviewRecord>, EngineError> {
        Ok(self.positions.review_queue().await?)
    }

    pub async fn contracts(&self) -> Result<Vec<FuturesContract>, EngineError> {
        Ok(self.contracts.contracts().await?)
    }

    /// Net realized PnL the user booked today, UTC.
    pub async fn realized_today(&self, user_id: &UserId) -> Result<Decimal, EngineError> {
        let positions = self.positions_for_user(user_id).await?;
        Ok(risk::realized_today(
            positions
                .iter()
                .filter(|p| !p.is_open())
                .map(|p| (&p.realized_pnl, p.closed_at)),
            self.now(),
        ))
    }

    pub(super) async fn mark_price(&self, symbol: &Symbol) -> Result<Price, EngineError> {
        let oracle = &self.oracle;
        with_retry(&self.config.retry, "mark_price", || async move {
            Ok(oracle.price(symbol).await?)
        })
        .await
    }

    /// Bounds a balance service call by the call timeout.
    pub(super) async fn balance_call<T>(
        &self,
        call: impl Future<Output = Result<T, CustodyError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::BalanceUnavailable(format!(
                "no answer within {:?}",
                self.config.call_timeout
            ))),
        }
    }

    pub(super) async fn publish(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(notification).await {
            tracing::warn!(notifier = self.notifier.name(), error = %e, "notification dropped");
        }
    }
}
