// 8.0: the position manager. opens and closes margin and futures positions, liquidates,
// and answers risk queries. every external effect goes through the store, custody,
// oracle and notifier seams held by Engine.

mod contracts;
mod core;
mod liquidations;
mod locks;
mod portfolio;
mod positions;
mod results;
mod retry;

pub use self::core::{Clock, Engine, InMemoryHandles, ManualClock, Services};
pub use locks::KeyedLocks;
pub use portfolio::{MarkSource, PortfolioRiskSummary, PositionRisk};
pub use results::{CloseResult, EngineError, LiquidationResult};
pub use retry::with_retry;
