// margin-engine: leveraged margin and futures positions with continuous liquidation.
// margin math is pure and decimal end to end. everything stateful sits behind a trait
// (store, custody, oracle, notifier) with an in-memory implementation alongside.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, Symbol, Side, Price, Quote, Leverage, Timestamp
//   2.x  market.rs: per-symbol leverage caps and maintenance rates
//   2.1  contract.rs: futures contract definitions and validation
//   3.x  margin.rs: notional, initial/maintenance margin, liquidation price, pnl
//   4.x  position.rs: position record and its one terminal transition
//   5.x  risk.rs: per-user limits, open-time checks, TTL-cached registry
//   6.x  liquidation.rs: eligibility, fee, settlement and shortfall
//   7.x  config.rs: engine settings, env overrides, validation
//   8.x  engine/: position manager: open, close, futures, liquidate, portfolio
//   9.x  price_feed.rs: oracle seam, timeout wrapper, static oracle
//   9.1  store.rs: position/contract/limit persistence seam, in-memory store
//   9.2  custody.rs: balance service seam, in-memory custody
//   10.x api.rs: command interface and error codes
//   11.x events.rs: liquidation ledger, alerts, review records, notifiers
//   12.x volatility.rs: 24h change monitor
//   13.x scanner.rs: periodic mark-to-market and liquidation pass
//   13.1 task.rs: cancellable periodic background tasks

// core modules
pub mod contract;
pub mod engine;
pub mod events;
pub mod liquidation;
pub mod margin;
pub mod market;
pub mod position;
pub mod risk;
pub mod types;

// background jobs
pub mod scanner;
pub mod task;
pub mod volatility;

// integration modules
pub mod api;
pub mod config;
pub mod custody;
pub mod price_feed;
pub mod store;

// re exports for convenience
pub use contract::*;
pub use engine::*;
pub use events::*;
pub use liquidation::*;
pub use margin::*;
pub use market::*;
pub use position::*;
pub use risk::*;
pub use types::*;
pub use api::{ApiError, CommandResponse, EngineCommand, ErrorCode};
pub use config::{ConfigError, EngineConfig, RetryConfig, ScannerConfig, VolatilityConfig};
pub use custody::{BalanceService, CustodyError, Holding, InMemoryCustody};
pub use price_feed::{OracleError, PriceOracle, StaticPriceOracle, TimedOracle};
pub use scanner::{plan_scan, LiquidationScanner, ScanAction, ScanReport};
pub use store::{ContractStore, MemoryStore, PositionStore, RiskLimitStore, StoreError};
pub use task::{spawn_periodic, TaskHandle};
pub use volatility::{evaluate_volatility, VolatilityMonitor};
