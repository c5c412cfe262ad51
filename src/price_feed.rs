// Price Feed Integration
//
// The engine consumes prices through the PriceOracle trait and never cares whether
// they come from an exchange aggregator, an on-chain oracle or a test fixture.
// Every call the engine makes goes through TimedOracle, so a slow source turns
// into a retryable error instead of a stuck caller.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::types::{Price, Symbol};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("No price for {0}")]
    NoPrice(Symbol),

    #[error("Price source for {0} unavailable")]
    Unavailable(Symbol),

    #[error("Price request for {symbol} timed out after {timeout:?}")]
    Timeout { symbol: Symbol, timeout: Duration },
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current mark price.
    async fn price(&self, symbol: &Symbol) -> Result<Price, OracleError>;

    /// 24h change as a signed fraction, -0.12 = down 12%.
    async fn change_24h(&self, symbol: &Symbol) -> Result<Decimal, OracleError>;
}

/// Bounds every call on the wrapped oracle by a timeout.
#[derive(Clone)]
pub struct TimedOracle {
    inner: Arc<dyn PriceOracle>,
    timeout: Duration,
}

impl TimedOracle {
    pub fn new(inner: Arc<dyn PriceOracle>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl PriceOracle for TimedOracle {
    async fn price(&self, symbol: &Symbol) -> Result<Price, OracleError> {
        tokio::time::timeout(self.timeout, self.inner.price(symbol))
            .await
            .map_err(|_| OracleError::Timeout {
                symbol: symbol.clone(),
                timeout: self.timeout,
            })?
    }

    async fn change_24h(&self, symbol: &Symbol) -> Result<Decimal, OracleError> {
        tokio::time::timeout(self.timeout, self.inner.change_24h(symbol))
            .await
            .map_err(|_| OracleError::Timeout {
                symbol: symbol.clone(),
                timeout: self.timeout,
            })?
    }
}

#[derive(Debug, Default)]
struct Quotes {
    prices: HashMap<Symbol, Price>,
    changes: HashMap<Symbol, Decimal>,
    failing: HashSet<Symbol>,
    delay: Option<Duration>,
}

/// Settable prices for tests and the simulator.
#[derive(Debug, Default)]
pub struct StaticPriceOracle {
    quotes: Mutex<Quotes>,
    price_calls: AtomicUsize,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: impl Into<Symbol>, price: Decimal) {
        if let Some(price) = Price::new(price) {
            self.quotes().prices.insert(symbol.into(), price);
        }
    }

    pub fn set_change(&self, symbol: impl Into<Symbol>, change: Decimal) {
        self.quotes().changes.insert(symbol.into(), change);
    }

    /// Make every call for `symbol` fail until cleared.
    pub fn set_failing(&self, symbol: impl Into<Symbol>, failing: bool) {
        let symbol = symbol.into();
        let mut quotes = self.quotes();
        if failing {
            quotes.failing.insert(symbol);
        } else {
            quotes.failing.remove(&symbol);
        }
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.quotes().delay = delay;
    }

    /// Number of `price` calls served so far.
    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }

    fn quotes(&self) -> std::sync::MutexGuard<'_, Quotes> {
        self.quotes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup<T: Copy>(
        &self,
        symbol: &Symbol,
        table: impl Fn(&Quotes) -> &HashMap<Symbol, T>,
    ) -> (Option<Duration>, Result<T, OracleError>) {
        let quotes = self.quotes();
        let result = if quotes.failing.contains(symbol) {
            Err(OracleError::Unavailable(symbol.clone()))
        } else {
            table(&*quotes)
                .get(symbol)
                .copied()
                .ok_or_else(|| OracleError::NoPrice(symbol.clone()))
        };
        (quotes.delay, result)
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn price(&self, symbol: &Symbol) -> Result<Price, OracleError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, result) = self.lookup(symbol, |q| &q.prices);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn change_24h(&self, symbol: &Symbol) -> Result<Decimal, OracleError> {
        let (delay, result) = self.lookup(symbol, |q| &q.changes);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}
