// 12.0: volatility monitor. watches 24h change on a fixed symbol set and alerts past the threshold.
// observational only, never touches positions. each symbol alerts at most once per cooldown.

use crate::config::VolatilityConfig;
use crate::engine::{Clock, Engine};
use crate::events::{Notification, Notifier, VolatilityAlert};
use crate::price_feed::PriceOracle;
use crate::task::{spawn_periodic, TaskHandle};
use crate::types::{Price, Symbol, Timestamp};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Alert when |change| is strictly above the threshold.
pub fn evaluate_volatility(
    symbol: &Symbol,
    price: Price,
    change_24h: Decimal,
    threshold: Decimal,
    now: Timestamp,
) -> Option<VolatilityAlert> {
    if change_24h.abs() > threshold {
        Some(VolatilityAlert {
            symbol: symbol.clone(),
            price,
            change_24h,
            threshold,
            timestamp: now,
        })
    } else {
        None
    }
}

#[derive(Clone)]
pub struct VolatilityMonitor {
    oracle: Arc<dyn PriceOracle>,
    notifier: Arc<dyn Notifier>,
    config: VolatilityConfig,
    clock: Clock,
    last_alert: Arc<Mutex<HashMap<Symbol, Timestamp>>>,
}

impl VolatilityMonitor {
    pub fn new(oracle: Arc<dyn PriceOracle>, notifier: Arc<dyn Notifier>, config: VolatilityConfig, clock: Clock) -> Self {
        Self {
            oracle,
            notifier,
            config,
            clock,
            last_alert: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_engine(engine: &Engine) -> Self {
        Self::new(
            engine.oracle(),
            engine.notifier(),
            engine.config().volatility.clone(),
            engine.clock().clone(),
        )
    }

    pub async fn check_once(&self) -> Vec<VolatilityAlert> {
        self.check_at(self.clock.now()).await
    }

    /// One pass over the symbol set. returns the alerts that were sent.
    pub async fn check_at(&self, now: Timestamp) -> Vec<VolatilityAlert> {
        let readings = join_all(self.config.symbols.iter().map(|symbol| async move {
            let (price, change) = tokio::join!(self.oracle.price(symbol), self.oracle.change_24h(symbol));
            (symbol, price.and_then(|p| change.map(|c| (p, c))))
        }))
        .await;

        let mut alerts = Vec::new();
        for (symbol, reading) in readings {
            let (price, change) = match reading {
                Ok(reading) => reading,
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "volatility check skipped");
                    continue;
                }
            };
            let Some(alert) = evaluate_volatility(symbol, price, change, self.config.threshold, now) else {
                continue;
            };
            if self.cooling_down(symbol, now) {
                tracing::debug!(symbol = %symbol, change_24h = %change, "alert suppressed by cooldown");
                continue;
            }
            alerts.push(alert);
        }

        for alert in &alerts {
            tracing::warn!(
                symbol = %alert.symbol,
                price = %alert.price,
                change_24h = %alert.change_24h,
                threshold = %alert.threshold,
                "volatility alert"
            );
            if let Err(e) = self.notifier.notify(Notification::Volatility(alert.clone())).await {
                tracing::warn!(notifier = self.notifier.name(), error = %e, "volatility alert dropped");
            }
        }
        alerts
    }

    /// Records `now` as the last alert unless the symbol alerted within the cooldown.
    fn cooling_down(&self, symbol: &Symbol, now: Timestamp) -> bool {
        let cooldown = i64::try_from(self.config.alert_cooldown.as_millis()).unwrap_or(i64::MAX);
        let mut last = self
            .last_alert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last.get(symbol) {
            Some(at) if at.elapsed_millis(&now) < cooldown => true,
            _ => {
                last.insert(symbol.clone(), now);
                false
            }
        }
    }

    pub fn spawn(self) -> TaskHandle {
        let interval = self.config.interval;
        spawn_periodic("volatility-monitor", interval, move || {
            let monitor = self.clone();
            async move {
                monitor.check_once().await;
            }
        })
    }
}

impl Engine {
    pub fn start_volatility_monitor(&self) -> TaskHandle {
        VolatilityMonitor::from_engine(self).spawn()
    }
}
