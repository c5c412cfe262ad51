// 7.0 config.rs: all engine settings in one place. fees, task intervals, timeouts, limits.
// 7.1 from_env lets a deployment override the timing knobs without a rebuild.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::liquidation::LiquidationParams;
use crate::market::{MarketError, SymbolTable};
use crate::risk::{RiskLimitError, RiskLimits};
use crate::types::{Bps, Symbol};

// Liquidation scanner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    // Time between scans
    pub interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/** 7.2: volatility monitor. alerts when |24h change| > threshold */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityConfig {
    pub interval: Duration,
    // Absolute 24h change that triggers an alert (0.10 = 10%)
    pub threshold: Decimal,
    pub symbols: Vec<Symbol>,
    // Minimum gap between two alerts for the same symbol
    pub alert_cooldown: Duration,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            threshold: dec!(0.10),
            symbols: vec![
                Symbol::new("BTC/USDT"),
                Symbol::new("ETH/USDT"),
                Symbol::new("SOL/USDT"),
            ],
            alert_cooldown: Duration::from_secs(60),
        }
    }
}

// Backoff for transient failures on request paths. doubles per attempt up to max_backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/** 7.3: the whole engine configuration */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Currency margin is locked and released in
    pub settlement_currency: String,
    pub liquidation: LiquidationParams,
    pub scanner: ScannerConfig,
    pub volatility: VolatilityConfig,
    // Upper bound on any single oracle or balance call
    pub call_timeout: Duration,
    pub retry: RetryConfig,
    // How long a user's limits may be served from cache
    pub risk_limits_ttl: Duration,
    // Limits for users with no stored record
    pub default_limits: RiskLimits,
    pub symbols: SymbolTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settlement_currency: "USDT".to_string(),
            liquidation: LiquidationParams::default(),
            scanner: ScannerConfig::default(),
            volatility: VolatilityConfig::default(),
            call_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
            risk_limits_ttl: Duration::from_secs(30),
            default_limits: RiskLimits::default(),
            symbols: SymbolTable::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, with overrides from the MARGIN_* environment variables.
    /// unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_var::<u64>(&lookup, "MARGIN_SCAN_INTERVAL_MS") {
            self.scanner.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MARGIN_VOLATILITY_INTERVAL_MS") {
            self.volatility.interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var::<Decimal>(&lookup, "MARGIN_VOLATILITY_THRESHOLD") {
            self.volatility.threshold = threshold;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MARGIN_CALL_TIMEOUT_MS") {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(bps) = parse_var::<i32>(&lookup, "MARGIN_LIQUIDATION_FEE_BPS") {
            self.liquidation.fee = Bps::new(bps);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fee = self.liquidation.fee.value();
        if !(0..10_000).contains(&fee) {
            return Err(ConfigError::InvalidFee(fee));
        }
        if self.liquidation.at_risk_buffer < Decimal::ONE {
            return Err(ConfigError::InvalidAtRiskBuffer(self.liquidation.at_risk_buffer));
        }
        if self.volatility.threshold <= Decimal::ZERO {
            return Err(ConfigError::InvalidThreshold(self.volatility.threshold));
        }
        for (name, interval) in [
            ("scanner.interval", self.scanner.interval),
            ("volatility.interval", self.volatility.interval),
            ("call_timeout", self.call_timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.settlement_currency.trim().is_empty() {
            return Err(ConfigError::EmptyCurrency);
        }
        self.default_limits.validate()?;
        self.symbols.validate()?;
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable config override");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Liquidation fee {0} bps must be in [0, 10000)")]
    InvalidFee(i32),

    #[error("At-risk buffer {0} must be at least 1")]
    InvalidAtRiskBuffer(Decimal),

    #[error("Volatility threshold {0} must be positive")]
    InvalidThreshold(Decimal),

    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),

    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("Settlement currency is empty")]
    EmptyCurrency,

    #[error("Default limits: {0}")]
    Limits(#[from] RiskLimitError),

    #[error("Symbol table: {0}")]
    Symbols(#[from] MarketError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::SymbolParams;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.liquidation.fee.as_fraction(), dec!(0.005));
        assert_eq!(config.scanner.interval, Duration::from_secs(10));
        assert_eq!(config.volatility.interval, Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.liquidation.fee = Bps::new(10_000);
        assert_eq!(config.validate(), Err(ConfigError::InvalidFee(10_000)));

        let mut config = EngineConfig::default();
        config.scanner.interval = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration("scanner.interval")));

        let mut config = EngineConfig::default();
        config.symbols = SymbolTable::default().with_symbol("BTC/USDT", SymbolParams::new(125, dec!(0.01)));
        assert!(matches!(config.validate(), Err(ConfigError::Symbols(_))));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("MARGIN_SCAN_INTERVAL_MS", "250"),
            ("MARGIN_VOLATILITY_THRESHOLD", "0.05"),
            ("MARGIN_CALL_TIMEOUT_MS", "not-a-number"),
            ("MARGIN_LIQUIDATION_FEE_BPS", "75"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.scanner.interval, Duration::from_millis(250));
        assert_eq!(config.volatility.threshold, dec!(0.05));
        assert_eq!(config.call_timeout, Duration::from_secs(2));
        assert_eq!(config.liquidation.fee.value(), 75);
    }

    #[test]
    fn config_survives_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.volatility, config.volatility);
        assert!(back.validate().is_ok());
    }
}
