// 9.2 custody.rs: the balance service seam. the engine never edits balances itself,
// it asks custody to lock and release margin. InMemoryCustody is the mocked one.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::types::{Quote, UserId};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CustodyError {
    #[error("Balance service unavailable")]
    Unavailable,

    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Quote, required: Quote },

    #[error("Cannot release {requested}, only {locked} locked")]
    InsufficientLocked { locked: Quote, requested: Quote },

    #[error("Release of {0} would debit the available balance")]
    NegativeRelease(Quote),

    #[error("Currency {0} is not held")]
    UnknownCurrency(String),

    #[error("Amount {0} must be positive")]
    InvalidAmount(Quote),
}

impl CustodyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CustodyError::Unavailable)
    }
}

#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn available_balance(&self, user_id: &UserId, currency: &str) -> Result<Quote, CustodyError>;

    /// Move `amount` from available to locked. atomic: either all of it moves or nothing does.
    async fn lock_margin(&self, user_id: &UserId, amount: Quote) -> Result<(), CustodyError>;

    /// Unlock `amount` and credit `amount + pnl_adjustment` to available.
    async fn release_margin(
        &self,
        user_id: &UserId,
        amount: Quote,
        pnl_adjustment: Quote,
    ) -> Result<(), CustodyError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub available: Quote,
    pub locked: Quote,
}

/// Single-currency balances kept in process.
#[derive(Debug)]
pub struct InMemoryCustody {
    currency: String,
    holdings: Mutex<HashMap<UserId, Holding>>,
    available: AtomicBool,
    failing_releases: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryCustody {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            holdings: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_releases: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn deposit(&self, user_id: &UserId, amount: Quote) {
        let mut holdings = self.lock();
        let holding = holdings.entry(user_id.clone()).or_default();
        holding.available = holding.available.add(amount);
    }

    pub fn holding(&self, user_id: &UserId) -> Holding {
        self.lock().get(user_id).copied().unwrap_or_default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Refuse the next `count` releases as unavailable, leaving locks and reads alone.
    pub fn fail_next_releases(&self, count: usize) {
        self.failing_releases.store(count, Ordering::SeqCst);
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    async fn check(&self) -> Result<(), CustodyError> {
        let delay = *self.delay.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CustodyError::Unavailable)
        }
    }

    // poisoning only follows a panic inside one of the short sections below
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Holding>> {
        self.holdings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BalanceService for InMemoryCustody {
    async fn available_balance(&self, user_id: &UserId, currency: &str) -> Result<Quote, CustodyError> {
        self.check().await?;
        if !currency.eq_ignore_ascii_case(&self.currency) {
            return Err(CustodyError::UnknownCurrency(currency.to_string()));
        }
        Ok(self.holding(user_id).available)
    }

    async fn lock_margin(&self, user_id: &UserId, amount: Quote) -> Result<(), CustodyError> {
        self.check().await?;
        if amount.value() <= Decimal::ZERO {
            return Err(CustodyError::InvalidAmount(amount));
        }
        let mut holdings = self.lock();
        let holding = holdings.entry(user_id.clone()).or_default();
        if holding.available < amount {
            return Err(CustodyError::InsufficientBalance {
                available: holding.available,
                required: amount,
            });
        }
        holding.available = holding.available.sub(amount);
        holding.locked = holding.locked.add(amount);
        Ok(())
    }

    async fn release_margin(
        &self,
        user_id: &UserId,
        amount: Quote,
        pnl_adjustment: Quote,
    ) -> Result<(), CustodyError> {
        self.check().await?;
        let refused = self
            .failing_releases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(CustodyError::Unavailable);
        }
        let credit = amount.add(pnl_adjustment);
        if credit.is_negative() {
            return Err(CustodyError::NegativeRelease(credit));
        }
        let mut holdings = self.lock();
        let holding = holdings.entry(user_id.clone()).or_default();
        if holding.locked < amount {
            return Err(CustodyError::InsufficientLocked {
                locked: holding.locked,
                requested: amount,
            });
        }
        holding.locked = holding.locked.sub(amount);
        holding.available = holding.available.add(credit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn funded(amount: Decimal) -> (InMemoryCustody, UserId) {
        let custody = InMemoryCustody::new("USDT");
        let user = UserId::new("alice");
        custody.deposit(&user, Quote::new(amount));
        (custody, user)
    }

    #[tokio::test]
    async fn lock_then_release_with_profit() {
        let (custody, user) = funded(dec!(10_000));
        custody.lock_margin(&user, Quote::new(dec!(4500))).await.unwrap();
        assert_eq!(custody.holding(&user).locked.value(), dec!(4500));
        assert_eq!(custody.available_balance(&user, "usdt").await.unwrap().value(), dec!(5500));

        custody
            .release_margin(&user, Quote::new(dec!(4500)), Quote::new(dec!(1000)))
            .await
            .unwrap();
        let holding = custody.holding(&user);
        assert_eq!(holding.locked, Quote::zero());
        assert_eq!(holding.available.value(), dec!(11_000));
    }

    #[tokio::test]
    async fn lock_refuses_more_than_available() {
        let (custody, user) = funded(dec!(500));
        let result = custody.lock_margin(&user, Quote::new(dec!(600))).await;
        assert!(matches!(result, Err(CustodyError::InsufficientBalance { .. })));
        assert_eq!(custody.holding(&user).available.value(), dec!(500));
    }

    #[tokio::test]
    async fn release_never_debits() {
        let (custody, user) = funded(dec!(1000));
        custody.lock_margin(&user, Quote::new(dec!(1000))).await.unwrap();
        let result = custody
            .release_margin(&user, Quote::new(dec!(1000)), Quote::new(dec!(-1200)))
            .await;
        assert!(matches!(result, Err(CustodyError::NegativeRelease(_))));

        custody
            .release_margin(&user, Quote::new(dec!(1000)), Quote::new(dec!(-1000)))
            .await
            .unwrap();
        assert_eq!(custody.holding(&user), Holding::default());
    }

    #[tokio::test]
    async fn injected_release_failure_leaves_lock_in_place() {
        let (custody, user) = funded(dec!(1000));
        custody.lock_margin(&user, Quote::new(dec!(400))).await.unwrap();
        custody.fail_next_releases(1);

        let refused = custody.release_margin(&user, Quote::new(dec!(400)), Quote::zero()).await;
        assert_eq!(refused, Err(CustodyError::Unavailable));
        assert_eq!(custody.holding(&user).locked.value(), dec!(400));

        custody.release_margin(&user, Quote::new(dec!(400)), Quote::zero()).await.unwrap();
        assert_eq!(custody.holding(&user).available.value(), dec!(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_holds_the_answer_back() {
        let (custody, user) = funded(dec!(1000));
        custody.set_delay(Some(Duration::from_secs(5)));
        let started = tokio::time::Instant::now();
        custody.available_balance(&user, "USDT").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn outage_is_transient() {
        let (custody, user) = funded(dec!(1000));
        custody.set_available(false);
        let err = custody.available_balance(&user, "USDT").await.unwrap_err();
        assert!(err.is_transient());
    }
}
