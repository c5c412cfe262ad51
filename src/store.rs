//! Durable state behind the engine.
//!
//! Positions, futures contracts, the liquidation ledger, per-user risk limits
//! and the manual review queue. The traits are the contract a real database
//! implementation has to honour; `MemoryStore` is the in-process one used by
//! tests and the simulation binary.
//!
//! Terminal transitions are compare-and-swap on status: a write only lands if
//! the row is still open. Liquidation writes the status change and the ledger
//! entry as one unit.

use crate::contract::{ContractStatus, FuturesContract};
use crate::events::{LiquidationEvent, ReviewRecord};
use crate::position::{Position, PositionStatus};
use crate::risk::RiskLimits;
use crate::types::{ContractId, PositionId, Price, Quote, Symbol, Timestamp, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Position {id} is {status}, not open")]
    NotOpen { id: PositionId, status: PositionStatus },

    #[error("Position {0} already exists")]
    DuplicatePosition(PositionId),

    #[error("Contract {0} already exists")]
    DuplicateContract(Symbol),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn insert_position(&self, position: Position) -> Result<(), StoreError>;

    async fn get_position(&self, id: PositionId) -> Result<Option<Position>, StoreError>;

    async fn open_positions(&self) -> Result<Vec<Position>, StoreError>;

    async fn positions_for_user(&self, user_id: &UserId) -> Result<Vec<Position>, StoreError>;

    async fn count_open_for_user(&self, user_id: &UserId) -> Result<usize, StoreError>;

    /// Mark-to-market write. returns false, and writes nothing, if the position is no longer open.
    async fn update_unrealized_pnl(&self, id: PositionId, pnl: Quote) -> Result<bool, StoreError>;

    /// open -> closed, only if still open.
    async fn close_position(
        &self,
        id: PositionId,
        exit_price: Price,
        realized_pnl: Quote,
        closed_at: Timestamp,
    ) -> Result<Position, StoreError>;

    /// open -> liquidated plus the ledger append, only if still open.
    async fn liquidate_position(
        &self,
        id: PositionId,
        exit_price: Price,
        realized_pnl: Quote,
        event: LiquidationEvent,
    ) -> Result<Position, StoreError>;

    /// Revert a terminal write: put back `snapshot`, the open row as read before settling,
    /// and drop any ledger entry for it. a row that is already open is left as is.
    async fn reopen_position(&self, snapshot: Position) -> Result<(), StoreError>;

    async fn liquidation_events(&self) -> Result<Vec<LiquidationEvent>, StoreError>;

    async fn flag_for_review(&self, record: ReviewRecord) -> Result<(), StoreError>;

    async fn review_queue(&self) -> Result<Vec<ReviewRecord>, StoreError>;
}

#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Fails with `DuplicateContract` if the symbol is taken.
    async fn insert_contract(&self, contract: FuturesContract) -> Result<(), StoreError>;

    async fn contract_by_symbol(&self, symbol: &Symbol) -> Result<Option<FuturesContract>, StoreError>;

    async fn contracts(&self) -> Result<Vec<FuturesContract>, StoreError>;

    /// Flip every active contract with expiry <= now to expired. returns the ones flipped.
    async fn expire_contracts(&self, now: Timestamp) -> Result<Vec<FuturesContract>, StoreError>;
}

#[async_trait]
pub trait RiskLimitStore: Send + Sync {
    async fn get_limits(&self, user_id: &UserId) -> Result<Option<RiskLimits>, StoreError>;

    async fn put_limits(&self, user_id: &UserId, limits: RiskLimits) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct State {
    positions: HashMap<PositionId, Position>,
    contracts: HashMap<ContractId, FuturesContract>,
    contract_symbols: HashMap<Symbol, ContractId>,
    liquidations: Vec<LiquidationEvent>,
    limits: HashMap<UserId, RiskLimits>,
    review: Vec<ReviewRecord>,
}

/// Single-lock in-memory store. every trait method is one critical section.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<State>,
    available: AtomicBool,
    failing_writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage. every call fails with `Unavailable` until turned back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` writes, leaving reads alone.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store offline".to_string()))
        }
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.check_read()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("write rejected".to_string())),
            Err(_) => Ok(()),
        }
    }
}

fn transition(
    state: &mut State,
    id: PositionId,
    status: PositionStatus,
    exit_price: Price,
    realized_pnl: Quote,
    at: Timestamp,
) -> Result<Position, StoreError> {
    let position = state
        .positions
        .get_mut(&id)
        .ok_or(StoreError::PositionNotFound(id))?;
    match position.settle(status, exit_price, realized_pnl, at) {
        Ok(()) => Ok(position.clone()),
        Err(_) => Err(StoreError::NotOpen {
            id,
            status: position.status,
        }),
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn insert_position(&self, position: Position) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        if state.positions.contains_key(&position.id) {
            return Err(StoreError::DuplicatePosition(position.id));
        }
        state.positions.insert(position.id, position);
        Ok(())
    }

    async fn get_position(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().await.positions.get(&id).cloned())
    }

    async fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.check_read()?;
        let state = self.state.read().await;
        let mut open: Vec<Position> = state
            .positions
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| (p.opened_at, p.id));
        Ok(open)
    }

    async fn positions_for_user(&self, user_id: &UserId) -> Result<Vec<Position>, StoreError> {
        self.check_read()?;
        let state = self.state.read().await;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| &p.user_id == user_id)
            .cloned()
            .collect();
        positions.sort_by_key(|p| (p.opened_at, p.id));
        Ok(positions)
    }

    async fn count_open_for_user(&self, user_id: &UserId) -> Result<usize, StoreError> {
        self.check_read()?;
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .filter(|p| &p.user_id == user_id && p.is_open())
            .count())
    }

    async fn update_unrealized_pnl(&self, id: PositionId, pnl: Quote) -> Result<bool, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        match state.positions.get_mut(&id) {
            Some(position) if position.is_open() => {
                position.unrealized_pnl = pnl.rounded();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::PositionNotFound(id)),
        }
    }

    async fn close_position(
        &self,
        id: PositionId,
        exit_price: Price,
        realized_pnl: Quote,
        closed_at: Timestamp,
    ) -> Result<Position, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        transition(&mut state, id, PositionStatus::Closed, exit_price, realized_pnl, closed_at)
    }

    async fn liquidate_position(
        &self,
        id: PositionId,
        exit_price: Price,
        realized_pnl: Quote,
        event: LiquidationEvent,
    ) -> Result<Position, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let position = transition(
            &mut state,
            id,
            PositionStatus::Liquidated,
            exit_price,
            realized_pnl,
            event.timestamp,
        )?;
        state.liquidations.push(event);
        Ok(position)
    }

    async fn reopen_position(&self, snapshot: Position) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let id = snapshot.id;
        let current = state
            .positions
            .get_mut(&id)
            .ok_or(StoreError::PositionNotFound(id))?;
        if current.is_open() {
            return Ok(());
        }
        *current = snapshot;
        state.liquidations.retain(|event| event.position_id != id);
        Ok(())
    }

    async fn liquidation_events(&self) -> Result<Vec<LiquidationEvent>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().await.liquidations.clone())
    }

    async fn flag_for_review(&self, record: ReviewRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.write().await.review.push(record);
        Ok(())
    }

    async fn review_queue(&self) -> Result<Vec<ReviewRecord>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().await.review.clone())
    }
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn insert_contract(&self, contract: FuturesContract) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        if state.contract_symbols.contains_key(&contract.symbol) {
            return Err(StoreError::DuplicateContract(contract.symbol));
        }
        state.contract_symbols.insert(contract.symbol.clone(), contract.id);
        state.contracts.insert(contract.id, contract);
        Ok(())
    }

    async fn contract_by_symbol(&self, symbol: &Symbol) -> Result<Option<FuturesContract>, StoreError> {
        self.check_read()?;
        let state = self.state.read().await;
        Ok(state
            .contract_symbols
            .get(symbol)
            .and_then(|id| state.contracts.get(id))
            .cloned())
    }

    async fn contracts(&self) -> Result<Vec<FuturesContract>, StoreError> {
        self.check_read()?;
        let state = self.state.read().await;
        let mut contracts: Vec<FuturesContract> = state.contracts.values().cloned().collect();
        contracts.sort_by_key(|c| (c.expiry, c.symbol.clone()));
        Ok(contracts)
    }

    async fn expire_contracts(&self, now: Timestamp) -> Result<Vec<FuturesContract>, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let mut expired = Vec::new();
        for contract in state.contracts.values_mut() {
            if contract.status == ContractStatus::Active && contract.expiry <= now {
                contract.status = ContractStatus::Expired;
                expired.push(contract.clone());
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl RiskLimitStore for MemoryStore {
    async fn get_limits(&self, user_id: &UserId) -> Result<Option<RiskLimits>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().await.limits.get(user_id).cloned())
    }

    async fn put_limits(&self, user_id: &UserId, limits: RiskLimits) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.write().await.limits.insert(user_id.clone(), limits);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractSpec;
    use crate::types::{Leverage, Side};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn position(user: &str) -> Position {
        Position::open_margin(
            UserId::new(user),
            Symbol::new("BTC/USDT"),
            Side::Long,
            dec!(1),
            Price::new_unchecked(dec!(45000)),
            Leverage::new(10).unwrap(),
            dec!(0.005),
            Timestamp::from_millis(0),
        )
    }

    fn event_for(position: &Position, price: Price) -> LiquidationEvent {
        LiquidationEvent {
            id: Uuid::new_v4(),
            position_id: position.id,
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.size,
            liquidation_price: price,
            liquidation_value: position.notional_at(price),
            liquidation_fee: Quote::new(dec!(203.5)),
            timestamp: Timestamp::from_millis(5),
        }
    }

    #[tokio::test]
    async fn close_is_compare_and_swap() {
        let store = MemoryStore::new();
        let pos = position("alice");
        let id = pos.id;
        store.insert_position(pos).await.unwrap();

        let exit = Price::new_unchecked(dec!(46000));
        let closed = store
            .close_position(id, exit, Quote::new(dec!(1000)), Timestamp::from_millis(1))
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);

        let second = store
            .close_position(id, exit, Quote::new(dec!(1000)), Timestamp::from_millis(2))
            .await;
        assert_eq!(
            second,
            Err(StoreError::NotOpen {
                id,
                status: PositionStatus::Closed
            })
        );
    }

    #[tokio::test]
    async fn liquidation_appends_ledger_only_on_success() {
        let store = MemoryStore::new();
        let pos = position("alice");
        let id = pos.id;
        store.insert_position(pos.clone()).await.unwrap();

        let mark = Price::new_unchecked(dec!(40700));
        store
            .liquidate_position(id, mark, Quote::new(dec!(-4503.5)), event_for(&pos, mark))
            .await
            .unwrap();
        let again = store
            .liquidate_position(id, mark, Quote::new(dec!(-4503.5)), event_for(&pos, mark))
            .await;

        assert!(matches!(again, Err(StoreError::NotOpen { .. })));
        assert_eq!(store.liquidation_events().await.unwrap().len(), 1);
        assert!(store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopen_restores_row_and_drops_ledger_entry() {
        let store = MemoryStore::new();
        let mut pos = position("alice");
        pos.unrealized_pnl = Quote::new(dec!(-4200));
        let id = pos.id;
        store.insert_position(pos.clone()).await.unwrap();

        let mark = Price::new_unchecked(dec!(40700));
        store
            .liquidate_position(id, mark, Quote::new(dec!(-4503.5)), event_for(&pos, mark))
            .await
            .unwrap();
        store.reopen_position(pos.clone()).await.unwrap();

        assert_eq!(store.get_position(id).await.unwrap(), Some(pos.clone()));
        assert!(store.liquidation_events().await.unwrap().is_empty());

        // already open, nothing to revert
        store.reopen_position(pos).await.unwrap();
        assert_eq!(store.count_open_for_user(&UserId::new("alice")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mark_to_market_skips_terminal_rows() {
        let store = MemoryStore::new();
        let pos = position("alice");
        let id = pos.id;
        store.insert_position(pos).await.unwrap();

        assert!(store.update_unrealized_pnl(id, Quote::new(dec!(-10))).await.unwrap());
        store
            .close_position(id, Price::new_unchecked(dec!(44990)), Quote::new(dec!(-10)), Timestamp::from_millis(1))
            .await
            .unwrap();
        assert!(!store.update_unrealized_pnl(id, Quote::new(dec!(-20))).await.unwrap());
    }

    #[tokio::test]
    async fn counts_open_per_user() {
        let store = MemoryStore::new();
        store.insert_position(position("alice")).await.unwrap();
        store.insert_position(position("alice")).await.unwrap();
        store.insert_position(position("bob")).await.unwrap();

        assert_eq!(store.count_open_for_user(&UserId::new("alice")).await.unwrap(), 2);
        assert_eq!(store.positions_for_user(&UserId::new("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outage_and_injected_write_failures() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.open_positions().await, Err(StoreError::Unavailable(_))));
        store.set_available(true);

        store.fail_next_writes(1);
        let first = store.insert_position(position("alice")).await;
        assert!(first.as_ref().is_err_and(|e| e.is_transient()));
        assert!(store.insert_position(position("alice")).await.is_ok());
        assert_eq!(store.open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contracts_unique_by_symbol_and_expire() {
        let store = MemoryStore::new();
        let spec = ContractSpec {
            symbol: Symbol::new("ETH-0628"),
            underlying: Symbol::new("ETH/USDT"),
            expiry: Timestamp::from_millis(1_000),
            contract_size: dec!(1),
            tick_size: dec!(0.5),
            margin_requirement_ratio: dec!(0.1),
        };
        store
            .insert_contract(spec.clone().into_contract(Timestamp::from_millis(0)))
            .await
            .unwrap();
        let dup = store
            .insert_contract(spec.into_contract(Timestamp::from_millis(0)))
            .await;
        assert!(matches!(dup, Err(StoreError::DuplicateContract(_))));

        assert!(store.expire_contracts(Timestamp::from_millis(999)).await.unwrap().is_empty());
        let expired = store.expire_contracts(Timestamp::from_millis(1_000)).await.unwrap();
        assert_eq!(expired.len(), 1);

        let stored = store
            .contract_by_symbol(&Symbol::new("eth-0628"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ContractStatus::Expired);
    }
}
