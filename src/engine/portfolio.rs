// 8.4: per-user risk view. marks every open position, falls back to the last persisted pnl
// for symbols the oracle cannot price right now.

use super::core::Engine;
use super::results::EngineError;
use crate::liquidation::{assess_position, RiskStatus};
use crate::margin;
use crate::position::Position;
use crate::risk::RiskLimits;
use crate::types::{PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSource {
    Oracle,
    /// Implied from the last persisted unrealized PnL.
    LastKnown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRisk {
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Price,
    pub mark_price: Price,
    pub mark_source: MarkSource,
    pub liquidation_price: Price,
    pub margin: Quote,
    pub maintenance_margin: Quote,
    pub unrealized_pnl: Quote,
    pub equity: Quote,
    pub margin_ratio: Decimal,
    pub status: RiskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioRiskSummary {
    pub user_id: UserId,
    pub open_positions: usize,
    pub total_margin: Quote,
    pub total_notional: Quote,
    pub total_unrealized_pnl: Quote,
    /// Locked margin plus unrealized PnL across open positions.
    pub equity: Quote,
    /// Equity over notional at mark. None with nothing open.
    pub margin_ratio: Option<Decimal>,
    pub at_risk: Vec<PositionId>,
    pub realized_today: Quote,
    pub limits: RiskLimits,
    pub positions: Vec<PositionRisk>,
    pub generated_at: Timestamp,
}

impl Engine {
    pub async fn portfolio_risk_summary(&self, user_id: &UserId) -> Result<PortfolioRiskSummary, EngineError> {
        let all = self.positions_for_user(user_id).await?;
        let limits = self.risk.get_limits(user_id).await?;
        let now = self.now();

        let (open, closed): (Vec<Position>, Vec<Position>) = all.into_iter().partition(|p| p.is_open());
        let realized_today = crate::risk::realized_today(
            closed.iter().map(|p| (&p.realized_pnl, p.closed_at)),
            now,
        );

        let marks = self.fetch_marks(&open).await;
        let params = &self.config.liquidation;

        let positions: Vec<PositionRisk> = open
            .iter()
            .map(|position| {
                let (mark, source) = match marks.get(&position.symbol) {
                    Some(mark) => (*mark, MarkSource::Oracle),
                    None => (implied_mark(position), MarkSource::LastKnown),
                };
                let assessment = assess_position(position, mark, params);
                PositionRisk {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    side: position.side,
                    size: position.size,
                    entry_price: position.entry_price,
                    mark_price: mark,
                    mark_source: source,
                    liquidation_price: position.liquidation_price,
                    margin: position.margin_required,
                    maintenance_margin: position.maintenance_margin,
                    unrealized_pnl: assessment.unrealized_pnl.rounded(),
                    equity: assessment.equity.rounded(),
                    margin_ratio: assessment.margin_ratio,
                    status: assessment.status,
                }
            })
            .collect();

        let total_margin: Quote = positions.iter().map(|p| p.margin).sum();
        let total_unrealized_pnl: Quote = positions.iter().map(|p| p.unrealized_pnl).sum();
        let total_notional: Quote = open
            .iter()
            .zip(&positions)
            .map(|(position, risk)| position.notional_at(risk.mark_price).rounded())
            .sum();
        let equity = total_margin.add(total_unrealized_pnl);
        let margin_ratio = if total_notional.is_zero() {
            None
        } else {
            Some(equity.value() / total_notional.value())
        };
        let at_risk = positions
            .iter()
            .filter(|p| p.status != RiskStatus::Safe)
            .map(|p| p.position_id)
            .collect();

        Ok(PortfolioRiskSummary {
            user_id: user_id.clone(),
            open_positions: open.len(),
            total_margin,
            total_notional,
            total_unrealized_pnl,
            equity,
            margin_ratio,
            at_risk,
            realized_today: Quote::new(realized_today).rounded(),
            limits,
            positions,
            generated_at: now,
        })
    }

    /// One oracle call per distinct symbol, run concurrently. failed symbols are absent.
    pub(crate) async fn fetch_marks(&self, positions: &[Position]) -> HashMap<Symbol, Price> {
        let symbols: BTreeSet<&Symbol> = positions.iter().map(|p| &p.symbol).collect();
        let lookups = symbols.into_iter().map(|symbol| async move {
            (symbol, self.oracle.price(symbol).await)
        });

        let mut marks = HashMap::new();
        for (symbol, result) in join_all(lookups).await {
            match result {
                Ok(price) => {
                    marks.insert(symbol.clone(), price);
                }
                Err(e) => tracing::warn!(symbol = %symbol, error = %e, "no mark price this cycle"),
            }
        }
        marks
    }
}

/// Price at which the persisted unrealized PnL would hold.
fn implied_mark(position: &Position) -> Price {
    if position.size.is_zero() {
        return position.entry_price;
    }
    let offset = margin::saturating_div(position.side.sign() * position.unrealized_pnl.value(), position.size);
    Price::new(position.entry_price.value().saturating_add(offset)).unwrap_or(position.entry_price)
}
