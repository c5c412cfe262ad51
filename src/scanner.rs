//! Liquidation scanner.
//!
//! One pass marks every open position to market and liquidates the ones at or
//! below maintenance. The decision step, `plan_scan`, is a pure function of
//! the open positions and the marks fetched for this pass; `scan_once` does
//! the I/O around it. A symbol the oracle cannot price is skipped for the
//! pass, its positions keep their last persisted PnL.

use crate::engine::{Engine, EngineError, LiquidationResult};
use crate::liquidation::{assess_position, LiquidationParams, RiskStatus};
use crate::position::Position;
use crate::task::{spawn_periodic, TaskHandle};
use crate::types::{PositionId, Price, Quote, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScanAction {
    /// Persist the new unrealized PnL, nothing else.
    Hold {
        position_id: PositionId,
        mark: Price,
        unrealized_pnl: Quote,
        status: RiskStatus,
    },
    Liquidate {
        position_id: PositionId,
        mark: Price,
        unrealized_pnl: Quote,
    },
    Unpriced {
        position_id: PositionId,
        symbol: Symbol,
    },
}

pub fn plan_scan(
    positions: &[Position],
    marks: &HashMap<Symbol, Price>,
    params: &LiquidationParams,
) -> Vec<ScanAction> {
    positions
        .iter()
        .filter(|p| p.is_open())
        .map(|position| {
            let Some(&mark) = marks.get(&position.symbol) else {
                return ScanAction::Unpriced {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                };
            };
            let assessment = assess_position(position, mark, params);
            let unrealized_pnl = assessment.unrealized_pnl.rounded();
            match assessment.status {
                RiskStatus::Liquidatable => ScanAction::Liquidate {
                    position_id: position.id,
                    mark,
                    unrealized_pnl,
                },
                status => ScanAction::Hold {
                    position_id: position.id,
                    mark,
                    unrealized_pnl,
                    status,
                },
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub marked: usize,
    pub at_risk: usize,
    pub unpriced: usize,
    /// Positions that left open between the read and the write, e.g. closed by their owner.
    pub skipped: usize,
    pub failed: usize,
    pub liquidated: Vec<LiquidationResult>,
}

#[derive(Clone)]
pub struct LiquidationScanner {
    engine: Engine,
}

impl LiquidationScanner {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn scan_once(&self) -> Result<ScanReport, EngineError> {
        let positions = self.engine.open_positions().await?;
        let marks = self.engine.fetch_marks(&positions).await;
        let actions = plan_scan(&positions, &marks, &self.engine.config().liquidation);

        let mut report = ScanReport {
            scanned: positions.len(),
            ..ScanReport::default()
        };

        for action in actions {
            match action {
                ScanAction::Unpriced { position_id, symbol } => {
                    tracing::warn!(position_id = %position_id, symbol = %symbol, "position not priced this cycle");
                    report.unpriced += 1;
                }
                ScanAction::Hold {
                    position_id,
                    unrealized_pnl,
                    status,
                    ..
                } => {
                    if status == RiskStatus::AtRisk {
                        report.at_risk += 1;
                    }
                    self.mark(position_id, unrealized_pnl, &mut report).await;
                }
                ScanAction::Liquidate {
                    position_id,
                    mark,
                    unrealized_pnl,
                } => {
                    self.mark(position_id, unrealized_pnl, &mut report).await;
                    match self.engine.liquidate_position(position_id, mark).await {
                        Ok(result) => report.liquidated.push(result),
                        Err(EngineError::AlreadyClosed { .. }) | Err(EngineError::NotLiquidatable { .. }) => {
                            report.skipped += 1;
                        }
                        Err(e) => {
                            tracing::error!(position_id = %position_id, mark = %mark, error = %e, "liquidation failed");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        tracing::debug!(
            scanned = report.scanned,
            marked = report.marked,
            at_risk = report.at_risk,
            liquidated = report.liquidated.len(),
            unpriced = report.unpriced,
            failed = report.failed,
            "scan complete"
        );
        Ok(report)
    }

    async fn mark(&self, position_id: PositionId, pnl: Quote, report: &mut ScanReport) {
        match self.engine.record_unrealized_pnl(position_id, pnl).await {
            Ok(true) => report.marked += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                tracing::warn!(position_id = %position_id, error = %e, "mark-to-market write failed");
                report.failed += 1;
            }
        }
    }

    pub fn spawn(self, interval: Duration) -> TaskHandle {
        spawn_periodic("liquidation-scanner", interval, move || {
            let scanner = self.clone();
            async move {
                if let Err(e) = scanner.scan_once().await {
                    tracing::error!(error = %e, "scan aborted, retrying next interval");
                }
            }
        })
    }
}

impl Engine {
    /// Start the scanner on the configured interval.
    pub fn start_liquidation_scanner(&self) -> TaskHandle {
        LiquidationScanner::new(self.clone()).spawn(self.config().scanner.interval)
    }
}
