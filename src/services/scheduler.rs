use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::ServiceError;

use super::lots::{LotRegistry, LotSweepReport};
use super::reservations::{ReservationService, ReservationSweepReport};
use super::stock_ledger::{LowStockItem, StockLedger};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub lots: LotSweepReport,
    pub reservations: ReservationSweepReport,
    pub low_stock: Vec<LowStockItem>,
}

/// Periodically expires lots and reservations, then checks reorder thresholds.
pub struct ExpirySweeper {
    lots: Arc<LotRegistry>,
    reservations: Arc<ReservationService>,
    stock: Arc<StockLedger>,
    low_stock_thresholds: BTreeMap<Uuid, Decimal>,
    clock: Arc<dyn Clock>,
    lot_interval: Duration,
    reservation_interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        lots: Arc<LotRegistry>,
        reservations: Arc<ReservationService>,
        stock: Arc<StockLedger>,
        low_stock_thresholds: BTreeMap<Uuid, Decimal>,
        clock: Arc<dyn Clock>,
        lot_interval: Duration,
        reservation_interval: Duration,
    ) -> Self {
        Self {
            lots,
            reservations,
            stock,
            low_stock_thresholds,
            clock,
            lot_interval,
            reservation_interval,
        }
    }

    /// One pass of both sweeps. Lots go first so reservations released in the
    /// same pass see current lot status; the low-stock check runs last over
    /// the resulting availability.
    pub async fn run_once(&self) -> Result<SweepReport, ServiceError> {
        let lots = self.lots.sweep_expired().await?;
        let reservations = self.reservations.sweep_expired_reservations().await?;
        let low_stock = self.stock.check_low_stock(&self.low_stock_thresholds).await?;
        Ok(SweepReport {
            lots,
            reservations,
            low_stock,
        })
    }

    /// Runs both sweeps on their own intervals until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lot_tick = interval(self.lot_interval.max(MIN_INTERVAL));
            let mut reservation_tick = interval(self.reservation_interval.max(MIN_INTERVAL));
            lot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            reservation_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                lot_interval_secs = self.lot_interval.as_secs(),
                reservation_interval_secs = self.reservation_interval.as_secs(),
                "Expiry sweeper started"
            );

            loop {
                tokio::select! {
                    _ = lot_tick.tick() => {
                        match self.lots.sweep_expired().await {
                            Ok(report) if !report.expired.is_empty() || !report.alerts.is_empty() => {
                                info!(
                                    at = %self.clock.now(),
                                    expired = report.expired.len(),
                                    alerts = report.alerts.len(),
                                    "Lot sweep finished"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("lot expiry sweep failed: {}", e),
                        }
                        if let Err(e) = self.stock.check_low_stock(&self.low_stock_thresholds).await {
                            error!("low stock check failed: {}", e);
                        }
                    }
                    _ = reservation_tick.tick() => {
                        if let Err(e) = self.reservations.sweep_expired_reservations().await {
                            error!("reservation expiry sweep failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Expiry sweeper stopped");
        })
    }
}
