//! Inventory workflows.
//!
//! Each service owns one slice of the ledger and runs every operation inside
//! a single [`UnitOfWork`](crate::store::UnitOfWork). Events are published
//! only after the unit of work commits.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::store::{LedgerStore, UnitOfWork};

pub mod counting;
pub mod issuing;
pub mod locations;
pub mod lots;
pub mod movements;
pub mod receiving;
pub mod reservations;
pub mod scheduler;
pub mod stock_ledger;

pub use counting::InventoryCountService;
pub use issuing::GoodsIssueService;
pub use locations::LocationService;
pub use lots::LotRegistry;
pub use movements::{MovementContext, MovementLedger};
pub use receiving::ReceivingService;
pub use reservations::ReservationService;
pub use scheduler::ExpirySweeper;
pub use stock_ledger::StockLedger;

/// Tunables shared by the workflows.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_allocation_attempts: u32,
    pub retry_backoff: Duration,
    pub default_reservation_ttl: Option<chrono::Duration>,
    /// Alert thresholds in days, largest first.
    pub expiry_alert_days: Vec<i64>,
    /// Reorder thresholds per material; empty disables the low-stock check.
    pub low_stock_thresholds: BTreeMap<Uuid, Decimal>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_allocation_attempts: 3,
            retry_backoff: Duration::from_millis(25),
            default_reservation_ttl: None,
            expiry_alert_days: vec![90, 30, 7],
            low_stock_thresholds: BTreeMap::new(),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_allocation_attempts: config.allocation_max_attempts.max(1),
            retry_backoff: config.retry_backoff(),
            default_reservation_ttl: config.default_reservation_ttl(),
            expiry_alert_days: config.expiry_alert_days(),
            low_stock_thresholds: config.low_stock_thresholds(),
        }
    }
}

impl EngineSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_allocation_attempts.max(1),
            backoff: self.retry_backoff,
        }
    }
}

/// Bounded retry for optimistic-lock conflicts. Every attempt starts over from
/// a fresh read; a stale plan is never patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Runs `attempt` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget runs out. `exhausted` turns the attempt count into
    /// the error reported to the caller.
    pub async fn run<T, F, Fut, E>(
        &self,
        operation: &'static str,
        mut attempt: F,
        exhausted: E,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
        E: FnOnce(u32) -> ServiceError,
    {
        let mut n = 1;
        loop {
            match attempt(n).await {
                Err(err) if err.is_retryable() => {
                    counter!("lot_ledger_allocation_retries_total", 1, "operation" => operation);
                    if n >= self.max_attempts {
                        warn!(operation, attempts = n, error = %err, "Giving up after repeated write conflicts");
                        return Err(exhausted(n));
                    }
                    warn!(operation, attempt = n, error = %err, "Write conflict, retrying from a fresh read");
                    tokio::time::sleep(self.backoff * n).await;
                    n += 1;
                }
                other => return other,
            }
        }
    }
}

/// Allocates `PREFIX-PERIOD-NNNN` style document numbers from a named counter.
pub(crate) async fn next_document_number(
    uow: &mut dyn UnitOfWork,
    prefix: &str,
    period: &str,
    width: usize,
) -> Result<String, ServiceError> {
    let key = format!("{}-{}", prefix, period);
    let value = uow.next_sequence(&key).await?;
    Ok(format!("{}-{:0width$}", key, value, width = width))
}

pub(crate) fn year_period(now: DateTime<Utc>) -> String {
    format!("{:04}", now.year())
}

pub(crate) fn month_period(now: DateTime<Utc>) -> String {
    format!("{:04}{:02}", now.year(), now.month())
}

/// The full set of workflows wired to one store, clock and event channel.
#[derive(Clone)]
pub struct InventoryServices {
    pub locations: Arc<LocationService>,
    pub lots: Arc<LotRegistry>,
    pub movements: Arc<MovementLedger>,
    pub stock: Arc<StockLedger>,
    pub reservations: Arc<ReservationService>,
    pub receiving: Arc<ReceivingService>,
    pub issuing: Arc<GoodsIssueService>,
    pub counts: Arc<InventoryCountService>,
    pub settings: EngineSettings,
}

impl InventoryServices {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        events: EventSender,
        settings: EngineSettings,
    ) -> Self {
        let locations = Arc::new(LocationService::new(store.clone(), clock.clone()));
        let lots = Arc::new(LotRegistry::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            settings.expiry_alert_days.clone(),
        ));
        let movements = Arc::new(MovementLedger::new(store.clone()));
        let stock = Arc::new(StockLedger::new(store.clone(), clock.clone(), events.clone()));
        let reservations = Arc::new(ReservationService::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            settings.clone(),
        ));
        let receiving = Arc::new(ReceivingService::new(
            store.clone(),
            clock.clone(),
            events.clone(),
        ));
        let issuing = Arc::new(GoodsIssueService::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            settings.clone(),
        ));
        let counts = Arc::new(InventoryCountService::new(store, clock, events));

        Self {
            locations,
            lots,
            movements,
            stock,
            reservations,
            receiving,
            issuing,
            counts,
            settings,
        }
    }

    /// Background sweeper over this set of services.
    pub fn expiry_sweeper(
        &self,
        clock: Arc<dyn Clock>,
        lot_interval: Duration,
        reservation_interval: Duration,
    ) -> ExpirySweeper {
        ExpirySweeper::new(
            self.lots.clone(),
            self.reservations.clone(),
            self.stock.clone(),
            self.settings.low_stock_thresholds.clone(),
            clock,
            lot_interval,
            reservation_interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[tokio::test]
    async fn document_numbers_are_zero_padded_per_period() {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap();

        let first = next_document_number(uow.as_mut(), "GRN", &year_period(now), 4)
            .await
            .unwrap();
        let second = next_document_number(uow.as_mut(), "GRN", &year_period(now), 4)
            .await
            .unwrap();
        let lot = next_document_number(uow.as_mut(), "LOT", &month_period(now), 4)
            .await
            .unwrap();

        assert_eq!(first, "GRN-2026-0001");
        assert_eq!(second, "GRN-2026-0002");
        assert_eq!(lot, "LOT-202610-0001");
    }

    #[tokio::test]
    async fn retry_stops_after_budget() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), ServiceError> = policy
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::ConcurrentModification(Uuid::nil())) }
                },
                |attempts| ServiceError::ReservationConflict {
                    material_id: Uuid::nil(),
                    attempts,
                },
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            result,
            Err(ServiceError::ReservationConflict { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn retry_passes_through_other_errors() {
        let policy = EngineSettings::default().retry_policy();
        let calls = AtomicU32::new(0);
        let result: Result<(), ServiceError> = policy
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::NotFound("lot".into())) }
                },
                |_| ServiceError::InternalError("unreachable".into()),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }
}
