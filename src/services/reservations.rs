//! Reservation manager: all-or-nothing FEFO holds on available stock.
//!
//! A reservation pins the rows the allocator chose as child allocation rows,
//! so release and issue act on exactly the stock that was held.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::entities::{reservation_allocation, stock_reservation, ReservationStatus, ReservationType};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::fefo;
use crate::store::{LedgerStore, ReservationQuery, StockQuery, UnitOfWork};

use super::stock_ledger::{ensure_positive, StockLedger};
use super::EngineSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CreateReservationCommand {
    pub material_id: Uuid,
    pub quantity: Decimal,
    pub reservation_type: ReservationType,
    pub reference_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub reference_number: Option<String>,
    /// Restricts allocation to one warehouse.
    pub warehouse_id: Option<Uuid>,
    /// Falls back to the configured default TTL, if any.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDetails {
    pub reservation: stock_reservation::Model,
    pub allocations: Vec<reservation_allocation::Model>,
}

impl ReservationDetails {
    pub fn outstanding_quantity(&self) -> Decimal {
        self.allocations
            .iter()
            .filter(|a| !a.consumed)
            .map(|a| a.quantity)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSweepReport {
    pub expired: Vec<Uuid>,
    pub released_quantity: Decimal,
    pub swept_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceReleaseReport {
    pub reservation_type: ReservationType,
    pub reference_id: Uuid,
    pub released: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
    pub released_quantity: Decimal,
}

pub struct ReservationService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
    settings: EngineSettings,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        events: EventSender,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            settings,
        }
    }

    /// Holds `quantity` across eligible lots in FEFO order, or fails without
    /// side effects when eligible supply is short.
    #[instrument(skip(self, command), fields(material_id = %command.material_id, quantity = %command.quantity))]
    pub async fn create_reservation(
        &self,
        command: CreateReservationCommand,
    ) -> Result<ReservationDetails, ServiceError> {
        ensure_positive(command.quantity)?;
        command.validate()?;
        let now = self.clock.now();
        if matches!(command.expires_at, Some(at) if at <= now) {
            return Err(ServiceError::ValidationError(
                "reservation expiry must be in the future".to_string(),
            ));
        }

        let material_id = command.material_id;
        let command = &command;
        let details = self
            .settings
            .retry_policy()
            .run(
                "reserve",
                |attempt| self.try_create(command, attempt),
                |attempts| ServiceError::ReservationConflict {
                    material_id,
                    attempts,
                },
            )
            .await?;

        counter!("lot_ledger_reservations_created_total", 1);
        info!(
            reservation_id = %details.reservation.id,
            lots = details.allocations.len(),
            "Stock reserved"
        );
        self.events
            .publish(Event::StockReserved {
                reservation_id: details.reservation.id,
                material_id,
                quantity: details.reservation.quantity,
                reservation_type: details.reservation.reservation_type,
                reference_id: details.reservation.reference_id,
            })
            .await;
        Ok(details)
    }

    async fn try_create(
        &self,
        command: &CreateReservationCommand,
        attempt: u32,
    ) -> Result<ReservationDetails, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;

        let positions = uow
            .list_stock(
                &StockQuery::for_material(command.material_id)
                    .in_warehouse(command.warehouse_id)
                    .locked(),
            )
            .await?;
        let plan = fefo::plan(&positions, command.quantity, now);
        if !plan.is_complete() {
            return Err(ServiceError::insufficient(
                command.material_id,
                command.quantity,
                plan.allocated(),
            ));
        }

        let unit_of_measure = plan
            .allocations
            .first()
            .and_then(|a| positions.iter().find(|p| p.stock.id == a.stock_id))
            .map(|p| p.stock.unit_of_measure.clone())
            .unwrap_or_default();
        let expires_at = command.expires_at.or_else(|| {
            self.settings
                .default_reservation_ttl
                .map(|ttl| now + ttl)
        });

        let reservation = uow
            .insert_reservation(stock_reservation::Model {
                id: Uuid::new_v4(),
                material_id: command.material_id,
                quantity: command.quantity,
                unit_of_measure,
                reservation_type: command.reservation_type,
                reference_id: command.reference_id,
                reference_number: command.reference_number.clone(),
                status: ReservationStatus::Active,
                expires_at,
                created_by: command.created_by,
                created_at: now,
                released_at: None,
                fulfilled_at: None,
            })
            .await?;

        let mut allocations = Vec::with_capacity(plan.allocations.len());
        for allocation in &plan.allocations {
            let row = positions
                .iter()
                .find(|p| p.stock.id == allocation.stock_id)
                .map(|p| p.stock.clone())
                .ok_or(ServiceError::ConcurrentModification(allocation.stock_id))?;

            // A shortfall here means the snapshot went stale under us
            match StockLedger::reserve_row(uow.as_mut(), row, allocation.quantity, now).await {
                Ok(_) => {}
                Err(ServiceError::InsufficientStock { .. }) => {
                    return Err(ServiceError::ConcurrentModification(allocation.stock_id))
                }
                Err(e) => return Err(e),
            }

            allocations.push(
                uow.insert_reservation_allocation(reservation_allocation::Model {
                    id: Uuid::new_v4(),
                    reservation_id: reservation.id,
                    stock_id: allocation.stock_id,
                    lot_id: Some(allocation.lot_id),
                    location_id: allocation.location_id,
                    quantity: allocation.quantity,
                    consumed: false,
                })
                .await?,
            );
        }

        uow.commit().await?;
        if attempt > 1 {
            info!(attempt, "Reservation succeeded after retry");
        }
        Ok(ReservationDetails {
            reservation,
            allocations,
        })
    }

    /// Returns held quantity to available. Releasing an already released or
    /// expired reservation is a no-op; a fulfilled one cannot be released.
    #[instrument(skip(self))]
    pub async fn release_reservation(&self, reservation_id: Uuid) -> Result<ReservationDetails, ServiceError> {
        let policy = self.settings.retry_policy();
        let (details, released) = policy
            .run(
                "release",
                |_| self.try_release(reservation_id),
                |_| ServiceError::ConcurrentModification(reservation_id),
            )
            .await?;

        if let Some(quantity) = released {
            info!(%reservation_id, %quantity, "Reservation released");
            self.events
                .publish(Event::ReservationReleased {
                    reservation_id,
                    material_id: details.reservation.material_id,
                    quantity,
                    expired: false,
                })
                .await;
        }
        Ok(details)
    }

    async fn try_release(
        &self,
        reservation_id: Uuid,
    ) -> Result<(ReservationDetails, Option<Decimal>), ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut reservation = Self::load_in(uow.as_mut(), reservation_id).await?;

        if reservation.status == ReservationStatus::Fulfilled {
            return Err(ServiceError::InvalidStatus(format!(
                "reservation {} is already fulfilled",
                reservation_id
            )));
        }
        if reservation.status.is_terminal() {
            let allocations = uow.list_reservation_allocations(reservation_id).await?;
            uow.commit().await?;
            return Ok((
                ReservationDetails {
                    reservation,
                    allocations,
                },
                None,
            ));
        }

        let released = Self::release_pins_in(uow.as_mut(), reservation_id, now).await?;
        reservation.status = ReservationStatus::Released;
        reservation.released_at = Some(now);
        uow.update_reservation(&reservation).await?;
        let allocations = uow.list_reservation_allocations(reservation_id).await?;
        uow.commit().await?;

        Ok((
            ReservationDetails {
                reservation,
                allocations,
            },
            Some(released),
        ))
    }

    /// Releases every active reservation raised against a business document,
    /// e.g. when the sales order behind them is cancelled. Reservations that
    /// are already fulfilled, released or expired are reported as skipped.
    #[instrument(skip(self))]
    pub async fn release_by_reference(
        &self,
        reservation_type: ReservationType,
        reference_id: Uuid,
    ) -> Result<ReferenceReleaseReport, ServiceError> {
        let (report, released) = self
            .settings
            .retry_policy()
            .run(
                "release_by_reference",
                |_| self.try_release_by_reference(reservation_type, reference_id),
                |_| ServiceError::ConcurrentModification(reference_id),
            )
            .await?;

        if !report.released.is_empty() {
            info!(
                %reference_id,
                count = report.released.len(),
                quantity = %report.released_quantity,
                "Reservations released for reference"
            );
        }
        for (reservation_id, material_id, quantity) in released {
            self.events
                .publish(Event::ReservationReleased {
                    reservation_id,
                    material_id,
                    quantity,
                    expired: false,
                })
                .await;
        }
        Ok(report)
    }

    async fn try_release_by_reference(
        &self,
        reservation_type: ReservationType,
        reference_id: Uuid,
    ) -> Result<(ReferenceReleaseReport, Vec<(Uuid, Uuid, Decimal)>), ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let reservations = uow
            .list_reservations(&ReservationQuery::for_reference(reservation_type, reference_id))
            .await?;

        let mut report = ReferenceReleaseReport {
            reservation_type,
            reference_id,
            released: Vec::new(),
            skipped: Vec::new(),
            released_quantity: Decimal::ZERO,
        };
        let mut released = Vec::new();
        for mut reservation in reservations {
            if reservation.status.is_terminal() {
                report.skipped.push(reservation.id);
                continue;
            }
            let quantity = Self::release_pins_in(uow.as_mut(), reservation.id, now).await?;
            reservation.status = ReservationStatus::Released;
            reservation.released_at = Some(now);
            uow.update_reservation(&reservation).await?;
            report.released.push(reservation.id);
            report.released_quantity += quantity;
            released.push((reservation.id, reservation.material_id, quantity));
        }
        uow.commit().await?;
        Ok((report, released))
    }

    /// Releases every unconsumed pin of a reservation. Returns the quantity released.
    async fn release_pins_in(
        uow: &mut dyn UnitOfWork,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Decimal, ServiceError> {
        let mut released = Decimal::ZERO;
        for pin in uow.list_reservation_allocations(reservation_id).await? {
            if pin.consumed {
                continue;
            }
            let row = StockLedger::load_row_in(uow, pin.stock_id).await?;
            StockLedger::release_row(uow, row, pin.quantity, now).await?;
            released += pin.quantity;
        }
        Ok(released)
    }

    /// Closes an active reservation whose pins have all been issued.
    #[instrument(skip(self))]
    pub async fn fulfill_reservation(&self, reservation_id: Uuid) -> Result<ReservationDetails, ServiceError> {
        let mut uow = self.store.begin().await?;
        let reservation = Self::load_in(uow.as_mut(), reservation_id).await?;
        let reservation = Self::fulfill_in(uow.as_mut(), reservation, self.clock.now()).await?;
        let allocations = uow.list_reservation_allocations(reservation_id).await?;
        uow.commit().await?;

        self.events
            .publish(Event::ReservationFulfilled {
                reservation_id,
                material_id: reservation.material_id,
                quantity: reservation.quantity,
            })
            .await;
        Ok(ReservationDetails {
            reservation,
            allocations,
        })
    }

    pub(crate) async fn fulfill_in(
        uow: &mut dyn UnitOfWork,
        mut reservation: stock_reservation::Model,
        now: DateTime<Utc>,
    ) -> Result<stock_reservation::Model, ServiceError> {
        Self::ensure_active(&reservation)?;
        let outstanding = uow
            .list_reservation_allocations(reservation.id)
            .await?
            .iter()
            .filter(|a| !a.consumed)
            .count();
        if outstanding > 0 {
            return Err(ServiceError::InvalidStatus(format!(
                "reservation {} still has {} unissued allocations",
                reservation.id, outstanding
            )));
        }
        reservation.status = ReservationStatus::Fulfilled;
        reservation.fulfilled_at = Some(now);
        uow.update_reservation(&reservation).await?;
        Ok(reservation)
    }

    pub(crate) fn ensure_active(reservation: &stock_reservation::Model) -> Result<(), ServiceError> {
        match reservation.status {
            ReservationStatus::Active => Ok(()),
            ReservationStatus::Fulfilled => Err(ServiceError::AlreadyCompleted(format!(
                "reservation {} is already fulfilled",
                reservation.id
            ))),
            other => Err(ServiceError::InvalidStatus(format!(
                "reservation {} is {}",
                reservation.id, other
            ))),
        }
    }

    /// Expires active reservations past their deadline and returns their
    /// held quantity to available.
    #[instrument(skip(self))]
    pub async fn sweep_expired_reservations(&self) -> Result<ReservationSweepReport, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let due = uow
            .list_reservations(&ReservationQuery::active_expired_by(now))
            .await?;

        let mut released = Vec::with_capacity(due.len());
        for mut reservation in due {
            if reservation.status.is_terminal() || !reservation.is_past_expiry(now) {
                continue;
            }
            let quantity = Self::release_pins_in(uow.as_mut(), reservation.id, now).await?;
            reservation.status = ReservationStatus::Expired;
            reservation.released_at = Some(now);
            uow.update_reservation(&reservation).await?;
            released.push((reservation, quantity));
        }
        uow.commit().await?;

        let mut total = Decimal::ZERO;
        for (reservation, quantity) in &released {
            total += *quantity;
            self.events
                .publish(Event::ReservationReleased {
                    reservation_id: reservation.id,
                    material_id: reservation.material_id,
                    quantity: *quantity,
                    expired: true,
                })
                .await;
        }
        if !released.is_empty() {
            counter!("lot_ledger_reservations_expired_total", released.len() as u64);
            warn!(count = released.len(), quantity = %total, "Expired reservations released");
        }

        Ok(ReservationSweepReport {
            expired: released.into_iter().map(|(r, _)| r.id).collect(),
            released_quantity: total,
            swept_at: now,
        })
    }

    pub async fn get_reservation(&self, reservation_id: Uuid) -> Result<ReservationDetails, ServiceError> {
        let mut uow = self.store.begin().await?;
        let reservation = Self::load_in(uow.as_mut(), reservation_id).await?;
        let allocations = uow.list_reservation_allocations(reservation_id).await?;
        uow.commit().await?;
        Ok(ReservationDetails {
            reservation,
            allocations,
        })
    }

    pub async fn list_reservations(
        &self,
        query: ReservationQuery,
    ) -> Result<Vec<stock_reservation::Model>, ServiceError> {
        let mut uow = self.store.begin().await?;
        let rows = uow.list_reservations(&query).await?;
        uow.commit().await?;
        Ok(rows)
    }

    pub(crate) async fn load_in(
        uow: &mut dyn UnitOfWork,
        reservation_id: Uuid,
    ) -> Result<stock_reservation::Model, ServiceError> {
        uow.find_reservation(reservation_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Reservation {} not found", reservation_id)))
    }
}
