//! Stock ledger: the mutation primitives over stock rows.
//!
//! The `*_in` / `*_row` functions run inside a caller's unit of work and are
//! the building blocks of the receiving, reservation and issuing workflows.
//! Every quantity change writes its row through the optimistic version check
//! and appends exactly one movement. The public methods wrap a primitive in
//! its own unit of work.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::stock::{self, ReleaseOutcome};
use crate::entities::{stock_movement, AdjustmentReason, MovementType, StockKey};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::fefo::{self, AllocationResult};
use crate::store::{LedgerStore, StockQuery, UnitOfWork};

use super::locations::LocationService;
use super::lots::LotRegistry;
use super::movements::{MovementContext, MovementLedger, NewMovement};

/// Inbound quantity for one (location, material, lot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStock {
    pub location_id: Uuid,
    pub material_id: Uuid,
    pub lot_id: Option<Uuid>,
    pub quantity: Decimal,
    pub unit_of_measure: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub material_id: Uuid,
    pub requested_qty: Decimal,
    pub total_qty: Decimal,
    pub reserved_qty: Decimal,
    pub available_qty: Decimal,
    pub is_available: bool,
    pub shortage_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub source: stock::Model,
    pub destination: stock::Model,
    pub movement: stock_movement::Model,
}

/// A material whose eligible available stock is at or below its reorder threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockItem {
    pub material_id: Uuid,
    pub available: Decimal,
    pub threshold: Decimal,
}

pub struct StockLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
}

impl StockLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, events: EventSender) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    // ---- primitives inside a unit of work ----

    /// Adds quantity to the row for the key, creating the row on first receipt.
    pub(crate) async fn receive_in(
        uow: &mut dyn UnitOfWork,
        receipt: ReceiveStock,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<stock::Model, ServiceError> {
        ensure_positive(receipt.quantity)?;
        let location = LocationService::load_in(uow, receipt.location_id).await?;
        if !location.is_active {
            return Err(ServiceError::ValidationError(format!(
                "location {} is inactive",
                location.code
            )));
        }
        if let Some(lot_id) = receipt.lot_id {
            let lot = LotRegistry::load_in(uow, lot_id).await?;
            if lot.material_id != receipt.material_id {
                return Err(ServiceError::ValidationError(format!(
                    "lot {} belongs to material {}, not {}",
                    lot.lot_number, lot.material_id, receipt.material_id
                )));
            }
        }

        let key = StockKey {
            location_id: location.id,
            material_id: receipt.material_id,
            lot_id: receipt.lot_id,
        };
        let mut row = match uow.find_stock_by_key(&key).await? {
            Some(existing) => existing,
            None => {
                uow.insert_stock(stock::Model::empty(
                    key,
                    location.warehouse_id,
                    location.zone_id,
                    receipt.unit_of_measure.clone(),
                    now,
                ))
                .await?
            }
        };
        ensure_same_unit(&row, &receipt.unit_of_measure)?;

        row.receive(receipt.quantity, now)?;
        let saved = uow.update_stock(&row).await?;
        MovementLedger::append_in(
            uow,
            NewMovement {
                movement_type: MovementType::In,
                material_id: saved.material_id,
                lot_id: saved.lot_id,
                from_location_id: None,
                to_location_id: Some(saved.location_id),
                quantity: receipt.quantity,
                unit_of_measure: saved.unit_of_measure.clone(),
                adjustment_reason: None,
            },
            ctx,
            now,
        )
        .await?;
        Ok(saved)
    }

    /// Issues unreserved quantity from a row as read by the caller.
    pub(crate) async fn issue_row(
        uow: &mut dyn UnitOfWork,
        mut row: stock::Model,
        qty: Decimal,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<stock::Model, ServiceError> {
        row.issue(qty, now)?;
        let saved = uow.update_stock(&row).await?;
        Self::record_out(uow, &saved, qty, ctx, now).await?;
        Ok(saved)
    }

    /// Issues quantity previously held by a reservation.
    pub(crate) async fn issue_reserved_row(
        uow: &mut dyn UnitOfWork,
        mut row: stock::Model,
        qty: Decimal,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<stock::Model, ServiceError> {
        row.issue_reserved(qty, now)?;
        let saved = uow.update_stock(&row).await?;
        Self::record_out(uow, &saved, qty, ctx, now).await?;
        Ok(saved)
    }

    pub(crate) async fn reserve_row(
        uow: &mut dyn UnitOfWork,
        mut row: stock::Model,
        qty: Decimal,
        now: DateTime<Utc>,
    ) -> Result<stock::Model, ServiceError> {
        row.reserve(qty, now)?;
        uow.update_stock(&row).await
    }

    /// Releases a hold. Releasing more than is held floors at zero and is
    /// reported as a diagnostic, not an error.
    pub(crate) async fn release_row(
        uow: &mut dyn UnitOfWork,
        mut row: stock::Model,
        qty: Decimal,
        now: DateTime<Utc>,
    ) -> Result<stock::Model, ServiceError> {
        if let ReleaseOutcome::Underflow { missing } = row.release(qty, now)? {
            counter!("lot_ledger_reserved_underflow_total", 1);
            warn!(
                stock_id = %row.id,
                material_id = %row.material_id,
                requested = %qty,
                missing = %missing,
                "Released more than was reserved; reserved floored at zero"
            );
        }
        uow.update_stock(&row).await
    }

    /// Applies a signed correction and records it as an adjustment movement.
    pub(crate) async fn adjust_row(
        uow: &mut dyn UnitOfWork,
        mut row: stock::Model,
        delta: Decimal,
        reason: AdjustmentReason,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<(stock::Model, stock_movement::Model), ServiceError> {
        row.adjust(delta, now)?;
        let saved = uow.update_stock(&row).await?;
        let (from, to) = if delta.is_sign_negative() {
            (Some(saved.location_id), None)
        } else {
            (None, Some(saved.location_id))
        };
        let movement = MovementLedger::append_in(
            uow,
            NewMovement {
                movement_type: MovementType::Adjustment,
                material_id: saved.material_id,
                lot_id: saved.lot_id,
                from_location_id: from,
                to_location_id: to,
                quantity: delta,
                unit_of_measure: saved.unit_of_measure.clone(),
                adjustment_reason: Some(reason),
            },
            ctx,
            now,
        )
        .await?;
        Ok((saved, movement))
    }

    /// Moves unreserved quantity of the same lot to another location.
    pub(crate) async fn transfer_row(
        uow: &mut dyn UnitOfWork,
        mut source: stock::Model,
        to_location_id: Uuid,
        qty: Decimal,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<TransferOutcome, ServiceError> {
        ensure_positive(qty)?;
        if source.location_id == to_location_id {
            return Err(ServiceError::ValidationError(
                "transfer source and destination are the same location".to_string(),
            ));
        }
        let destination_location = LocationService::load_in(uow, to_location_id).await?;
        if !destination_location.is_active {
            return Err(ServiceError::ValidationError(format!(
                "location {} is inactive",
                destination_location.code
            )));
        }

        source.issue(qty, now)?;
        let source = uow.update_stock(&source).await?;

        let key = StockKey {
            location_id: destination_location.id,
            material_id: source.material_id,
            lot_id: source.lot_id,
        };
        let mut destination = match uow.find_stock_by_key(&key).await? {
            Some(existing) => existing,
            None => {
                uow.insert_stock(stock::Model::empty(
                    key,
                    destination_location.warehouse_id,
                    destination_location.zone_id,
                    source.unit_of_measure.clone(),
                    now,
                ))
                .await?
            }
        };
        ensure_same_unit(&destination, &source.unit_of_measure)?;
        destination.receive(qty, now)?;
        let destination = uow.update_stock(&destination).await?;

        let movement = MovementLedger::append_in(
            uow,
            NewMovement {
                movement_type: MovementType::Transfer,
                material_id: source.material_id,
                lot_id: source.lot_id,
                from_location_id: Some(source.location_id),
                to_location_id: Some(destination.location_id),
                quantity: qty,
                unit_of_measure: source.unit_of_measure.clone(),
                adjustment_reason: None,
            },
            ctx,
            now,
        )
        .await?;

        Ok(TransferOutcome {
            source,
            destination,
            movement,
        })
    }

    pub(crate) async fn load_row_in(
        uow: &mut dyn UnitOfWork,
        stock_id: Uuid,
    ) -> Result<stock::Model, ServiceError> {
        uow.find_stock(stock_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Stock row {} not found", stock_id)))
    }

    /// Direct references to a lot-tracked row must point at an eligible lot.
    async fn ensure_row_eligible(
        uow: &mut dyn UnitOfWork,
        row: &stock::Model,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if let Some(lot_id) = row.lot_id {
            LotRegistry::load_in(uow, lot_id).await?.ensure_eligible(now)?;
        }
        Ok(())
    }

    async fn record_out(
        uow: &mut dyn UnitOfWork,
        row: &stock::Model,
        qty: Decimal,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<stock_movement::Model, ServiceError> {
        MovementLedger::append_in(
            uow,
            NewMovement {
                movement_type: MovementType::Out,
                material_id: row.material_id,
                lot_id: row.lot_id,
                from_location_id: Some(row.location_id),
                to_location_id: None,
                quantity: qty,
                unit_of_measure: row.unit_of_measure.clone(),
                adjustment_reason: None,
            },
            ctx,
            now,
        )
        .await
    }

    // ---- standalone operations ----

    #[instrument(skip(self, ctx))]
    pub async fn receive(
        &self,
        receipt: ReceiveStock,
        ctx: MovementContext,
    ) -> Result<stock::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let row = Self::receive_in(uow.as_mut(), receipt, &ctx, self.clock.now()).await?;
        uow.commit().await?;
        Ok(row)
    }

    #[instrument(skip(self, ctx))]
    pub async fn issue(
        &self,
        stock_id: Uuid,
        qty: Decimal,
        ctx: MovementContext,
    ) -> Result<stock::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let row = Self::load_row_in(uow.as_mut(), stock_id).await?;
        Self::ensure_row_eligible(uow.as_mut(), &row, now).await?;
        let row = Self::issue_row(uow.as_mut(), row, qty, &ctx, now).await?;
        uow.commit().await?;
        Ok(row)
    }

    /// Issues quantity that is already held, decrementing on-hand and
    /// reserved together. Lot eligibility is not re-checked.
    #[instrument(skip(self, ctx))]
    pub async fn issue_reserved(
        &self,
        stock_id: Uuid,
        qty: Decimal,
        ctx: MovementContext,
    ) -> Result<stock::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let row = Self::load_row_in(uow.as_mut(), stock_id).await?;
        let row = Self::issue_reserved_row(uow.as_mut(), row, qty, &ctx, now).await?;
        uow.commit().await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn reserve(&self, stock_id: Uuid, qty: Decimal) -> Result<stock::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let row = Self::load_row_in(uow.as_mut(), stock_id).await?;
        Self::ensure_row_eligible(uow.as_mut(), &row, now).await?;
        let row = Self::reserve_row(uow.as_mut(), row, qty, now).await?;
        uow.commit().await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn release(&self, stock_id: Uuid, qty: Decimal) -> Result<stock::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let row = Self::load_row_in(uow.as_mut(), stock_id).await?;
        let row = Self::release_row(uow.as_mut(), row, qty, now).await?;
        uow.commit().await?;
        Ok(row)
    }

    #[instrument(skip(self, ctx))]
    pub async fn adjust(
        &self,
        stock_id: Uuid,
        delta: Decimal,
        reason: AdjustmentReason,
        ctx: MovementContext,
    ) -> Result<stock::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let row = Self::load_row_in(uow.as_mut(), stock_id).await?;
        let (row, _) = Self::adjust_row(uow.as_mut(), row, delta, reason, &ctx, now).await?;
        uow.commit().await?;

        info!(stock_id = %row.id, delta = %delta, %reason, quantity = %row.quantity, "Stock adjusted");
        self.events
            .publish(Event::StockAdjusted {
                stock_id: row.id,
                material_id: row.material_id,
                delta,
                reason,
                new_quantity: row.quantity,
            })
            .await;
        Ok(row)
    }

    #[instrument(skip(self, ctx))]
    pub async fn transfer(
        &self,
        stock_id: Uuid,
        to_location_id: Uuid,
        qty: Decimal,
        ctx: MovementContext,
    ) -> Result<TransferOutcome, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let row = Self::load_row_in(uow.as_mut(), stock_id).await?;
        let outcome = Self::transfer_row(uow.as_mut(), row, to_location_id, qty, &ctx, now).await?;
        uow.commit().await?;
        Ok(outcome)
    }

    // ---- reads ----

    pub async fn get_stock(&self, stock_id: Uuid) -> Result<stock::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let row = Self::load_row_in(uow.as_mut(), stock_id).await?;
        uow.commit().await?;
        Ok(row)
    }

    pub async fn stock_for_material(
        &self,
        material_id: Uuid,
        warehouse_id: Option<Uuid>,
    ) -> Result<Vec<fefo::StockPosition>, ServiceError> {
        self.positions(StockQuery::for_material(material_id).in_warehouse(warehouse_id))
            .await
    }

    pub async fn stock_for_lot(&self, lot_id: Uuid) -> Result<Vec<fefo::StockPosition>, ServiceError> {
        self.positions(StockQuery::for_lot(lot_id)).await
    }

    /// Totals over rows with an eligible lot. No allocation is computed.
    #[instrument(skip(self))]
    pub async fn check_availability(
        &self,
        material_id: Uuid,
        requested_qty: Decimal,
        warehouse_id: Option<Uuid>,
    ) -> Result<Availability, ServiceError> {
        if requested_qty.is_sign_negative() {
            return Err(ServiceError::InvalidQuantity(format!(
                "requested quantity must not be negative, got {}",
                requested_qty
            )));
        }
        let positions = self.stock_for_material(material_id, warehouse_id).await?;
        let totals = fefo::eligible_totals(&positions, self.clock.now());
        let shortage = (requested_qty - totals.available).max(Decimal::ZERO);

        Ok(Availability {
            material_id,
            requested_qty,
            total_qty: totals.total,
            reserved_qty: totals.reserved,
            available_qty: totals.available,
            is_available: shortage.is_zero(),
            shortage_qty: shortage,
        })
    }

    /// Compares eligible availability with each material's threshold and
    /// publishes a `LowStockAlert` for every material at or below it. Alerts
    /// repeat on every check until stock is replenished.
    #[instrument(skip(self, thresholds), fields(materials = thresholds.len()))]
    pub async fn check_low_stock(
        &self,
        thresholds: &BTreeMap<Uuid, Decimal>,
    ) -> Result<Vec<LowStockItem>, ServiceError> {
        let now = self.clock.now();
        let mut low = Vec::new();
        for (&material_id, &threshold) in thresholds {
            let positions = self.stock_for_material(material_id, None).await?;
            let available = fefo::eligible_totals(&positions, now).available;
            if available <= threshold {
                low.push(LowStockItem {
                    material_id,
                    available,
                    threshold,
                });
            }
        }

        for item in &low {
            counter!("lot_ledger_low_stock_alerts_total", 1);
            warn!(
                material_id = %item.material_id,
                available = %item.available,
                threshold = %item.threshold,
                "Available stock at or below reorder threshold"
            );
            self.events
                .publish(Event::LowStockAlert {
                    material_id: item.material_id,
                    available: item.available,
                    threshold: item.threshold,
                })
                .await;
        }
        Ok(low)
    }

    /// FEFO plan without side effects.
    pub async fn plan_allocation(
        &self,
        material_id: Uuid,
        requested_qty: Decimal,
        warehouse_id: Option<Uuid>,
    ) -> Result<AllocationResult, ServiceError> {
        ensure_positive(requested_qty)?;
        let positions = self.stock_for_material(material_id, warehouse_id).await?;
        Ok(fefo::plan(&positions, requested_qty, self.clock.now()))
    }

    async fn positions(&self, query: StockQuery) -> Result<Vec<fefo::StockPosition>, ServiceError> {
        let mut uow = self.store.begin().await?;
        let rows = uow.list_stock(&query).await?;
        uow.commit().await?;
        Ok(rows)
    }
}

pub(crate) fn ensure_positive(qty: Decimal) -> Result<(), ServiceError> {
    if qty <= Decimal::ZERO {
        return Err(ServiceError::InvalidQuantity(format!(
            "quantity must be positive, got {}",
            qty
        )));
    }
    Ok(())
}

fn ensure_same_unit(row: &stock::Model, unit_of_measure: &str) -> Result<(), ServiceError> {
    if row.unit_of_measure != unit_of_measure {
        return Err(ServiceError::ValidationError(format!(
            "stock row {} is kept in {}, not {}",
            row.id, row.unit_of_measure, unit_of_measure
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::entities::{location, lot, ReferenceType, ZoneType};
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: StockLedger,
        material: Uuid,
        bin_a: Uuid,
        bin_b: Uuid,
        rx: mpsc::Receiver<Event>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap()
    }

    fn ctx() -> MovementContext {
        MovementContext::new(Uuid::nil(), ReferenceType::Adjustment, None)
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let warehouse = Uuid::new_v4();
        let mut uow = store.begin().await.unwrap();
        let mut bins = Vec::new();
        for code in ["A-01", "A-02"] {
            let saved = uow
                .insert_location(location::Model {
                    id: Uuid::new_v4(),
                    warehouse_id: warehouse,
                    zone_id: Uuid::new_v4(),
                    code: code.into(),
                    zone_type: ZoneType::Storage,
                    is_active: true,
                    created_at: now(),
                })
                .await
                .unwrap();
            bins.push(saved.id);
        }
        uow.commit().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let ledger = StockLedger::new(
            store.clone(),
            Arc::new(FixedClock::new(now())),
            EventSender::new(tx),
        );
        Fixture {
            store,
            ledger,
            material: Uuid::new_v4(),
            bin_a: bins[0],
            bin_b: bins[1],
            rx,
        }
    }

    async fn passed_lot(f: &Fixture, number: &str, expiry: NaiveDate) -> lot::Model {
        let mut model = lot::Model::create(
            number.into(),
            lot::NewLot {
                material_id: f.material,
                expiry_date: expiry,
                manufactured_date: None,
                supplier_id: None,
                supplier_lot_number: None,
                grn_id: None,
                received_date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            },
            now(),
        )
        .unwrap();
        model.pass_qc(None, now()).unwrap();
        let mut uow = f.store.begin().await.unwrap();
        let saved = uow.insert_lot(model).await.unwrap();
        uow.commit().await.unwrap();
        saved
    }

    fn receipt(f: &Fixture, location: Uuid, lot: &lot::Model, qty: Decimal) -> ReceiveStock {
        ReceiveStock {
            location_id: location,
            material_id: f.material,
            lot_id: Some(lot.id),
            quantity: qty,
            unit_of_measure: "KG".into(),
        }
    }

    #[tokio::test]
    async fn receive_accumulates_on_one_row_and_logs_movements() {
        let f = fixture().await;
        let lot = passed_lot(&f, "LOT-A", NaiveDate::from_ymd_opt(2027, 6, 30).unwrap()).await;

        let first = f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(40)), ctx()).await.unwrap();
        let second = f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(10)), ctx()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.quantity, dec!(50));
        assert_eq!(second.available_quantity, dec!(50));

        let mut uow = f.store.begin().await.unwrap();
        let movements = uow
            .list_movements(&crate::store::MovementQuery::for_lot(lot.id))
            .await
            .unwrap();
        assert_eq!(movements.len(), 2);
        assert!(movements.iter().all(|m| m.movement_type == MovementType::In));
    }

    #[tokio::test]
    async fn receive_rejects_unit_mismatch_and_bad_quantity() {
        let f = fixture().await;
        let lot = passed_lot(&f, "LOT-A", NaiveDate::from_ymd_opt(2027, 6, 30).unwrap()).await;
        f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(1)), ctx()).await.unwrap();

        let mut grams = receipt(&f, f.bin_a, &lot, dec!(1));
        grams.unit_of_measure = "G".into();
        assert!(matches!(
            f.ledger.receive(grams, ctx()).await,
            Err(ServiceError::ValidationError(_))
        ));
        assert!(matches!(
            f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(0)), ctx()).await,
            Err(ServiceError::InvalidQuantity(_))
        ));
    }

    #[tokio::test]
    async fn transfer_moves_quantity_between_rows() {
        let f = fixture().await;
        let lot = passed_lot(&f, "LOT-A", NaiveDate::from_ymd_opt(2027, 6, 30).unwrap()).await;
        let row = f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(30)), ctx()).await.unwrap();

        let outcome = f.ledger.transfer(row.id, f.bin_b, dec!(12), ctx()).await.unwrap();
        assert_eq!(outcome.source.quantity, dec!(18));
        assert_eq!(outcome.destination.quantity, dec!(12));
        assert_eq!(outcome.destination.lot_id, Some(lot.id));
        assert_eq!(outcome.movement.from_location_id, Some(f.bin_a));
        assert_eq!(outcome.movement.to_location_id, Some(f.bin_b));

        assert!(matches!(
            f.ledger.transfer(row.id, f.bin_b, dec!(19), ctx()).await,
            Err(ServiceError::InsufficientStock { .. })
        ));
    }

    #[tokio::test]
    async fn reserve_and_issue_refuse_ineligible_lots() {
        let f = fixture().await;
        let expired = passed_lot(&f, "LOT-OLD", NaiveDate::from_ymd_opt(2026, 10, 10).unwrap()).await;
        let row = f.ledger.receive(receipt(&f, f.bin_a, &expired, dec!(5)), ctx()).await.unwrap();

        assert!(matches!(
            f.ledger.reserve(row.id, dec!(1)).await,
            Err(ServiceError::LotNotEligible { .. })
        ));
        assert!(matches!(
            f.ledger.issue(row.id, dec!(1), ctx()).await,
            Err(ServiceError::LotNotEligible { .. })
        ));
        // Corrections are still allowed on ineligible stock
        let adjusted = f
            .ledger
            .adjust(row.id, dec!(-5), AdjustmentReason::Expiry, ctx())
            .await
            .unwrap();
        assert_eq!(adjusted.quantity, dec!(0));
    }

    #[tokio::test]
    async fn adjustment_records_its_reason() {
        let mut f = fixture().await;
        let lot = passed_lot(&f, "LOT-A", NaiveDate::from_ymd_opt(2027, 6, 30).unwrap()).await;
        let row = f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(12)), ctx()).await.unwrap();

        let damaged = f
            .ledger
            .adjust(row.id, dec!(-3), AdjustmentReason::Damage, ctx())
            .await
            .unwrap();
        assert_eq!(damaged.quantity, dec!(9));

        let mut uow = f.store.begin().await.unwrap();
        let movements = uow
            .list_movements(&crate::store::MovementQuery::for_lot(lot.id))
            .await
            .unwrap();
        let adjustment = movements
            .iter()
            .find(|m| m.movement_type == MovementType::Adjustment)
            .unwrap();
        assert_eq!(adjustment.quantity, dec!(-3));
        assert_eq!(adjustment.adjustment_reason, Some(AdjustmentReason::Damage));
        assert_eq!(adjustment.from_location_id, Some(f.bin_a));

        assert!(matches!(
            f.rx.try_recv(),
            Ok(Event::StockAdjusted { reason: AdjustmentReason::Damage, delta, .. }) if delta == dec!(-3)
        ));
    }

    #[tokio::test]
    async fn over_release_is_floored() {
        let f = fixture().await;
        let lot = passed_lot(&f, "LOT-A", NaiveDate::from_ymd_opt(2027, 6, 30).unwrap()).await;
        let row = f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(10)), ctx()).await.unwrap();
        f.ledger.reserve(row.id, dec!(4)).await.unwrap();

        let released = f.ledger.release(row.id, dec!(6)).await.unwrap();
        assert_eq!(released.reserved_quantity, dec!(0));
        assert_eq!(released.available_quantity, dec!(10));
    }

    #[tokio::test]
    async fn issue_reserved_draws_down_the_hold() {
        let f = fixture().await;
        let lot = passed_lot(&f, "LOT-A", NaiveDate::from_ymd_opt(2027, 6, 30).unwrap()).await;
        let row = f.ledger.receive(receipt(&f, f.bin_a, &lot, dec!(10)), ctx()).await.unwrap();
        f.ledger.reserve(row.id, dec!(6)).await.unwrap();

        let issued = f.ledger.issue_reserved(row.id, dec!(4), ctx()).await.unwrap();
        assert_eq!(issued.quantity, dec!(6));
        assert_eq!(issued.reserved_quantity, dec!(2));
        assert_eq!(issued.available_quantity, dec!(4));

        assert!(matches!(
            f.ledger.issue_reserved(row.id, dec!(3), ctx()).await,
            Err(ServiceError::InsufficientStock { .. })
        ));
    }

    #[tokio::test]
    async fn availability_counts_only_eligible_lots() {
        let f = fixture().await;
        let good = passed_lot(&f, "LOT-A", NaiveDate::from_ymd_opt(2027, 6, 30).unwrap()).await;
        let stale = passed_lot(&f, "LOT-B", NaiveDate::from_ymd_opt(2026, 10, 5).unwrap()).await;
        let row = f.ledger.receive(receipt(&f, f.bin_a, &good, dec!(100)), ctx()).await.unwrap();
        f.ledger.receive(receipt(&f, f.bin_b, &stale, dec!(50)), ctx()).await.unwrap();
        f.ledger.reserve(row.id, dec!(30)).await.unwrap();

        let availability = f
            .ledger
            .check_availability(f.material, dec!(80), None)
            .await
            .unwrap();
        assert_eq!(availability.total_qty, dec!(100));
        assert_eq!(availability.reserved_qty, dec!(30));
        assert_eq!(availability.available_qty, dec!(70));
        assert!(!availability.is_available);
        assert_eq!(availability.shortage_qty, dec!(10));
    }
}
