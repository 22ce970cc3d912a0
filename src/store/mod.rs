//! Storage seam for the ledger.
//!
//! Workflows never talk to a database handle directly. They open a
//! [`UnitOfWork`] from a [`LedgerStore`], perform every read and write of one
//! business operation through it, then commit. Dropping a unit of work
//! without committing discards all of its writes.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::entities::{
    goods_issue, goods_issue_line, grn, grn_line_item, inventory_count, inventory_count_line,
    location, lot, reservation_allocation, stock, stock_movement, stock_reservation, LotStatus, ReservationStatus, ReservationType, StockKey,
    ZoneType,
};
use crate::errors::ServiceError;
use crate::fefo::StockPosition;

pub mod memory;
pub mod sea_orm_store;

pub use memory::MemoryStore;
pub use sea_orm_store::SeaOrmStore;

const MAX_QUERY_LIMIT: u64 = 1000;
const DEFAULT_QUERY_LIMIT: u64 = 100;

/// Rows of the stock ledger to load, optionally locked for the rest of the unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockQuery {
    pub material_id: Option<Uuid>,
    pub lot_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub for_update: bool,
}

impl StockQuery {
    pub fn for_material(material_id: Uuid) -> Self {
        Self {
            material_id: Some(material_id),
            ..Self::default()
        }
    }

    pub fn for_lot(lot_id: Uuid) -> Self {
        Self {
            lot_id: Some(lot_id),
            ..Self::default()
        }
    }

    pub fn in_warehouse(mut self, warehouse_id: Option<Uuid>) -> Self {
        self.warehouse_id = warehouse_id;
        self
    }

    pub fn at_location(mut self, location_id: Uuid) -> Self {
        self.location_id = Some(location_id);
        self
    }

    /// Take row locks where the backend supports them.
    pub fn locked(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.material_id.is_none() && self.lot_id.is_none() && self.location_id.is_none() {
            return Err(ServiceError::ValidationError(
                "stock query needs a material, a lot or a location".to_string(),
            ));
        }
        Ok(())
    }

    pub fn matches(&self, row: &stock::Model) -> bool {
        self.material_id.map_or(true, |m| row.material_id == m)
            && self.lot_id.map_or(true, |l| row.lot_id == Some(l))
            && self.warehouse_id.map_or(true, |w| row.warehouse_id == w)
            && self.location_id.map_or(true, |l| row.location_id == l)
    }
}

/// Movement history lookup, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct MovementQuery {
    pub material_id: Option<Uuid>,
    pub lot_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 1000))]
    pub limit: u64,
}

impl MovementQuery {
    pub fn for_material(material_id: Uuid) -> Self {
        Self {
            material_id: Some(material_id),
            lot_id: None,
            since: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn for_lot(lot_id: Uuid) -> Self {
        Self {
            material_id: None,
            lot_id: Some(lot_id),
            since: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn check(&self) -> Result<(), ServiceError> {
        if self.material_id.is_none() && self.lot_id.is_none() {
            return Err(ServiceError::ValidationError(
                "movement query needs a material or a lot".to_string(),
            ));
        }
        Validate::validate(self)?;
        Ok(())
    }

    pub fn matches(&self, movement: &stock_movement::Model) -> bool {
        self.material_id.map_or(true, |m| movement.material_id == m)
            && self.lot_id.map_or(true, |l| movement.lot_id == Some(l))
            && self.since.map_or(true, |s| movement.created_at >= s)
    }
}

/// Lot lookup by material, status or expiry horizon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotQuery {
    pub material_id: Option<Uuid>,
    pub status: Option<LotStatus>,
    pub expiring_on_or_before: Option<NaiveDate>,
    pub limit: Option<u64>,
}

impl LotQuery {
    pub fn for_material(material_id: Uuid) -> Self {
        Self {
            material_id: Some(material_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: LotStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn expiring_by(mut self, date: NaiveDate) -> Self {
        self.expiring_on_or_before = Some(date);
        self
    }

    pub fn effective_limit(&self) -> u64 {
        self.limit.unwrap_or(MAX_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn matches(&self, lot: &lot::Model) -> bool {
        self.material_id.map_or(true, |m| lot.material_id == m)
            && self.status.map_or(true, |s| lot.status == s)
            && self
                .expiring_on_or_before
                .map_or(true, |d| lot.expiry_date <= d)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationQuery {
    pub material_id: Option<Uuid>,
    pub reservation_type: Option<ReservationType>,
    pub reference_id: Option<Uuid>,
    pub status: Option<ReservationStatus>,
    pub expires_on_or_before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

impl ReservationQuery {
    pub fn active_expired_by(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(ReservationStatus::Active),
            expires_on_or_before: Some(now),
            ..Self::default()
        }
    }

    /// Every reservation raised against one business document.
    pub fn for_reference(reservation_type: ReservationType, reference_id: Uuid) -> Self {
        Self {
            reservation_type: Some(reservation_type),
            reference_id: Some(reference_id),
            ..Self::default()
        }
    }

    pub fn effective_limit(&self) -> u64 {
        self.limit.unwrap_or(MAX_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn matches(&self, reservation: &stock_reservation::Model) -> bool {
        self.material_id
            .map_or(true, |m| reservation.material_id == m)
            && self
                .reservation_type
                .map_or(true, |t| reservation.reservation_type == t)
            && self
                .reference_id
                .map_or(true, |r| reservation.reference_id == r)
            && self.status.map_or(true, |s| reservation.status == s)
            && self.expires_on_or_before.map_or(true, |cutoff| {
                reservation.expires_at.map_or(false, |at| at <= cutoff)
            })
    }
}

/// Factory for units of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, ServiceError>;
}

/// One atomic business operation against the ledger.
#[async_trait]
pub trait UnitOfWork: Send {
    // Locations
    async fn insert_location(&mut self, model: location::Model) -> Result<location::Model, ServiceError>;
    async fn find_location(&mut self, id: Uuid) -> Result<Option<location::Model>, ServiceError>;
    async fn list_locations(
        &mut self,
        warehouse_id: Uuid,
        zone_type: Option<ZoneType>,
    ) -> Result<Vec<location::Model>, ServiceError>;

    // Lots
    async fn insert_lot(&mut self, model: lot::Model) -> Result<lot::Model, ServiceError>;
    async fn find_lot(&mut self, id: Uuid) -> Result<Option<lot::Model>, ServiceError>;
    async fn find_lot_by_number(&mut self, lot_number: &str) -> Result<Option<lot::Model>, ServiceError>;
    /// Writes status and QC fields only; identity and expiry are immutable.
    async fn update_lot_status(&mut self, model: &lot::Model) -> Result<(), ServiceError>;
    async fn list_lots(&mut self, query: &LotQuery) -> Result<Vec<lot::Model>, ServiceError>;

    // Stock ledger
    async fn find_stock(&mut self, id: Uuid) -> Result<Option<stock::Model>, ServiceError>;
    async fn find_stock_by_key(&mut self, key: &StockKey) -> Result<Option<stock::Model>, ServiceError>;
    async fn list_stock(&mut self, query: &StockQuery) -> Result<Vec<StockPosition>, ServiceError>;
    async fn insert_stock(&mut self, model: stock::Model) -> Result<stock::Model, ServiceError>;
    /// Compare-and-swap on `model.version`. On success the stored row carries
    /// `version + 1` and is returned; a stale version yields
    /// `ServiceError::ConcurrentModification`.
    async fn update_stock(&mut self, model: &stock::Model) -> Result<stock::Model, ServiceError>;

    // Movements (append only)
    async fn insert_movement(
        &mut self,
        model: stock_movement::Model,
    ) -> Result<stock_movement::Model, ServiceError>;
    async fn list_movements(
        &mut self,
        query: &MovementQuery,
    ) -> Result<Vec<stock_movement::Model>, ServiceError>;

    // Reservations
    async fn insert_reservation(
        &mut self,
        model: stock_reservation::Model,
    ) -> Result<stock_reservation::Model, ServiceError>;
    async fn find_reservation(&mut self, id: Uuid) -> Result<Option<stock_reservation::Model>, ServiceError>;
    async fn update_reservation(&mut self, model: &stock_reservation::Model) -> Result<(), ServiceError>;
    async fn list_reservations(
        &mut self,
        query: &ReservationQuery,
    ) -> Result<Vec<stock_reservation::Model>, ServiceError>;
    async fn insert_reservation_allocation(
        &mut self,
        model: reservation_allocation::Model,
    ) -> Result<reservation_allocation::Model, ServiceError>;
    async fn list_reservation_allocations(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Vec<reservation_allocation::Model>, ServiceError>;
    async fn update_reservation_allocation(
        &mut self,
        model: &reservation_allocation::Model,
    ) -> Result<(), ServiceError>;

    // Goods receipts
    async fn insert_grn(&mut self, model: grn::Model) -> Result<grn::Model, ServiceError>;
    async fn find_grn(&mut self, id: Uuid) -> Result<Option<grn::Model>, ServiceError>;
    async fn update_grn(&mut self, model: &grn::Model) -> Result<(), ServiceError>;
    async fn insert_grn_line(&mut self, model: grn_line_item::Model) -> Result<grn_line_item::Model, ServiceError>;
    async fn list_grn_lines(&mut self, grn_id: Uuid) -> Result<Vec<grn_line_item::Model>, ServiceError>;
    async fn update_grn_line(&mut self, model: &grn_line_item::Model) -> Result<(), ServiceError>;

    // Goods issues
    async fn insert_goods_issue(&mut self, model: goods_issue::Model) -> Result<goods_issue::Model, ServiceError>;
    async fn find_goods_issue(&mut self, id: Uuid) -> Result<Option<goods_issue::Model>, ServiceError>;
    async fn insert_goods_issue_line(
        &mut self,
        model: goods_issue_line::Model,
    ) -> Result<goods_issue_line::Model, ServiceError>;
    async fn list_goods_issue_lines(
        &mut self,
        goods_issue_id: Uuid,
    ) -> Result<Vec<goods_issue_line::Model>, ServiceError>;

    // Inventory counts
    async fn insert_count(&mut self, model: inventory_count::Model) -> Result<inventory_count::Model, ServiceError>;
    async fn find_count(&mut self, id: Uuid) -> Result<Option<inventory_count::Model>, ServiceError>;
    async fn update_count(&mut self, model: &inventory_count::Model) -> Result<(), ServiceError>;
    async fn insert_count_line(
        &mut self,
        model: inventory_count_line::Model,
    ) -> Result<inventory_count_line::Model, ServiceError>;
    /// Lines in line-number order.
    async fn list_count_lines(&mut self, count_id: Uuid) -> Result<Vec<inventory_count_line::Model>, ServiceError>;
    async fn update_count_line(&mut self, model: &inventory_count_line::Model) -> Result<(), ServiceError>;

    /// Next value of a named counter, starting at 1.
    async fn next_sequence(&mut self, key: &str) -> Result<i64, ServiceError>;

    async fn commit(self: Box<Self>) -> Result<(), ServiceError>;
    async fn rollback(self: Box<Self>) -> Result<(), ServiceError>;
}
