//! Optimistic-lock conflicts injected below the services: every stock write
//! fails with a version conflict while the budget lasts.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{days_from_start, Harness};
use lot_ledger::entities::{
    goods_issue, goods_issue_line, grn, grn_line_item, inventory_count, inventory_count_line,
    location, lot, reservation_allocation, stock, stock_movement, stock_reservation, IssueType, ReservationStatus, ReservationType,
    StockKey, ZoneType,
};
use lot_ledger::fefo::StockPosition;
use lot_ledger::services::issuing::{IssueStockCommand, ShortagePolicy};
use lot_ledger::services::reservations::CreateReservationCommand;
use lot_ledger::store::{LotQuery, MovementQuery, ReservationQuery, StockQuery};
use lot_ledger::{EngineSettings, LedgerStore, MemoryStore, ServiceError, UnitOfWork};

struct ConflictingStore {
    inner: MemoryStore,
    conflicts_left: Arc<AtomicU32>,
    stock_writes: Arc<AtomicU32>,
}

impl ConflictingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts_left: Arc::new(AtomicU32::new(0)),
            stock_writes: Arc::new(AtomicU32::new(0)),
        }
    }

    fn fail_next(&self, writes: u32) {
        self.conflicts_left.store(writes, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for ConflictingStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, ServiceError> {
        Ok(Box::new(ConflictingUnitOfWork {
            inner: self.inner.begin().await?,
            conflicts_left: self.conflicts_left.clone(),
            stock_writes: self.stock_writes.clone(),
        }))
    }
}

struct ConflictingUnitOfWork {
    inner: Box<dyn UnitOfWork>,
    conflicts_left: Arc<AtomicU32>,
    stock_writes: Arc<AtomicU32>,
}

#[async_trait]
impl UnitOfWork for ConflictingUnitOfWork {
    async fn update_stock(&mut self, model: &stock::Model) -> Result<stock::Model, ServiceError> {
        self.stock_writes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ServiceError::ConcurrentModification(model.id));
        }
        self.inner.update_stock(model).await
    }

    async fn insert_location(&mut self, model: location::Model) -> Result<location::Model, ServiceError> {
        self.inner.insert_location(model).await
    }
    async fn find_location(&mut self, id: Uuid) -> Result<Option<location::Model>, ServiceError> {
        self.inner.find_location(id).await
    }
    async fn list_locations(
        &mut self,
        warehouse_id: Uuid,
        zone_type: Option<ZoneType>,
    ) -> Result<Vec<location::Model>, ServiceError> {
        self.inner.list_locations(warehouse_id, zone_type).await
    }
    async fn insert_lot(&mut self, model: lot::Model) -> Result<lot::Model, ServiceError> {
        self.inner.insert_lot(model).await
    }
    async fn find_lot(&mut self, id: Uuid) -> Result<Option<lot::Model>, ServiceError> {
        self.inner.find_lot(id).await
    }
    async fn find_lot_by_number(&mut self, lot_number: &str) -> Result<Option<lot::Model>, ServiceError> {
        self.inner.find_lot_by_number(lot_number).await
    }
    async fn update_lot_status(&mut self, model: &lot::Model) -> Result<(), ServiceError> {
        self.inner.update_lot_status(model).await
    }
    async fn list_lots(&mut self, query: &LotQuery) -> Result<Vec<lot::Model>, ServiceError> {
        self.inner.list_lots(query).await
    }
    async fn find_stock(&mut self, id: Uuid) -> Result<Option<stock::Model>, ServiceError> {
        self.inner.find_stock(id).await
    }
    async fn find_stock_by_key(&mut self, key: &StockKey) -> Result<Option<stock::Model>, ServiceError> {
        self.inner.find_stock_by_key(key).await
    }
    async fn list_stock(&mut self, query: &StockQuery) -> Result<Vec<StockPosition>, ServiceError> {
        self.inner.list_stock(query).await
    }
    async fn insert_stock(&mut self, model: stock::Model) -> Result<stock::Model, ServiceError> {
        self.inner.insert_stock(model).await
    }
    async fn insert_movement(
        &mut self,
        model: stock_movement::Model,
    ) -> Result<stock_movement::Model, ServiceError> {
        self.inner.insert_movement(model).await
    }
    async fn list_movements(
        &mut self,
        query: &MovementQuery,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        self.inner.list_movements(query).await
    }
    async fn insert_reservation(
        &mut self,
        model: stock_reservation::Model,
    ) -> Result<stock_reservation::Model, ServiceError> {
        self.inner.insert_reservation(model).await
    }
    async fn find_reservation(&mut self, id: Uuid) -> Result<Option<stock_reservation::Model>, ServiceError> {
        self.inner.find_reservation(id).await
    }
    async fn update_reservation(&mut self, model: &stock_reservation::Model) -> Result<(), ServiceError> {
        self.inner.update_reservation(model).await
    }
    async fn list_reservations(
        &mut self,
        query: &ReservationQuery,
    ) -> Result<Vec<stock_reservation::Model>, ServiceError> {
        self.inner.list_reservations(query).await
    }
    async fn insert_reservation_allocation(
        &mut self,
        model: reservation_allocation::Model,
    ) -> Result<reservation_allocation::Model, ServiceError> {
        self.inner.insert_reservation_allocation(model).await
    }
    async fn list_reservation_allocations(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Vec<reservation_allocation::Model>, ServiceError> {
        self.inner.list_reservation_allocations(reservation_id).await
    }
    async fn update_reservation_allocation(
        &mut self,
        model: &reservation_allocation::Model,
    ) -> Result<(), ServiceError> {
        self.inner.update_reservation_allocation(model).await
    }
    async fn insert_grn(&mut self, model: grn::Model) -> Result<grn::Model, ServiceError> {
        self.inner.insert_grn(model).await
    }
    async fn find_grn(&mut self, id: Uuid) -> Result<Option<grn::Model>, ServiceError> {
        self.inner.find_grn(id).await
    }
    async fn update_grn(&mut self, model: &grn::Model) -> Result<(), ServiceError> {
        self.inner.update_grn(model).await
    }
    async fn insert_grn_line(&mut self, model: grn_line_item::Model) -> Result<grn_line_item::Model, ServiceError> {
        self.inner.insert_grn_line(model).await
    }
    async fn list_grn_lines(&mut self, grn_id: Uuid) -> Result<Vec<grn_line_item::Model>, ServiceError> {
        self.inner.list_grn_lines(grn_id).await
    }
    async fn update_grn_line(&mut self, model: &grn_line_item::Model) -> Result<(), ServiceError> {
        self.inner.update_grn_line(model).await
    }
    async fn insert_goods_issue(&mut self, model: goods_issue::Model) -> Result<goods_issue::Model, ServiceError> {
        self.inner.insert_goods_issue(model).await
    }
    async fn find_goods_issue(&mut self, id: Uuid) -> Result<Option<goods_issue::Model>, ServiceError> {
        self.inner.find_goods_issue(id).await
    }
    async fn insert_goods_issue_line(
        &mut self,
        model: goods_issue_line::Model,
    ) -> Result<goods_issue_line::Model, ServiceError> {
        self.inner.insert_goods_issue_line(model).await
    }
    async fn list_goods_issue_lines(
        &mut self,
        goods_issue_id: Uuid,
    ) -> Result<Vec<goods_issue_line::Model>, ServiceError> {
        self.inner.list_goods_issue_lines(goods_issue_id).await
    }
    async fn insert_count(&mut self, model: inventory_count::Model) -> Result<inventory_count::Model, ServiceError> {
        self.inner.insert_count(model).await
    }
    async fn find_count(&mut self, id: Uuid) -> Result<Option<inventory_count::Model>, ServiceError> {
        self.inner.find_count(id).await
    }
    async fn update_count(&mut self, model: &inventory_count::Model) -> Result<(), ServiceError> {
        self.inner.update_count(model).await
    }
    async fn insert_count_line(
        &mut self,
        model: inventory_count_line::Model,
    ) -> Result<inventory_count_line::Model, ServiceError> {
        self.inner.insert_count_line(model).await
    }
    async fn list_count_lines(&mut self, count_id: Uuid) -> Result<Vec<inventory_count_line::Model>, ServiceError> {
        self.inner.list_count_lines(count_id).await
    }
    async fn update_count_line(&mut self, model: &inventory_count_line::Model) -> Result<(), ServiceError> {
        self.inner.update_count_line(model).await
    }
    async fn next_sequence(&mut self, key: &str) -> Result<i64, ServiceError> {
        self.inner.next_sequence(key).await
    }
    async fn commit(self: Box<Self>) -> Result<(), ServiceError> {
        self.inner.commit().await
    }
    async fn rollback(self: Box<Self>) -> Result<(), ServiceError> {
        self.inner.rollback().await
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        max_allocation_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        ..EngineSettings::default()
    }
}

async fn harness() -> (Harness, Arc<ConflictingStore>, Uuid) {
    let store = Arc::new(ConflictingStore::new());
    let h = Harness::with_store(store.clone(), settings()).await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(60), dec!(20), &h.bin_a).await;
    (h, store, material)
}

fn reservation(h: &Harness, material_id: Uuid, quantity: Decimal) -> CreateReservationCommand {
    CreateReservationCommand {
        material_id,
        quantity,
        reservation_type: ReservationType::WorkOrder,
        reference_id: Uuid::new_v4(),
        reference_number: None,
        warehouse_id: None,
        expires_at: None,
        created_by: h.operator,
    }
}

async fn reserved(h: &Harness, material_id: Uuid) -> Decimal {
    h.services
        .stock
        .stock_for_material(material_id, None)
        .await
        .unwrap()
        .iter()
        .map(|p| p.stock.reserved_quantity)
        .sum()
}

#[tokio::test]
async fn reservation_retries_from_a_fresh_read() {
    let (h, store, material) = harness().await;
    store.fail_next(2);

    let details = h
        .services
        .reservations
        .create_reservation(reservation(&h, material, dec!(5)))
        .await
        .unwrap();

    assert_eq!(details.reservation.status, ReservationStatus::Active);
    assert_eq!(reserved(&h, material).await, dec!(5));
}

#[tokio::test]
async fn reservation_gives_up_after_the_attempt_budget() {
    let (h, store, material) = harness().await;
    store.fail_next(10);
    let writes_before = store.stock_writes.load(Ordering::SeqCst);

    let err = h
        .services
        .reservations
        .create_reservation(reservation(&h, material, dec!(5)))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::ReservationConflict { material_id, attempts: 3 } if material_id == material
    );
    assert_eq!(store.stock_writes.load(Ordering::SeqCst) - writes_before, 3);
    store.fail_next(0);
    assert_eq!(reserved(&h, material).await, Decimal::ZERO);
}

#[tokio::test]
async fn goods_issue_retries_and_then_conflicts() {
    let (h, store, material) = harness().await;
    let command = IssueStockCommand {
        material_id: material,
        quantity: dec!(4),
        issue_type: IssueType::Production,
        reference_type: lot_ledger::entities::ReferenceType::WorkOrder,
        reference_id: None,
        warehouse_id: None,
        shortage_policy: ShortagePolicy::AllOrNothing,
        issued_by: h.operator,
    };

    store.fail_next(1);
    let issued = h.services.issuing.issue_stock(command.clone()).await.unwrap();
    assert_eq!(issued.issued_quantity(), dec!(4));

    store.fail_next(u32::MAX);
    let err = h.services.issuing.issue_stock(command).await.unwrap_err();
    assert_matches!(err, ServiceError::ReservationConflict { attempts: 3, .. });
}

#[tokio::test]
async fn release_conflicts_surface_as_concurrent_modification() {
    let (h, store, material) = harness().await;
    let details = h
        .services
        .reservations
        .create_reservation(reservation(&h, material, dec!(5)))
        .await
        .unwrap();

    store.fail_next(u32::MAX);
    let err = h
        .services
        .reservations
        .release_reservation(details.reservation.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ConcurrentModification(id) if id == details.reservation.id);

    store.fail_next(0);
    let released = h
        .services
        .reservations
        .release_reservation(details.reservation.id)
        .await
        .unwrap();
    assert_eq!(released.reservation.status, ReservationStatus::Released);
    assert_eq!(reserved(&h, material).await, Decimal::ZERO);
}
