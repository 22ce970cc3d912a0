use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{LedgerStore, LotQuery, MovementQuery, ReservationQuery, StockQuery, UnitOfWork};
use crate::entities::{
    goods_issue, goods_issue_line, grn, grn_line_item, inventory_count, inventory_count_line,
    location, lot, reservation_allocation, stock, stock_movement, stock_reservation, StockKey,
    ZoneType,
};
use crate::errors::ServiceError;
use crate::fefo::StockPosition;

#[derive(Debug, Default, Clone)]
struct MemoryState {
    locations: BTreeMap<Uuid, location::Model>,
    lots: BTreeMap<Uuid, lot::Model>,
    stock: BTreeMap<Uuid, stock::Model>,
    movements: Vec<stock_movement::Model>,
    reservations: BTreeMap<Uuid, stock_reservation::Model>,
    reservation_allocations: Vec<reservation_allocation::Model>,
    grns: BTreeMap<Uuid, grn::Model>,
    grn_lines: Vec<grn_line_item::Model>,
    goods_issues: BTreeMap<Uuid, goods_issue::Model>,
    goods_issue_lines: Vec<goods_issue_line::Model>,
    counts: BTreeMap<Uuid, inventory_count::Model>,
    count_lines: Vec<inventory_count_line::Model>,
    sequences: HashMap<String, i64>,
}

/// In-process ledger store.
///
/// Units of work are serialised: `begin` takes an exclusive lock on the
/// state and works on a private copy that replaces the shared state on
/// commit. Readers therefore never observe partial writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, ServiceError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

fn not_found(kind: &str, id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("{} {} not found", kind, id))
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_location(&mut self, model: location::Model) -> Result<location::Model, ServiceError> {
        let duplicate = self.working.locations.values().any(|l| {
            l.warehouse_id == model.warehouse_id && l.code.eq_ignore_ascii_case(&model.code)
        });
        if duplicate {
            return Err(ServiceError::ValidationError(format!(
                "location code {} already exists in warehouse {}",
                model.code, model.warehouse_id
            )));
        }
        self.working.locations.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_location(&mut self, id: Uuid) -> Result<Option<location::Model>, ServiceError> {
        Ok(self.working.locations.get(&id).cloned())
    }

    async fn list_locations(
        &mut self,
        warehouse_id: Uuid,
        zone_type: Option<ZoneType>,
    ) -> Result<Vec<location::Model>, ServiceError> {
        let mut locations: Vec<_> = self
            .working
            .locations
            .values()
            .filter(|l| l.warehouse_id == warehouse_id)
            .filter(|l| zone_type.map_or(true, |z| l.zone_type == z))
            .cloned()
            .collect();
        locations.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(locations)
    }

    async fn insert_lot(&mut self, model: lot::Model) -> Result<lot::Model, ServiceError> {
        if self
            .working
            .lots
            .values()
            .any(|l| l.lot_number == model.lot_number)
        {
            return Err(ServiceError::ConcurrentModification(model.id));
        }
        self.working.lots.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_lot(&mut self, id: Uuid) -> Result<Option<lot::Model>, ServiceError> {
        Ok(self.working.lots.get(&id).cloned())
    }

    async fn find_lot_by_number(&mut self, lot_number: &str) -> Result<Option<lot::Model>, ServiceError> {
        Ok(self
            .working
            .lots
            .values()
            .find(|l| l.lot_number == lot_number)
            .cloned())
    }

    async fn update_lot_status(&mut self, model: &lot::Model) -> Result<(), ServiceError> {
        let stored = self
            .working
            .lots
            .get_mut(&model.id)
            .ok_or_else(|| not_found("Lot", model.id))?;
        stored.qc_status = model.qc_status;
        stored.status = model.status;
        stored.qc_notes = model.qc_notes.clone();
        stored.updated_at = model.updated_at;
        Ok(())
    }

    async fn list_lots(&mut self, query: &LotQuery) -> Result<Vec<lot::Model>, ServiceError> {
        let mut lots: Vec<_> = self
            .working
            .lots
            .values()
            .filter(|l| query.matches(l))
            .cloned()
            .collect();
        lots.sort_by(|a, b| {
            a.expiry_date
                .cmp(&b.expiry_date)
                .then_with(|| a.lot_number.cmp(&b.lot_number))
        });
        lots.truncate(query.effective_limit() as usize);
        Ok(lots)
    }

    async fn find_stock(&mut self, id: Uuid) -> Result<Option<stock::Model>, ServiceError> {
        Ok(self.working.stock.get(&id).cloned())
    }

    async fn find_stock_by_key(&mut self, key: &StockKey) -> Result<Option<stock::Model>, ServiceError> {
        Ok(self
            .working
            .stock
            .values()
            .find(|s| s.key() == *key)
            .cloned())
    }

    async fn list_stock(&mut self, query: &StockQuery) -> Result<Vec<StockPosition>, ServiceError> {
        query.validate()?;
        Ok(self
            .working
            .stock
            .values()
            .filter(|s| query.matches(s))
            .map(|s| {
                let lot = s.lot_id.and_then(|id| self.working.lots.get(&id).cloned());
                StockPosition::new(s.clone(), lot)
            })
            .collect())
    }

    async fn insert_stock(&mut self, model: stock::Model) -> Result<stock::Model, ServiceError> {
        let key = model.key();
        if self.working.stock.values().any(|s| s.key() == key) {
            return Err(ServiceError::ConcurrentModification(model.id));
        }
        self.working.stock.insert(model.id, model.clone());
        Ok(model)
    }

    async fn update_stock(&mut self, model: &stock::Model) -> Result<stock::Model, ServiceError> {
        let stored = self
            .working
            .stock
            .get_mut(&model.id)
            .ok_or_else(|| not_found("Stock row", model.id))?;
        if stored.version != model.version {
            return Err(ServiceError::ConcurrentModification(model.id));
        }
        let mut next = model.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn insert_movement(
        &mut self,
        model: stock_movement::Model,
    ) -> Result<stock_movement::Model, ServiceError> {
        self.working.movements.push(model.clone());
        Ok(model)
    }

    async fn list_movements(
        &mut self,
        query: &MovementQuery,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        query.check()?;
        // Insertion order is commit order; newest first
        Ok(self
            .working
            .movements
            .iter()
            .rev()
            .filter(|m| query.matches(m))
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_reservation(
        &mut self,
        model: stock_reservation::Model,
    ) -> Result<stock_reservation::Model, ServiceError> {
        self.working.reservations.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_reservation(&mut self, id: Uuid) -> Result<Option<stock_reservation::Model>, ServiceError> {
        Ok(self.working.reservations.get(&id).cloned())
    }

    async fn update_reservation(&mut self, model: &stock_reservation::Model) -> Result<(), ServiceError> {
        let stored = self
            .working
            .reservations
            .get_mut(&model.id)
            .ok_or_else(|| not_found("Reservation", model.id))?;
        *stored = model.clone();
        Ok(())
    }

    async fn list_reservations(
        &mut self,
        query: &ReservationQuery,
    ) -> Result<Vec<stock_reservation::Model>, ServiceError> {
        let mut reservations: Vec<_> = self
            .working
            .reservations
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        reservations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        reservations.truncate(query.effective_limit() as usize);
        Ok(reservations)
    }

    async fn insert_reservation_allocation(
        &mut self,
        model: reservation_allocation::Model,
    ) -> Result<reservation_allocation::Model, ServiceError> {
        self.working.reservation_allocations.push(model.clone());
        Ok(model)
    }

    async fn list_reservation_allocations(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Vec<reservation_allocation::Model>, ServiceError> {
        Ok(self
            .working
            .reservation_allocations
            .iter()
            .filter(|a| a.reservation_id == reservation_id)
            .cloned()
            .collect())
    }

    async fn update_reservation_allocation(
        &mut self,
        model: &reservation_allocation::Model,
    ) -> Result<(), ServiceError> {
        let stored = self
            .working
            .reservation_allocations
            .iter_mut()
            .find(|a| a.id == model.id)
            .ok_or_else(|| not_found("Reservation allocation", model.id))?;
        *stored = model.clone();
        Ok(())
    }

    async fn insert_grn(&mut self, model: grn::Model) -> Result<grn::Model, ServiceError> {
        self.working.grns.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_grn(&mut self, id: Uuid) -> Result<Option<grn::Model>, ServiceError> {
        Ok(self.working.grns.get(&id).cloned())
    }

    async fn update_grn(&mut self, model: &grn::Model) -> Result<(), ServiceError> {
        let stored = self
            .working
            .grns
            .get_mut(&model.id)
            .ok_or_else(|| not_found("GRN", model.id))?;
        *stored = model.clone();
        Ok(())
    }

    async fn insert_grn_line(&mut self, model: grn_line_item::Model) -> Result<grn_line_item::Model, ServiceError> {
        self.working.grn_lines.push(model.clone());
        Ok(model)
    }

    async fn list_grn_lines(&mut self, grn_id: Uuid) -> Result<Vec<grn_line_item::Model>, ServiceError> {
        let mut lines: Vec<_> = self
            .working
            .grn_lines
            .iter()
            .filter(|l| l.grn_id == grn_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.line_number);
        Ok(lines)
    }

    async fn update_grn_line(&mut self, model: &grn_line_item::Model) -> Result<(), ServiceError> {
        let stored = self
            .working
            .grn_lines
            .iter_mut()
            .find(|l| l.id == model.id)
            .ok_or_else(|| not_found("GRN line", model.id))?;
        *stored = model.clone();
        Ok(())
    }

    async fn insert_goods_issue(&mut self, model: goods_issue::Model) -> Result<goods_issue::Model, ServiceError> {
        self.working.goods_issues.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_goods_issue(&mut self, id: Uuid) -> Result<Option<goods_issue::Model>, ServiceError> {
        Ok(self.working.goods_issues.get(&id).cloned())
    }

    async fn insert_goods_issue_line(
        &mut self,
        model: goods_issue_line::Model,
    ) -> Result<goods_issue_line::Model, ServiceError> {
        self.working.goods_issue_lines.push(model.clone());
        Ok(model)
    }

    async fn list_goods_issue_lines(
        &mut self,
        goods_issue_id: Uuid,
    ) -> Result<Vec<goods_issue_line::Model>, ServiceError> {
        let mut lines: Vec<_> = self
            .working
            .goods_issue_lines
            .iter()
            .filter(|l| l.goods_issue_id == goods_issue_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.line_number);
        Ok(lines)
    }

    async fn insert_count(&mut self, model: inventory_count::Model) -> Result<inventory_count::Model, ServiceError> {
        self.working.counts.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_count(&mut self, id: Uuid) -> Result<Option<inventory_count::Model>, ServiceError> {
        Ok(self.working.counts.get(&id).cloned())
    }

    async fn update_count(&mut self, model: &inventory_count::Model) -> Result<(), ServiceError> {
        let stored = self
            .working
            .counts
            .get_mut(&model.id)
            .ok_or_else(|| not_found("Inventory count", model.id))?;
        *stored = model.clone();
        Ok(())
    }

    async fn insert_count_line(
        &mut self,
        model: inventory_count_line::Model,
    ) -> Result<inventory_count_line::Model, ServiceError> {
        self.working.count_lines.push(model.clone());
        Ok(model)
    }

    async fn list_count_lines(&mut self, count_id: Uuid) -> Result<Vec<inventory_count_line::Model>, ServiceError> {
        let mut lines: Vec<_> = self
            .working
            .count_lines
            .iter()
            .filter(|l| l.count_id == count_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.line_number);
        Ok(lines)
    }

    async fn update_count_line(&mut self, model: &inventory_count_line::Model) -> Result<(), ServiceError> {
        let stored = self
            .working
            .count_lines
            .iter_mut()
            .find(|l| l.id == model.id)
            .ok_or_else(|| not_found("Count line", model.id))?;
        *stored = model.clone();
        Ok(())
    }

    async fn next_sequence(&mut self, key: &str) -> Result<i64, ServiceError> {
        let value = self.working.sequences.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn commit(self: Box<Self>) -> Result<(), ServiceError> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ServiceError> {
        Ok(())
    }
}
