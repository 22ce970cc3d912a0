use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, QuerySelect, SqlErr, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use super::{LedgerStore, LotQuery, MovementQuery, ReservationQuery, StockQuery, UnitOfWork};
use crate::entities::{
    document_sequence, goods_issue, goods_issue_line, grn, grn_line_item, inventory_count,
    inventory_count_line, location, lot, reservation_allocation, stock, stock_movement,
    stock_reservation, StockKey, ZoneType,
};
use crate::errors::ServiceError;
use crate::fefo::StockPosition;

/// Ledger store backed by a SeaORM connection pool. Each unit of work is one
/// database transaction; on PostgreSQL locked stock reads use `FOR UPDATE`.
#[derive(Debug, Clone)]
pub struct SeaOrmStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LedgerStore for SeaOrmStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, ServiceError> {
        let backend = self.db.get_database_backend();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        Ok(Box::new(SeaOrmUnitOfWork { txn, backend }))
    }
}

struct SeaOrmUnitOfWork {
    txn: DatabaseTransaction,
    backend: DbBackend,
}

/// Unique-key violations mean another writer got there first.
fn map_write_err(err: DbErr, id: Uuid) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => {
            debug!(%id, detail = %detail, "Unique constraint violation treated as concurrent write");
            ServiceError::ConcurrentModification(id)
        }
        _ => ServiceError::db_error(err),
    }
}

fn ensure_one_row(rows_affected: u64, kind: &str, id: Uuid) -> Result<(), ServiceError> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(ServiceError::NotFound(format!("{} {} not found", kind, id)))
    }
}

#[async_trait]
impl UnitOfWork for SeaOrmUnitOfWork {
    async fn insert_location(&mut self, model: location::Model) -> Result<location::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn find_location(&mut self, id: Uuid) -> Result<Option<location::Model>, ServiceError> {
        Ok(location::Entity::find_by_id(id).one(&self.txn).await?)
    }

    async fn list_locations(
        &mut self,
        warehouse_id: Uuid,
        zone_type: Option<ZoneType>,
    ) -> Result<Vec<location::Model>, ServiceError> {
        let mut select = location::Entity::find()
            .filter(location::Column::WarehouseId.eq(warehouse_id))
            .order_by_asc(location::Column::Code);
        if let Some(zone_type) = zone_type {
            select = select.filter(location::Column::ZoneType.eq(zone_type));
        }
        Ok(select.all(&self.txn).await?)
    }

    async fn insert_lot(&mut self, model: lot::Model) -> Result<lot::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn find_lot(&mut self, id: Uuid) -> Result<Option<lot::Model>, ServiceError> {
        Ok(lot::Entity::find_by_id(id).one(&self.txn).await?)
    }

    async fn find_lot_by_number(&mut self, lot_number: &str) -> Result<Option<lot::Model>, ServiceError> {
        Ok(lot::Entity::find()
            .filter(lot::Column::LotNumber.eq(lot_number))
            .one(&self.txn)
            .await?)
    }

    async fn update_lot_status(&mut self, model: &lot::Model) -> Result<(), ServiceError> {
        let result = lot::Entity::update_many()
            .col_expr(lot::Column::QcStatus, Expr::value(model.qc_status))
            .col_expr(lot::Column::Status, Expr::value(model.status))
            .col_expr(lot::Column::QcNotes, Expr::value(model.qc_notes.clone()))
            .col_expr(lot::Column::UpdatedAt, Expr::value(model.updated_at))
            .filter(lot::Column::Id.eq(model.id))
            .exec(&self.txn)
            .await?;
        ensure_one_row(result.rows_affected, "Lot", model.id)
    }

    async fn list_lots(&mut self, query: &LotQuery) -> Result<Vec<lot::Model>, ServiceError> {
        let mut select = lot::Entity::find()
            .order_by_asc(lot::Column::ExpiryDate)
            .order_by_asc(lot::Column::LotNumber)
            .limit(query.effective_limit());
        if let Some(material_id) = query.material_id {
            select = select.filter(lot::Column::MaterialId.eq(material_id));
        }
        if let Some(status) = query.status {
            select = select.filter(lot::Column::Status.eq(status));
        }
        if let Some(date) = query.expiring_on_or_before {
            select = select.filter(lot::Column::ExpiryDate.lte(date));
        }
        Ok(select.all(&self.txn).await?)
    }

    async fn find_stock(&mut self, id: Uuid) -> Result<Option<stock::Model>, ServiceError> {
        let mut select = stock::Entity::find_by_id(id);
        if self.backend == DbBackend::Postgres {
            select = select.lock_exclusive();
        }
        Ok(select.one(&self.txn).await?)
    }

    async fn find_stock_by_key(&mut self, key: &StockKey) -> Result<Option<stock::Model>, ServiceError> {
        let mut select = stock::Entity::find()
            .filter(stock::Column::LocationId.eq(key.location_id))
            .filter(stock::Column::MaterialId.eq(key.material_id));
        select = match key.lot_id {
            Some(lot_id) => select.filter(stock::Column::LotId.eq(lot_id)),
            None => select.filter(stock::Column::LotId.is_null()),
        };
        if self.backend == DbBackend::Postgres {
            select = select.lock_exclusive();
        }
        Ok(select.one(&self.txn).await?)
    }

    async fn list_stock(&mut self, query: &StockQuery) -> Result<Vec<StockPosition>, ServiceError> {
        query.validate()?;

        let mut select = stock::Entity::find().order_by_asc(stock::Column::Id);
        if let Some(material_id) = query.material_id {
            select = select.filter(stock::Column::MaterialId.eq(material_id));
        }
        if let Some(lot_id) = query.lot_id {
            select = select.filter(stock::Column::LotId.eq(lot_id));
        }
        if let Some(warehouse_id) = query.warehouse_id {
            select = select.filter(stock::Column::WarehouseId.eq(warehouse_id));
        }
        if let Some(location_id) = query.location_id {
            select = select.filter(stock::Column::LocationId.eq(location_id));
        }
        // Lock the stock rows alone; FOR UPDATE cannot cover the nullable side of a join.
        if query.for_update && self.backend == DbBackend::Postgres {
            select = select.lock_exclusive();
        }
        let rows = select.all(&self.txn).await?;

        let lot_ids: Vec<Uuid> = rows.iter().filter_map(|r| r.lot_id).collect();
        let lots: HashMap<Uuid, lot::Model> = if lot_ids.is_empty() {
            HashMap::new()
        } else {
            lot::Entity::find()
                .filter(lot::Column::Id.is_in(lot_ids))
                .all(&self.txn)
                .await?
                .into_iter()
                .map(|l| (l.id, l))
                .collect()
        };

        Ok(rows
            .into_iter()
            .map(|row| {
                let lot = row.lot_id.and_then(|id| lots.get(&id).cloned());
                StockPosition::new(row, lot)
            })
            .collect())
    }

    async fn insert_stock(&mut self, model: stock::Model) -> Result<stock::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn update_stock(&mut self, model: &stock::Model) -> Result<stock::Model, ServiceError> {
        let next_version = model.version + 1;
        let result = stock::Entity::update_many()
            .col_expr(stock::Column::Quantity, Expr::value(model.quantity))
            .col_expr(
                stock::Column::ReservedQuantity,
                Expr::value(model.reserved_quantity),
            )
            .col_expr(
                stock::Column::AvailableQuantity,
                Expr::value(model.available_quantity),
            )
            .col_expr(stock::Column::Version, Expr::value(next_version))
            .col_expr(stock::Column::UpdatedAt, Expr::value(model.updated_at))
            .filter(stock::Column::Id.eq(model.id))
            .filter(stock::Column::Version.eq(model.version))
            .exec(&self.txn)
            .await?;

        if result.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(model.id));
        }

        let mut updated = model.clone();
        updated.version = next_version;
        Ok(updated)
    }

    async fn insert_movement(
        &mut self,
        model: stock_movement::Model,
    ) -> Result<stock_movement::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn list_movements(
        &mut self,
        query: &MovementQuery,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        query.check()?;

        let mut select = stock_movement::Entity::find()
            .order_by_desc(stock_movement::Column::CreatedAt)
            .order_by_desc(stock_movement::Column::MovementNumber)
            .limit(query.limit);
        if let Some(material_id) = query.material_id {
            select = select.filter(stock_movement::Column::MaterialId.eq(material_id));
        }
        if let Some(lot_id) = query.lot_id {
            select = select.filter(stock_movement::Column::LotId.eq(lot_id));
        }
        if let Some(since) = query.since {
            select = select.filter(stock_movement::Column::CreatedAt.gte(since));
        }
        Ok(select.all(&self.txn).await?)
    }

    async fn insert_reservation(
        &mut self,
        model: stock_reservation::Model,
    ) -> Result<stock_reservation::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn find_reservation(&mut self, id: Uuid) -> Result<Option<stock_reservation::Model>, ServiceError> {
        let mut select = stock_reservation::Entity::find_by_id(id);
        if self.backend == DbBackend::Postgres {
            select = select.lock_exclusive();
        }
        Ok(select.one(&self.txn).await?)
    }

    async fn update_reservation(&mut self, model: &stock_reservation::Model) -> Result<(), ServiceError> {
        let active = stock_reservation::ActiveModel {
            id: Set(model.id),
            status: Set(model.status),
            released_at: Set(model.released_at),
            fulfilled_at: Set(model.fulfilled_at),
            ..Default::default()
        };
        active.update(&self.txn).await?;
        Ok(())
    }

    async fn list_reservations(
        &mut self,
        query: &ReservationQuery,
    ) -> Result<Vec<stock_reservation::Model>, ServiceError> {
        let mut select = stock_reservation::Entity::find()
            .order_by_asc(stock_reservation::Column::CreatedAt)
            .order_by_asc(stock_reservation::Column::Id)
            .limit(query.effective_limit());
        if let Some(material_id) = query.material_id {
            select = select.filter(stock_reservation::Column::MaterialId.eq(material_id));
        }
        if let Some(reservation_type) = query.reservation_type {
            select = select.filter(stock_reservation::Column::ReservationType.eq(reservation_type));
        }
        if let Some(reference_id) = query.reference_id {
            select = select.filter(stock_reservation::Column::ReferenceId.eq(reference_id));
        }
        if let Some(status) = query.status {
            select = select.filter(stock_reservation::Column::Status.eq(status));
        }
        if let Some(cutoff) = query.expires_on_or_before {
            select = select
                .filter(stock_reservation::Column::ExpiresAt.is_not_null())
                .filter(stock_reservation::Column::ExpiresAt.lte(cutoff));
        }
        Ok(select.all(&self.txn).await?)
    }

    async fn insert_reservation_allocation(
        &mut self,
        model: reservation_allocation::Model,
    ) -> Result<reservation_allocation::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn list_reservation_allocations(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Vec<reservation_allocation::Model>, ServiceError> {
        Ok(reservation_allocation::Entity::find()
            .filter(reservation_allocation::Column::ReservationId.eq(reservation_id))
            .all(&self.txn)
            .await?)
    }

    async fn update_reservation_allocation(
        &mut self,
        model: &reservation_allocation::Model,
    ) -> Result<(), ServiceError> {
        let result = reservation_allocation::Entity::update_many()
            .col_expr(
                reservation_allocation::Column::Consumed,
                Expr::value(model.consumed),
            )
            .filter(reservation_allocation::Column::Id.eq(model.id))
            .exec(&self.txn)
            .await?;
        ensure_one_row(result.rows_affected, "Reservation allocation", model.id)
    }

    async fn insert_grn(&mut self, model: grn::Model) -> Result<grn::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn find_grn(&mut self, id: Uuid) -> Result<Option<grn::Model>, ServiceError> {
        let mut select = grn::Entity::find_by_id(id);
        if self.backend == DbBackend::Postgres {
            select = select.lock_exclusive();
        }
        Ok(select.one(&self.txn).await?)
    }

    async fn update_grn(&mut self, model: &grn::Model) -> Result<(), ServiceError> {
        let active = grn::ActiveModel {
            id: Set(model.id),
            status: Set(model.status),
            completed_at: Set(model.completed_at),
            notes: Set(model.notes.clone()),
            updated_at: Set(model.updated_at),
            ..Default::default()
        };
        active.update(&self.txn).await?;
        Ok(())
    }

    async fn insert_grn_line(&mut self, model: grn_line_item::Model) -> Result<grn_line_item::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn list_grn_lines(&mut self, grn_id: Uuid) -> Result<Vec<grn_line_item::Model>, ServiceError> {
        Ok(grn_line_item::Entity::find()
            .filter(grn_line_item::Column::GrnId.eq(grn_id))
            .order_by_asc(grn_line_item::Column::LineNumber)
            .all(&self.txn)
            .await?)
    }

    async fn update_grn_line(&mut self, model: &grn_line_item::Model) -> Result<(), ServiceError> {
        model
            .clone()
            .into_active_model()
            .reset_all()
            .update(&self.txn)
            .await?;
        Ok(())
    }

    async fn insert_goods_issue(&mut self, model: goods_issue::Model) -> Result<goods_issue::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn find_goods_issue(&mut self, id: Uuid) -> Result<Option<goods_issue::Model>, ServiceError> {
        Ok(goods_issue::Entity::find_by_id(id).one(&self.txn).await?)
    }

    async fn insert_goods_issue_line(
        &mut self,
        model: goods_issue_line::Model,
    ) -> Result<goods_issue_line::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn list_goods_issue_lines(
        &mut self,
        goods_issue_id: Uuid,
    ) -> Result<Vec<goods_issue_line::Model>, ServiceError> {
        Ok(goods_issue_line::Entity::find()
            .filter(goods_issue_line::Column::GoodsIssueId.eq(goods_issue_id))
            .order_by_asc(goods_issue_line::Column::LineNumber)
            .all(&self.txn)
            .await?)
    }

    async fn insert_count(&mut self, model: inventory_count::Model) -> Result<inventory_count::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn find_count(&mut self, id: Uuid) -> Result<Option<inventory_count::Model>, ServiceError> {
        Ok(inventory_count::Entity::find_by_id(id).one(&self.txn).await?)
    }

    async fn update_count(&mut self, model: &inventory_count::Model) -> Result<(), ServiceError> {
        let active = inventory_count::ActiveModel {
            id: Set(model.id),
            status: Set(model.status),
            notes: Set(model.notes.clone()),
            started_at: Set(model.started_at),
            completed_at: Set(model.completed_at),
            updated_at: Set(model.updated_at),
            ..Default::default()
        };
        active.update(&self.txn).await?;
        Ok(())
    }

    async fn insert_count_line(
        &mut self,
        model: inventory_count_line::Model,
    ) -> Result<inventory_count_line::Model, ServiceError> {
        let id = model.id;
        model
            .into_active_model()
            .reset_all()
            .insert(&self.txn)
            .await
            .map_err(|e| map_write_err(e, id))
    }

    async fn list_count_lines(&mut self, count_id: Uuid) -> Result<Vec<inventory_count_line::Model>, ServiceError> {
        Ok(inventory_count_line::Entity::find()
            .filter(inventory_count_line::Column::CountId.eq(count_id))
            .order_by_asc(inventory_count_line::Column::LineNumber)
            .all(&self.txn)
            .await?)
    }

    async fn update_count_line(&mut self, model: &inventory_count_line::Model) -> Result<(), ServiceError> {
        model
            .clone()
            .into_active_model()
            .reset_all()
            .update(&self.txn)
            .await?;
        Ok(())
    }

    async fn next_sequence(&mut self, key: &str) -> Result<i64, ServiceError> {
        let mut select = document_sequence::Entity::find_by_id(key.to_string());
        if self.backend == DbBackend::Postgres {
            select = select.lock_exclusive();
        }

        match select.one(&self.txn).await? {
            Some(current) => {
                let next = current.last_value + 1;
                document_sequence::Entity::update_many()
                    .col_expr(document_sequence::Column::LastValue, Expr::value(next))
                    .filter(document_sequence::Column::SequenceKey.eq(key))
                    .exec(&self.txn)
                    .await?;
                Ok(next)
            }
            None => {
                document_sequence::ActiveModel {
                    sequence_key: Set(key.to_string()),
                    last_value: Set(1),
                }
                .insert(&self.txn)
                .await
                .map_err(|e| map_write_err(e, Uuid::nil()))?;
                Ok(1)
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), ServiceError> {
        self.txn.commit().await.map_err(ServiceError::db_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), ServiceError> {
        self.txn.rollback().await.map_err(ServiceError::db_error)
    }
}
