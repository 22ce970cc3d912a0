//! Physical and cycle counts.
//!
//! Creating a count snapshots the on-hand quantity of every stock row in
//! scope. Counters record what they find against each line; completion books
//! every non-zero variance (`counted - snapshot`) as one `ADJ` movement with
//! reason `CYCLE_COUNT`. Completion is all or nothing: a variance that would
//! take a row negative or below its reserved quantity fails the whole count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::entities::{
    inventory_count, inventory_count_line, stock, AdjustmentReason, CountStatus, ReferenceType,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::store::{LedgerStore, StockQuery, UnitOfWork};

use super::locations::LocationService;
use super::movements::MovementContext;
use super::stock_ledger::StockLedger;
use super::{next_document_number, year_period};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CreateCountCommand {
    pub warehouse_id: Uuid,
    pub material_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDetails {
    pub count: inventory_count::Model,
    pub lines: Vec<inventory_count_line::Model>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCompletion {
    pub count: inventory_count::Model,
    pub lines: Vec<inventory_count_line::Model>,
    /// Stock rows after their variance was booked.
    pub adjusted: Vec<stock::Model>,
}

pub struct InventoryCountService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
}

impl InventoryCountService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, events: EventSender) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Opens a count over one material, one bin, or one material in one bin.
    #[instrument(skip(self, command), fields(warehouse_id = %command.warehouse_id))]
    pub async fn create_count(&self, command: CreateCountCommand) -> Result<CountDetails, ServiceError> {
        command.validate()?;
        if command.material_id.is_none() && command.location_id.is_none() {
            return Err(ServiceError::ValidationError(
                "a count needs a material or a location".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let details = Self::create_in(uow.as_mut(), command, now).await?;
        uow.commit().await?;
        info!(
            count_number = %details.count.count_number,
            lines = details.lines.len(),
            "Inventory count created"
        );
        Ok(details)
    }

    async fn create_in(
        uow: &mut dyn UnitOfWork,
        command: CreateCountCommand,
        now: DateTime<Utc>,
    ) -> Result<CountDetails, ServiceError> {
        if let Some(location_id) = command.location_id {
            let location = LocationService::load_in(uow, location_id).await?;
            if location.warehouse_id != command.warehouse_id {
                return Err(ServiceError::ValidationError(format!(
                    "location {} is not in warehouse {}",
                    location.code, command.warehouse_id
                )));
            }
        }

        let query = StockQuery {
            material_id: command.material_id,
            location_id: command.location_id,
            warehouse_id: Some(command.warehouse_id),
            ..StockQuery::default()
        };
        let mut rows: Vec<stock::Model> = uow
            .list_stock(&query)
            .await?
            .into_iter()
            .map(|position| position.stock)
            .collect();
        rows.sort_by_key(|row| (row.location_id, row.material_id, row.lot_id));

        let count_number = next_document_number(uow, "CNT", &year_period(now), 4).await?;
        let count = uow
            .insert_count(inventory_count::Model {
                id: Uuid::new_v4(),
                count_number,
                warehouse_id: command.warehouse_id,
                material_id: command.material_id,
                location_id: command.location_id,
                status: CountStatus::Draft,
                notes: command.notes,
                created_by: command.created_by,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let mut lines = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            let line = uow
                .insert_count_line(inventory_count_line::Model {
                    id: Uuid::new_v4(),
                    count_id: count.id,
                    line_number: index as i32 + 1,
                    stock_id: row.id,
                    location_id: row.location_id,
                    material_id: row.material_id,
                    lot_id: row.lot_id,
                    system_quantity: row.quantity,
                    counted_quantity: None,
                    variance: None,
                    unit_of_measure: row.unit_of_measure,
                    adjustment_movement_id: None,
                    counted_by: None,
                    counted_at: None,
                    created_at: now,
                })
                .await?;
            lines.push(line);
        }
        Ok(CountDetails { count, lines })
    }

    #[instrument(skip(self))]
    pub async fn start_count(&self, count_id: Uuid) -> Result<inventory_count::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut count = Self::load_in(uow.as_mut(), count_id).await?;
        count.start(now)?;
        uow.update_count(&count).await?;
        uow.commit().await?;
        Ok(count)
    }

    /// Records what was found on one line. Recording again overwrites the
    /// earlier figure until the count completes.
    #[instrument(skip(self))]
    pub async fn record_count(
        &self,
        count_id: Uuid,
        line_id: Uuid,
        counted_quantity: Decimal,
        counted_by: Uuid,
    ) -> Result<inventory_count_line::Model, ServiceError> {
        if counted_quantity.is_sign_negative() {
            return Err(ServiceError::InvalidQuantity(format!(
                "counted quantity must not be negative, got {}",
                counted_quantity
            )));
        }

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let count = Self::load_in(uow.as_mut(), count_id).await?;
        count.ensure_counting()?;
        let mut line = uow
            .list_count_lines(count_id)
            .await?
            .into_iter()
            .find(|l| l.id == line_id)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Line {} not found on count {}",
                    line_id, count.count_number
                ))
            })?;
        line.record(counted_quantity, counted_by, now);
        uow.update_count_line(&line).await?;
        uow.commit().await?;
        Ok(line)
    }

    /// Books every variance and closes the count. Every line must be counted.
    #[instrument(skip(self))]
    pub async fn complete_count(
        &self,
        count_id: Uuid,
        actor_id: Uuid,
    ) -> Result<CountCompletion, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let (completion, events) = Self::complete_in(uow.as_mut(), count_id, actor_id, now).await?;
        uow.commit().await?;

        counter!("lot_ledger_count_adjustments_total", completion.adjusted.len() as u64);
        info!(
            count_number = %completion.count.count_number,
            lines = completion.lines.len(),
            adjusted = completion.adjusted.len(),
            "Inventory count completed"
        );
        for event in events {
            self.events.publish(event).await;
        }
        Ok(completion)
    }

    async fn complete_in(
        uow: &mut dyn UnitOfWork,
        count_id: Uuid,
        actor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(CountCompletion, Vec<Event>), ServiceError> {
        let mut count = Self::load_in(uow, count_id).await?;
        count.complete(now)?;

        let mut lines = uow.list_count_lines(count_id).await?;
        if let Some(uncounted) = lines.iter().find(|l| l.counted_quantity.is_none()) {
            return Err(ServiceError::ValidationError(format!(
                "line {} of count {} has not been counted",
                uncounted.line_number, count.count_number
            )));
        }

        let ctx = MovementContext::new(actor_id, ReferenceType::InventoryCount, Some(count.id))
            .with_notes(format!("Count {}", count.count_number));
        let mut adjusted = Vec::new();
        let mut events = Vec::new();
        for line in lines.iter_mut() {
            let variance = line.variance.unwrap_or(Decimal::ZERO);
            if variance.is_zero() {
                continue;
            }
            let row = StockLedger::load_row_in(uow, line.stock_id).await?;
            let (row, movement) = StockLedger::adjust_row(
                uow,
                row,
                variance,
                AdjustmentReason::CycleCount,
                &ctx,
                now,
            )
            .await?;
            warn!(
                count_number = %count.count_number,
                stock_id = %row.id,
                variance = %variance,
                "Count variance booked"
            );

            line.adjustment_movement_id = Some(movement.id);
            uow.update_count_line(line).await?;
            events.push(Event::StockAdjusted {
                stock_id: row.id,
                material_id: row.material_id,
                delta: variance,
                reason: AdjustmentReason::CycleCount,
                new_quantity: row.quantity,
            });
            adjusted.push(row);
        }

        uow.update_count(&count).await?;
        Ok((
            CountCompletion {
                count,
                lines,
                adjusted,
            },
            events,
        ))
    }

    #[instrument(skip(self))]
    pub async fn cancel_count(&self, count_id: Uuid) -> Result<inventory_count::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut count = Self::load_in(uow.as_mut(), count_id).await?;
        count.cancel(now)?;
        uow.update_count(&count).await?;
        uow.commit().await?;
        info!(count_number = %count.count_number, "Inventory count cancelled");
        Ok(count)
    }

    pub async fn get_count(&self, count_id: Uuid) -> Result<CountDetails, ServiceError> {
        let mut uow = self.store.begin().await?;
        let count = Self::load_in(uow.as_mut(), count_id).await?;
        let lines = uow.list_count_lines(count_id).await?;
        uow.commit().await?;
        Ok(CountDetails { count, lines })
    }

    async fn load_in(
        uow: &mut dyn UnitOfWork,
        count_id: Uuid,
    ) -> Result<inventory_count::Model, ServiceError> {
        uow.find_count(count_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Inventory count {} not found", count_id)))
    }
}
