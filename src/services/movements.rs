use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::{stock_movement, AdjustmentReason, MovementType, ReferenceType};
use crate::errors::ServiceError;
use crate::store::{LedgerStore, MovementQuery, UnitOfWork};

use super::{next_document_number, year_period};

/// Who caused a change and which document it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementContext {
    pub actor_id: Uuid,
    pub reference_type: ReferenceType,
    pub reference_id: Option<Uuid>,
    pub notes: Option<String>,
}

impl MovementContext {
    pub fn new(actor_id: Uuid, reference_type: ReferenceType, reference_id: Option<Uuid>) -> Self {
        Self {
            actor_id,
            reference_type,
            reference_id,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// The physical facts of one movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovement {
    pub movement_type: MovementType,
    pub material_id: Uuid,
    pub lot_id: Option<Uuid>,
    pub from_location_id: Option<Uuid>,
    pub to_location_id: Option<Uuid>,
    pub quantity: Decimal,
    pub unit_of_measure: String,
    pub adjustment_reason: Option<AdjustmentReason>,
}

/// Append-only audit trail of every quantity change.
pub struct MovementLedger {
    store: Arc<dyn LedgerStore>,
}

impl MovementLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Appends a movement inside the caller's unit of work, numbering it
    /// `MOV-{IN|OUT|TRF|ADJ}-YYYY-NNNNN`.
    pub async fn append_in(
        uow: &mut dyn UnitOfWork,
        movement: NewMovement,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<stock_movement::Model, ServiceError> {
        let prefix = format!("MOV-{}", movement.movement_type.code());
        let movement_number = next_document_number(uow, &prefix, &year_period(now), 5).await?;

        let record = stock_movement::Model {
            id: Uuid::new_v4(),
            movement_number,
            movement_type: movement.movement_type,
            reference_type: ctx.reference_type,
            reference_id: ctx.reference_id,
            material_id: movement.material_id,
            lot_id: movement.lot_id,
            from_location_id: movement.from_location_id,
            to_location_id: movement.to_location_id,
            quantity: movement.quantity,
            unit_of_measure: movement.unit_of_measure,
            adjustment_reason: movement.adjustment_reason,
            notes: ctx.notes.clone(),
            created_by: ctx.actor_id,
            created_at: now,
        };
        let saved = uow.insert_movement(record).await?;
        debug!(
            movement_number = %saved.movement_number,
            movement_type = %saved.movement_type,
            quantity = %saved.quantity,
            "Movement recorded"
        );
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn movements(
        &self,
        query: MovementQuery,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        query.check()?;
        let mut uow = self.store.begin().await?;
        let rows = uow.list_movements(&query).await?;
        uow.commit().await?;
        Ok(rows)
    }

    pub async fn movements_for_material(
        &self,
        material_id: Uuid,
        limit: u64,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        self.movements(MovementQuery::for_material(material_id).with_limit(limit))
            .await
    }

    /// Genealogy of one lot, newest first.
    pub async fn movements_for_lot(
        &self,
        lot_id: Uuid,
        limit: u64,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        self.movements(MovementQuery::for_lot(lot_id).with_limit(limit))
            .await
    }
}
