use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// One physical quantity record per (warehouse, zone, location, material, lot).
///
/// `available_quantity` is a read cache of `quantity - reserved_quantity` and is
/// recomputed by every mutation below; it is never written independently.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub warehouse_id: Uuid,
    pub zone_id: Uuid,
    pub location_id: Uuid,
    pub material_id: Uuid,
    pub lot_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub reserved_quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub available_quantity: Decimal,
    pub unit_of_measure: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::lot::Entity",
        from = "Column::LotId",
        to = "super::lot::Column::Id"
    )]
    Lot,
    #[sea_orm(
        belongs_to = "super::location::Entity",
        from = "Column::LocationId",
        to = "super::location::Column::Id"
    )]
    Location,
}

impl Related<super::lot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lot.def()
    }
}

impl Related<super::location::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Location.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Natural key of a stock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub location_id: Uuid,
    pub material_id: Uuid,
    pub lot_id: Option<Uuid>,
}

/// What a release did to the reserved quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// More was released than was held; reserved was floored at zero.
    Underflow { missing: Decimal },
}

impl Model {
    pub fn empty(
        key: StockKey,
        warehouse_id: Uuid,
        zone_id: Uuid,
        unit_of_measure: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            warehouse_id,
            zone_id,
            location_id: key.location_id,
            material_id: key.material_id,
            lot_id: key.lot_id,
            quantity: Decimal::ZERO,
            reserved_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            unit_of_measure,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey {
            location_id: self.location_id,
            material_id: self.material_id,
            lot_id: self.lot_id,
        }
    }

    pub fn available(&self) -> Decimal {
        self.quantity - self.reserved_quantity
    }

    pub fn receive(&mut self, qty: Decimal, now: DateTime<Utc>) -> Result<(), ServiceError> {
        ensure_positive(qty)?;
        self.quantity += qty;
        self.touch(now);
        Ok(())
    }

    /// Removes unreserved quantity. The reserved hold is left intact.
    pub fn issue(&mut self, qty: Decimal, now: DateTime<Utc>) -> Result<(), ServiceError> {
        ensure_positive(qty)?;
        if self.available() < qty {
            return Err(ServiceError::insufficient(
                self.material_id,
                qty,
                self.available(),
            ));
        }
        self.quantity -= qty;
        self.touch(now);
        Ok(())
    }

    /// Converts held quantity into an issue: quantity and reserved drop together.
    pub fn issue_reserved(&mut self, qty: Decimal, now: DateTime<Utc>) -> Result<(), ServiceError> {
        ensure_positive(qty)?;
        if self.reserved_quantity < qty || self.quantity < qty {
            return Err(ServiceError::insufficient(
                self.material_id,
                qty,
                self.reserved_quantity.min(self.quantity),
            ));
        }
        self.quantity -= qty;
        self.reserved_quantity -= qty;
        self.touch(now);
        Ok(())
    }

    pub fn reserve(&mut self, qty: Decimal, now: DateTime<Utc>) -> Result<(), ServiceError> {
        ensure_positive(qty)?;
        if self.available() < qty {
            return Err(ServiceError::insufficient(
                self.material_id,
                qty,
                self.available(),
            ));
        }
        self.reserved_quantity += qty;
        self.touch(now);
        Ok(())
    }

    pub fn release(&mut self, qty: Decimal, now: DateTime<Utc>) -> Result<ReleaseOutcome, ServiceError> {
        ensure_positive(qty)?;
        let outcome = if qty > self.reserved_quantity {
            let missing = qty - self.reserved_quantity;
            self.reserved_quantity = Decimal::ZERO;
            ReleaseOutcome::Underflow { missing }
        } else {
            self.reserved_quantity -= qty;
            ReleaseOutcome::Released
        };
        self.touch(now);
        Ok(outcome)
    }

    /// Applies a signed correction. The result may not go negative or below the held quantity.
    pub fn adjust(&mut self, delta: Decimal, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if delta.is_zero() {
            return Err(ServiceError::InvalidQuantity(
                "adjustment delta must be non-zero".to_string(),
            ));
        }
        let result = self.quantity + delta;
        if result < Decimal::ZERO {
            return Err(ServiceError::InvalidQuantity(format!(
                "adjustment of {} would leave {} on hand",
                delta, result
            )));
        }
        if result < self.reserved_quantity {
            return Err(ServiceError::InvalidQuantity(format!(
                "adjustment of {} would leave {} on hand below {} reserved",
                delta, result, self.reserved_quantity
            )));
        }
        self.quantity = result;
        self.touch(now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.available_quantity = self.available();
        self.updated_at = now;
    }
}

fn ensure_positive(qty: Decimal) -> Result<(), ServiceError> {
    if qty <= Decimal::ZERO {
        return Err(ServiceError::InvalidQuantity(format!(
            "quantity must be positive, got {}",
            qty
        )));
    }
    Ok(())
}
