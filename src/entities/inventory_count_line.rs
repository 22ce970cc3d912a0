use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One stock row as the system saw it and as it was counted.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_count_lines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub count_id: Uuid,
    pub line_number: i32,
    pub stock_id: Uuid,
    pub location_id: Uuid,
    pub material_id: Uuid,
    pub lot_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub system_quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub counted_quantity: Option<Decimal>,
    /// `counted - system`, set once counted.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub variance: Option<Decimal>,
    pub unit_of_measure: String,
    /// Movement that booked the variance on completion.
    pub adjustment_movement_id: Option<Uuid>,
    pub counted_by: Option<Uuid>,
    pub counted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::inventory_count::Entity",
        from = "Column::CountId",
        to = "super::inventory_count::Column::Id"
    )]
    InventoryCount,
}

impl Related<super::inventory_count::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryCount.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn record(&mut self, counted: Decimal, counted_by: Uuid, now: DateTime<Utc>) {
        self.counted_quantity = Some(counted);
        self.variance = Some(counted - self.system_quantity);
        self.counted_by = Some(counted_by);
        self.counted_at = Some(now);
    }
}
