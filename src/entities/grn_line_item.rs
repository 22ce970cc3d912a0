use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lot::QcStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "grn_line_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub grn_id: Uuid,
    pub line_number: i32,
    pub po_line_item_id: Option<Uuid>,
    pub material_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub expected_quantity: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub received_quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub accepted_quantity: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub rejected_quantity: Decimal,
    pub unit_of_measure: String,
    pub supplier_lot_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
    /// Putaway target once QC passes; defaults to the warehouse's first storage location.
    pub storage_location_id: Option<Uuid>,
    pub lot_id: Option<Uuid>,
    pub qc_status: QcStatus,
    pub qc_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::grn::Entity",
        from = "Column::GrnId",
        to = "super::grn::Column::Id"
    )]
    Grn,
}

impl Related<super::grn::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Grn.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
