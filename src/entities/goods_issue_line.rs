use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One lot drawn for one demand line of a goods issue.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "goods_issue_lines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub goods_issue_id: Uuid,
    pub line_number: i32,
    pub material_id: Uuid,
    pub stock_id: Uuid,
    pub lot_id: Option<Uuid>,
    pub location_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub issued_quantity: Decimal,
    pub unit_of_measure: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::goods_issue::Entity",
        from = "Column::GoodsIssueId",
        to = "super::goods_issue::Column::Id"
    )]
    GoodsIssue,
}

impl Related<super::goods_issue::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::GoodsIssue.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
