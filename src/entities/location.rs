use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ZoneType {
    #[sea_orm(string_value = "RECEIVING")]
    Receiving,
    #[sea_orm(string_value = "QUARANTINE")]
    Quarantine,
    #[sea_orm(string_value = "STORAGE")]
    Storage,
    #[sea_orm(string_value = "COLD")]
    Cold,
    #[sea_orm(string_value = "PICKING")]
    Picking,
    #[sea_orm(string_value = "SHIPPING")]
    Shipping,
}

/// A bin within a zone of a warehouse. Warehouses and zones are referenced by id only.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "locations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub warehouse_id: Uuid,
    pub zone_id: Uuid,
    pub code: String,
    pub zone_type: ZoneType,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stock::Entity")]
    Stock,
}

impl Related<super::stock::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Stock.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
