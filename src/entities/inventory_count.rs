use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CountStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

/// Physical count header. Lines snapshot the system quantity of each stock
/// row when the count is created.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_counts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub count_number: String,
    pub warehouse_id: Uuid,
    /// Limits the count to one material when set.
    pub material_id: Option<Uuid>,
    /// Limits the count to one bin when set.
    pub location_id: Option<Uuid>,
    pub status: CountStatus,
    pub notes: Option<String>,
    pub created_by: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::inventory_count_line::Entity")]
    Lines,
}

impl Related<super::inventory_count_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    fn closed(&self) -> Option<ServiceError> {
        match self.status {
            CountStatus::Completed => Some(ServiceError::AlreadyCompleted(format!(
                "count {} is completed",
                self.count_number
            ))),
            CountStatus::Cancelled => Some(ServiceError::InvalidStatus(format!(
                "count {} is cancelled",
                self.count_number
            ))),
            CountStatus::Draft | CountStatus::InProgress => None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if let Some(err) = self.closed() {
            return Err(err);
        }
        if self.status == CountStatus::Draft {
            self.status = CountStatus::InProgress;
            self.started_at = Some(now);
            self.updated_at = now;
        }
        Ok(())
    }

    /// Counted quantities are only accepted while counting is under way.
    pub fn ensure_counting(&self) -> Result<(), ServiceError> {
        if let Some(err) = self.closed() {
            return Err(err);
        }
        if self.status != CountStatus::InProgress {
            return Err(ServiceError::InvalidStatus(format!(
                "count {} must be started before recording, found {}",
                self.count_number, self.status
            )));
        }
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.ensure_counting()?;
        self.status = CountStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if let Some(err) = self.closed() {
            return Err(err);
        }
        self.status = CountStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }
}
