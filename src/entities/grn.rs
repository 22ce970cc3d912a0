use chrono::{DateTime, NaiveDate, Utc};
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
pub enum GrnStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

/// Goods receipt note header.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "grns")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub grn_number: String,
    pub grn_date: NaiveDate,
    pub warehouse_id: Uuid,
    pub po_id: Option<Uuid>,
    pub po_number: Option<String>,
    pub supplier_id: Option<Uuid>,
    pub delivery_note_number: Option<String>,
    pub status: GrnStatus,
    pub notes: Option<String>,
    pub received_by: Uuid,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::grn_line_item::Entity")]
    LineItems,
}

impl Related<super::grn_line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LineItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Lines may only be added while the receipt is still open.
    pub fn ensure_editable(&self) -> Result<(), ServiceError> {
        match self.status {
            GrnStatus::Draft | GrnStatus::InProgress => Ok(()),
            GrnStatus::Completed => Err(ServiceError::AlreadyCompleted(format!(
                "GRN {} is completed",
                self.grn_number
            ))),
            GrnStatus::Cancelled => Err(ServiceError::InvalidStatus(format!(
                "GRN {} is cancelled",
                self.grn_number
            ))),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        match self.status {
            GrnStatus::Draft => {
                self.status = GrnStatus::InProgress;
                self.updated_at = now;
                Ok(())
            }
            GrnStatus::InProgress => Ok(()),
            _ => self.ensure_editable(),
        }
    }

    /// Only a receipt that is being processed can complete.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.ensure_editable()?;
        if self.status != GrnStatus::InProgress {
            return Err(ServiceError::InvalidStatus(format!(
                "GRN {} must be in progress to complete, found {}",
                self.grn_number, self.status
            )));
        }
        self.status = GrnStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.ensure_editable()?;
        self.status = GrnStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            grn_number: "GRN-2026-0001".into(),
            grn_date: now.date_naive(),
            warehouse_id: Uuid::new_v4(),
            po_id: None,
            po_number: None,
            supplier_id: None,
            delivery_note_number: None,
            status: GrnStatus::Draft,
            notes: None,
            received_by: Uuid::new_v4(),
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn completes_once() {
        let mut grn = draft();
        grn.start(Utc::now()).unwrap();
        assert_eq!(grn.status, GrnStatus::InProgress);
        grn.complete(Utc::now()).unwrap();
        assert!(grn.completed_at.is_some());
        assert!(matches!(
            grn.complete(Utc::now()),
            Err(ServiceError::AlreadyCompleted(_))
        ));
        assert!(matches!(
            grn.cancel(Utc::now()),
            Err(ServiceError::AlreadyCompleted(_))
        ));
    }

    #[test]
    fn draft_must_start_before_completing() {
        let mut grn = draft();
        assert!(matches!(
            grn.complete(Utc::now()),
            Err(ServiceError::InvalidStatus(_))
        ));
        assert_eq!(grn.status, GrnStatus::Draft);
        assert!(grn.completed_at.is_none());
    }

    #[test]
    fn status_uses_upper_case_codes() {
        assert_eq!(GrnStatus::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(
            serde_json::to_value(GrnStatus::Completed).unwrap(),
            serde_json::json!("COMPLETED")
        );
    }

    #[test]
    fn cancelled_grn_is_closed() {
        let mut grn = draft();
        grn.cancel(Utc::now()).unwrap();
        assert!(matches!(
            grn.start(Utc::now()),
            Err(ServiceError::InvalidStatus(_))
        ));
        assert!(grn.complete(Utc::now()).is_err());
    }
}
