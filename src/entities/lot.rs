use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Outcome of quality control for a lot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum QcStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "PASSED")]
    Passed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    #[sea_orm(string_value = "QUARANTINE")]
    Quarantine,
}

/// Availability of a lot, independent of its QC gate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    #[sea_orm(string_value = "AVAILABLE")]
    Available,
    #[sea_orm(string_value = "RESERVED")]
    Reserved,
    #[sea_orm(string_value = "BLOCKED")]
    Blocked,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "lots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub lot_number: String,
    pub material_id: Uuid,
    pub supplier_id: Option<Uuid>,
    pub supplier_lot_number: Option<String>,
    pub grn_id: Option<Uuid>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
    pub received_date: NaiveDate,
    pub qc_status: QcStatus,
    pub status: LotStatus,
    pub qc_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stock::Entity")]
    Stock,
    #[sea_orm(
        belongs_to = "super::grn::Entity",
        from = "Column::GrnId",
        to = "super::grn::Column::Id"
    )]
    Grn,
}

impl Related<super::stock::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Stock.def()
    }
}

impl Related<super::grn::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Grn.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Attributes supplied when registering a new lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLot {
    pub material_id: Uuid,
    pub expiry_date: NaiveDate,
    pub manufactured_date: Option<NaiveDate>,
    pub supplier_id: Option<Uuid>,
    pub supplier_lot_number: Option<String>,
    pub grn_id: Option<Uuid>,
    pub received_date: NaiveDate,
}

impl Model {
    /// Builds a fresh lot in QC pending. Expiry must fall after the receipt date.
    pub fn create(
        lot_number: String,
        new_lot: NewLot,
        now: DateTime<Utc>,
    ) -> Result<Self, ServiceError> {
        if new_lot.expiry_date <= new_lot.received_date {
            return Err(ServiceError::InvalidExpiry(format!(
                "expiry {} must be after received date {}",
                new_lot.expiry_date, new_lot.received_date
            )));
        }
        if let Some(manufactured) = new_lot.manufactured_date {
            if manufactured > new_lot.expiry_date {
                return Err(ServiceError::InvalidExpiry(format!(
                    "manufactured date {} is after expiry {}",
                    manufactured, new_lot.expiry_date
                )));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            lot_number,
            material_id: new_lot.material_id,
            supplier_id: new_lot.supplier_id,
            supplier_lot_number: new_lot.supplier_lot_number,
            grn_id: new_lot.grn_id,
            manufactured_date: new_lot.manufactured_date,
            expiry_date: new_lot.expiry_date,
            received_date: new_lot.received_date,
            qc_status: QcStatus::Pending,
            status: LotStatus::Available,
            qc_notes: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date <= now.date_naive()
    }

    /// QC passed, status available, and expiry strictly after `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.ineligibility_reason(now).is_none()
    }

    pub fn ineligibility_reason(&self, now: DateTime<Utc>) -> Option<String> {
        if self.qc_status != QcStatus::Passed {
            return Some(format!("QC status is {}", self.qc_status));
        }
        if self.status != LotStatus::Available {
            return Some(format!("lot status is {}", self.status));
        }
        if self.is_expired(now) {
            return Some(format!("lot expired on {}", self.expiry_date));
        }
        None
    }

    pub fn ensure_eligible(&self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        match self.ineligibility_reason(now) {
            Some(reason) => Err(ServiceError::LotNotEligible {
                lot_id: self.id,
                reason,
            }),
            None => Ok(()),
        }
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry_date - now.date_naive()).num_days()
    }

    pub fn pass_qc(&mut self, notes: Option<String>, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.ensure_qc_open()?;
        self.qc_status = QcStatus::Passed;
        self.status = LotStatus::Available;
        self.qc_notes = notes;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail_qc(&mut self, reason: String, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.ensure_qc_open()?;
        self.qc_status = QcStatus::Failed;
        self.status = LotStatus::Blocked;
        self.qc_notes = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    pub fn block(&mut self, reason: String, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if self.status == LotStatus::Expired {
            return Err(ServiceError::InvalidStatus(format!(
                "lot {} is expired and cannot be blocked",
                self.lot_number
            )));
        }
        self.status = LotStatus::Blocked;
        self.qc_notes = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    pub fn unblock(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if self.status != LotStatus::Blocked || self.qc_status != QcStatus::Passed {
            return Err(ServiceError::InvalidStatus(format!(
                "lot {} is {} with QC {}; only blocked lots that passed QC can be unblocked",
                self.lot_number, self.status, self.qc_status
            )));
        }
        self.status = LotStatus::Available;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) {
        self.status = LotStatus::Expired;
        self.updated_at = now;
    }

    fn ensure_qc_open(&self) -> Result<(), ServiceError> {
        match self.qc_status {
            QcStatus::Pending | QcStatus::Quarantine => Ok(()),
            decided => Err(ServiceError::InvalidStatus(format!(
                "lot {} already has QC decision {}",
                self.lot_number, decided
            ))),
        }
    }
}
