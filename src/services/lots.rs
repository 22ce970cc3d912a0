//! Lot registry: identity, QC gate and expiry lifecycle of lots.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::entities::lot::{self, NewLot};
use crate::entities::LotStatus;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::store::{LedgerStore, LotQuery, UnitOfWork};

use super::{month_period, next_document_number};

const SWEEP_BATCH: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CreateLotCommand {
    pub material_id: Uuid,
    pub expiry_date: NaiveDate,
    pub manufactured_date: Option<NaiveDate>,
    pub supplier_id: Option<Uuid>,
    #[validate(length(min = 1, max = 64))]
    pub supplier_lot_number: Option<String>,
    /// Defaults to today.
    pub received_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryAlert {
    pub lot_id: Uuid,
    pub lot_number: String,
    pub material_id: Uuid,
    pub expiry_date: NaiveDate,
    pub days_until_expiry: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotSweepReport {
    pub expired: Vec<lot::Model>,
    pub alerts: Vec<ExpiryAlert>,
    pub swept_at: DateTime<Utc>,
}

pub struct LotRegistry {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
    alert_days: Vec<i64>,
}

impl LotRegistry {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        events: EventSender,
        alert_days: Vec<i64>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            alert_days,
        }
    }

    /// Registers a lot in QC pending with a `LOT-YYYYMM-NNNN` number.
    #[instrument(skip(self, command), fields(material_id = %command.material_id))]
    pub async fn create_lot(&self, command: CreateLotCommand) -> Result<lot::Model, ServiceError> {
        command.validate()?;
        let now = self.clock.now();
        let new_lot = NewLot {
            material_id: command.material_id,
            expiry_date: command.expiry_date,
            manufactured_date: command.manufactured_date,
            supplier_id: command.supplier_id,
            supplier_lot_number: command.supplier_lot_number,
            grn_id: None,
            received_date: command.received_date.unwrap_or_else(|| now.date_naive()),
        };

        let mut uow = self.store.begin().await?;
        let created = Self::create_lot_in(uow.as_mut(), new_lot, now).await?;
        uow.commit().await?;
        Ok(created)
    }

    pub(crate) async fn create_lot_in(
        uow: &mut dyn UnitOfWork,
        new_lot: NewLot,
        now: DateTime<Utc>,
    ) -> Result<lot::Model, ServiceError> {
        let lot_number = next_document_number(uow, "LOT", &month_period(now), 4).await?;
        let model = lot::Model::create(lot_number, new_lot, now)?;
        let saved = uow.insert_lot(model).await?;
        counter!("lot_ledger_lots_created_total", 1);
        info!(lot_id = %saved.id, lot_number = %saved.lot_number, expiry = %saved.expiry_date, "Lot created");
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn pass_qc(&self, lot_id: Uuid, notes: Option<String>) -> Result<lot::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let lot = Self::pass_qc_in(uow.as_mut(), lot_id, notes, self.clock.now()).await?;
        uow.commit().await?;
        self.events.publish(qc_event(&lot, true)).await;
        Ok(lot)
    }

    #[instrument(skip(self))]
    pub async fn fail_qc(&self, lot_id: Uuid, reason: String) -> Result<lot::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let lot = Self::fail_qc_in(uow.as_mut(), lot_id, reason, self.clock.now()).await?;
        uow.commit().await?;
        self.events.publish(qc_event(&lot, false)).await;
        Ok(lot)
    }

    pub(crate) async fn pass_qc_in(
        uow: &mut dyn UnitOfWork,
        lot_id: Uuid,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<lot::Model, ServiceError> {
        let mut lot = Self::load_in(uow, lot_id).await?;
        lot.pass_qc(notes, now)?;
        uow.update_lot_status(&lot).await?;
        info!(lot_number = %lot.lot_number, "Lot released by QC");
        Ok(lot)
    }

    pub(crate) async fn fail_qc_in(
        uow: &mut dyn UnitOfWork,
        lot_id: Uuid,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<lot::Model, ServiceError> {
        let mut lot = Self::load_in(uow, lot_id).await?;
        lot.fail_qc(reason, now)?;
        uow.update_lot_status(&lot).await?;
        warn!(lot_number = %lot.lot_number, "Lot rejected by QC");
        Ok(lot)
    }

    #[instrument(skip(self))]
    pub async fn block_lot(&self, lot_id: Uuid, reason: String) -> Result<lot::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut lot = Self::load_in(uow.as_mut(), lot_id).await?;
        lot.block(reason, now)?;
        uow.update_lot_status(&lot).await?;
        uow.commit().await?;
        warn!(lot_number = %lot.lot_number, "Lot blocked");
        Ok(lot)
    }

    #[instrument(skip(self))]
    pub async fn unblock_lot(&self, lot_id: Uuid) -> Result<lot::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut lot = Self::load_in(uow.as_mut(), lot_id).await?;
        lot.unblock(now)?;
        uow.update_lot_status(&lot).await?;
        uow.commit().await?;
        info!(lot_number = %lot.lot_number, "Lot unblocked");
        Ok(lot)
    }

    /// Marks every available lot whose expiry has been reached as expired and
    /// collects alerts for lots hitting one of the alert thresholds today.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<LotSweepReport, ServiceError> {
        let now = self.clock.now();
        let today = now.date_naive();
        let mut uow = self.store.begin().await?;

        let mut expired = Vec::new();
        loop {
            let query = LotQuery {
                limit: Some(SWEEP_BATCH),
                ..LotQuery::default()
            }
            .with_status(LotStatus::Available)
            .expiring_by(today);
            let batch = uow.list_lots(&query).await?;
            let batch_len = batch.len() as u64;
            for mut lot in batch {
                lot.mark_expired(now);
                uow.update_lot_status(&lot).await?;
                expired.push(lot);
            }
            if batch_len < SWEEP_BATCH {
                break;
            }
        }

        let alerts = match self.alert_days.iter().max() {
            Some(&horizon) => {
                let query = LotQuery::default()
                    .with_status(LotStatus::Available)
                    .expiring_by(today + Duration::days(horizon));
                uow.list_lots(&query)
                    .await?
                    .into_iter()
                    .filter(|lot| self.alert_days.contains(&lot.days_until_expiry(now)))
                    .map(|lot| ExpiryAlert {
                        days_until_expiry: lot.days_until_expiry(now),
                        lot_id: lot.id,
                        lot_number: lot.lot_number,
                        material_id: lot.material_id,
                        expiry_date: lot.expiry_date,
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        uow.commit().await?;

        if !expired.is_empty() {
            counter!("lot_ledger_lots_expired_total", expired.len() as u64);
            info!(count = expired.len(), "Expired lots swept");
        }
        for lot in &expired {
            self.events
                .publish(Event::LotExpired {
                    lot_id: lot.id,
                    lot_number: lot.lot_number.clone(),
                    material_id: lot.material_id,
                    expiry_date: lot.expiry_date,
                })
                .await;
        }
        for alert in &alerts {
            self.events
                .publish(Event::LotExpiringSoon {
                    lot_id: alert.lot_id,
                    lot_number: alert.lot_number.clone(),
                    material_id: alert.material_id,
                    expiry_date: alert.expiry_date,
                    days_until_expiry: alert.days_until_expiry,
                })
                .await;
        }

        Ok(LotSweepReport {
            expired,
            alerts,
            swept_at: now,
        })
    }

    /// Available lots expiring within `days`, soonest first.
    pub async fn expiring_lots(&self, days: i64) -> Result<Vec<lot::Model>, ServiceError> {
        if days < 0 {
            return Err(ServiceError::ValidationError(format!(
                "expiry horizon must not be negative, got {}",
                days
            )));
        }
        let now = self.clock.now();
        let query = LotQuery::default()
            .with_status(LotStatus::Available)
            .expiring_by(now.date_naive() + Duration::days(days));
        let mut uow = self.store.begin().await?;
        let lots = uow.list_lots(&query).await?;
        uow.commit().await?;
        Ok(lots.into_iter().filter(|l| !l.is_expired(now)).collect())
    }

    pub async fn get_lot(&self, lot_id: Uuid) -> Result<lot::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let lot = Self::load_in(uow.as_mut(), lot_id).await?;
        uow.commit().await?;
        Ok(lot)
    }

    pub async fn find_by_number(&self, lot_number: &str) -> Result<lot::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let lot = uow
            .find_lot_by_number(lot_number)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Lot {} not found", lot_number)))?;
        uow.commit().await?;
        Ok(lot)
    }

    pub async fn lots_for_material(&self, material_id: Uuid) -> Result<Vec<lot::Model>, ServiceError> {
        let mut uow = self.store.begin().await?;
        let lots = uow.list_lots(&LotQuery::for_material(material_id)).await?;
        uow.commit().await?;
        Ok(lots)
    }

    pub(crate) async fn load_in(uow: &mut dyn UnitOfWork, lot_id: Uuid) -> Result<lot::Model, ServiceError> {
        uow.find_lot(lot_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Lot {} not found", lot_id)))
    }
}

pub(crate) fn qc_event(lot: &lot::Model, passed: bool) -> Event {
    Event::LotQcDecided {
        lot_id: lot.id,
        lot_number: lot.lot_number.clone(),
        passed,
        notes: lot.qc_notes.clone(),
    }
}
