//! Goods receipt (GRN) workflow.
//!
//! Completing a receipt creates one lot per line and books the received
//! quantity into the warehouse's quarantine location. A QC pass moves the
//! accepted quantity to storage and writes off any rejected remainder; a QC
//! fail blocks the lot and leaves the stock quarantined. Lines without a
//! decision at completion stay pending until [`ReceivingService::record_qc_decision`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::entities::lot::{self, NewLot};
use crate::entities::{
    grn, grn_line_item, stock, AdjustmentReason, GrnStatus, QcStatus, ReferenceType, ZoneType,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender, ReceivedLot};
use crate::store::{LedgerStore, StockQuery, UnitOfWork};

use super::locations::LocationService;
use super::lots::{qc_event, LotRegistry};
use super::movements::MovementContext;
use super::stock_ledger::{ensure_positive, ReceiveStock, StockLedger};
use super::{next_document_number, year_period};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct GrnLineInput {
    pub material_id: Uuid,
    pub po_line_item_id: Option<Uuid>,
    pub expected_quantity: Option<Decimal>,
    pub received_quantity: Decimal,
    #[validate(length(min = 1, max = 16))]
    pub unit_of_measure: String,
    #[validate(length(min = 1, max = 64))]
    pub supplier_lot_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
    /// Preferred storage bin once QC passes.
    pub storage_location_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CreateGrnCommand {
    pub warehouse_id: Uuid,
    /// Defaults to today.
    pub grn_date: Option<NaiveDate>,
    pub po_id: Option<Uuid>,
    #[validate(length(min = 1, max = 64))]
    pub po_number: Option<String>,
    pub supplier_id: Option<Uuid>,
    #[validate(length(min = 1, max = 64))]
    pub delivery_note_number: Option<String>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    pub received_by: Uuid,
    #[serde(default)]
    pub lines: Vec<GrnLineInput>,
}

/// QC verdict for one received line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QcDecision {
    Pass {
        /// Defaults to the full received quantity.
        accepted_quantity: Option<Decimal>,
        storage_location_id: Option<Uuid>,
        notes: Option<String>,
    },
    Fail {
        reason: String,
    },
}

impl QcDecision {
    pub fn pass() -> Self {
        QcDecision::Pass {
            accepted_quantity: None,
            storage_location_id: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnDetails {
    pub grn: grn::Model,
    pub lines: Vec<grn_line_item::Model>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrnCompletion {
    pub grn: grn::Model,
    pub lines: Vec<grn_line_item::Model>,
    pub lots: Vec<lot::Model>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcRecord {
    pub line: grn_line_item::Model,
    pub lot: lot::Model,
}

pub struct ReceivingService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
}

impl ReceivingService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, events: EventSender) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    #[instrument(skip(self, command), fields(warehouse_id = %command.warehouse_id))]
    pub async fn create_grn(&self, command: CreateGrnCommand) -> Result<GrnDetails, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let details = Self::create_in(uow.as_mut(), command, now).await?;
        uow.commit().await?;
        info!(grn_number = %details.grn.grn_number, lines = details.lines.len(), "GRN created");
        Ok(details)
    }

    async fn create_in(
        uow: &mut dyn UnitOfWork,
        command: CreateGrnCommand,
        now: DateTime<Utc>,
    ) -> Result<GrnDetails, ServiceError> {
        command.validate()?;
        let grn_date = command.grn_date.unwrap_or_else(|| now.date_naive());
        for line in &command.lines {
            validate_line(line, grn_date)?;
        }

        let grn_number = next_document_number(uow, "GRN", &year_period(now), 4).await?;
        let grn = uow
            .insert_grn(grn::Model {
                id: Uuid::new_v4(),
                grn_number,
                grn_date,
                warehouse_id: command.warehouse_id,
                po_id: command.po_id,
                po_number: command.po_number,
                supplier_id: command.supplier_id,
                delivery_note_number: command.delivery_note_number,
                status: GrnStatus::Draft,
                notes: command.notes,
                received_by: command.received_by,
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let mut lines = Vec::with_capacity(command.lines.len());
        for (index, input) in command.lines.into_iter().enumerate() {
            lines.push(Self::insert_line(uow, &grn, index as i32 + 1, input, now).await?);
        }
        Ok(GrnDetails { grn, lines })
    }

    #[instrument(skip(self, input))]
    pub async fn add_line(
        &self,
        grn_id: Uuid,
        input: GrnLineInput,
    ) -> Result<grn_line_item::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let grn = Self::load_in(uow.as_mut(), grn_id).await?;
        grn.ensure_editable()?;
        validate_line(&input, grn.grn_date)?;
        let next_number = uow.list_grn_lines(grn_id).await?.len() as i32 + 1;
        let line = Self::insert_line(uow.as_mut(), &grn, next_number, input, now).await?;
        uow.commit().await?;
        Ok(line)
    }

    #[instrument(skip(self))]
    pub async fn start_processing(&self, grn_id: Uuid) -> Result<grn::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut grn = Self::load_in(uow.as_mut(), grn_id).await?;
        grn.start(now)?;
        uow.update_grn(&grn).await?;
        uow.commit().await?;
        Ok(grn)
    }

    #[instrument(skip(self))]
    pub async fn cancel_grn(&self, grn_id: Uuid) -> Result<grn::Model, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut grn = Self::load_in(uow.as_mut(), grn_id).await?;
        grn.cancel(now)?;
        uow.update_grn(&grn).await?;
        uow.commit().await?;
        info!(grn_number = %grn.grn_number, "GRN cancelled");
        Ok(grn)
    }

    /// Completes an open receipt. `decisions` maps line ids to QC verdicts;
    /// lines without one stay quarantined with QC pending.
    #[instrument(skip(self, decisions))]
    pub async fn complete_grn(
        &self,
        grn_id: Uuid,
        decisions: HashMap<Uuid, QcDecision>,
        actor_id: Uuid,
    ) -> Result<GrnCompletion, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let (completion, events) =
            Self::complete_in(uow.as_mut(), grn_id, &decisions, actor_id, now).await?;
        uow.commit().await?;
        self.announce(&completion, events).await;
        Ok(completion)
    }

    /// Creates and completes a receipt in one step, applying `decision` to
    /// every line when given.
    #[instrument(skip(self, command, decision), fields(warehouse_id = %command.warehouse_id))]
    pub async fn receive_stock(
        &self,
        command: CreateGrnCommand,
        decision: Option<QcDecision>,
    ) -> Result<GrnCompletion, ServiceError> {
        if command.lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "a receipt needs at least one line".to_string(),
            ));
        }
        let now = self.clock.now();
        let actor_id = command.received_by;
        let mut uow = self.store.begin().await?;
        let created = Self::create_in(uow.as_mut(), command, now).await?;
        let decisions: HashMap<Uuid, QcDecision> = match decision {
            Some(decision) => created
                .lines
                .iter()
                .map(|l| (l.id, decision.clone()))
                .collect(),
            None => HashMap::new(),
        };
        let (completion, events) =
            Self::complete_in(uow.as_mut(), created.grn.id, &decisions, actor_id, now).await?;
        uow.commit().await?;
        self.announce(&completion, events).await;
        Ok(completion)
    }

    async fn complete_in(
        uow: &mut dyn UnitOfWork,
        grn_id: Uuid,
        decisions: &HashMap<Uuid, QcDecision>,
        actor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(GrnCompletion, Vec<Event>), ServiceError> {
        let mut grn = Self::load_in(uow, grn_id).await?;
        // A draft passes through processing inside the same unit of work
        grn.start(now)?;

        let lines = uow.list_grn_lines(grn_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "GRN {} has no line items",
                grn.grn_number
            )));
        }
        if let Some(unknown) = decisions.keys().find(|id| !lines.iter().any(|l| l.id == **id)) {
            return Err(ServiceError::ValidationError(format!(
                "QC decision references line {} which is not on GRN {}",
                unknown, grn.grn_number
            )));
        }

        let quarantine =
            LocationService::default_location_in(uow, grn.warehouse_id, ZoneType::Quarantine).await?;
        let ctx = MovementContext::new(actor_id, ReferenceType::Grn, Some(grn.id))
            .with_notes(grn.grn_number.clone());

        let mut events = Vec::new();
        let mut received = Vec::with_capacity(lines.len());
        let mut completed_lines = Vec::with_capacity(lines.len());
        let mut lots = Vec::with_capacity(lines.len());

        for mut line in lines {
            let lot = LotRegistry::create_lot_in(
                uow,
                NewLot {
                    material_id: line.material_id,
                    expiry_date: line.expiry_date,
                    manufactured_date: line.manufactured_date,
                    supplier_id: grn.supplier_id,
                    supplier_lot_number: line.supplier_lot_number.clone(),
                    grn_id: Some(grn.id),
                    received_date: grn.grn_date,
                },
                now,
            )
            .await?;
            let quarantined = StockLedger::receive_in(
                uow,
                ReceiveStock {
                    location_id: quarantine.id,
                    material_id: line.material_id,
                    lot_id: Some(lot.id),
                    quantity: line.received_quantity,
                    unit_of_measure: line.unit_of_measure.clone(),
                },
                &ctx,
                now,
            )
            .await?;
            line.lot_id = Some(lot.id);

            let lot = match decisions.get(&line.id) {
                Some(decision) => {
                    let decided =
                        Self::apply_qc_in(uow, &grn, &mut line, quarantined, decision, &ctx, now).await?;
                    events.push(qc_event(&decided, decided.qc_status == QcStatus::Passed));
                    decided
                }
                None => lot,
            };
            uow.update_grn_line(&line).await?;

            received.push(ReceivedLot {
                line_id: line.id,
                po_line_item_id: line.po_line_item_id,
                material_id: line.material_id,
                lot_id: lot.id,
                lot_number: lot.lot_number.clone(),
                received_quantity: line.received_quantity,
                accepted_quantity: line.accepted_quantity,
            });
            completed_lines.push(line);
            lots.push(lot);
        }

        grn.complete(now)?;
        uow.update_grn(&grn).await?;
        events.push(Event::GrnCompleted {
            grn_id: grn.id,
            grn_number: grn.grn_number.clone(),
            po_id: grn.po_id,
            warehouse_id: grn.warehouse_id,
            lots: received,
        });

        Ok((
            GrnCompletion {
                grn,
                lines: completed_lines,
                lots,
            },
            events,
        ))
    }

    /// Records the QC verdict for a lot whose receipt completed with QC pending.
    #[instrument(skip(self, decision))]
    pub async fn record_qc_decision(
        &self,
        lot_id: Uuid,
        decision: QcDecision,
        actor_id: Uuid,
    ) -> Result<QcRecord, ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;

        let lot = LotRegistry::load_in(uow.as_mut(), lot_id).await?;
        let grn_id = lot.grn_id.ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "lot {} was not received through a GRN",
                lot.lot_number
            ))
        })?;
        let grn = Self::load_in(uow.as_mut(), grn_id).await?;
        if grn.status != GrnStatus::Completed {
            return Err(ServiceError::InvalidStatus(format!(
                "GRN {} is {}; decide QC when completing it",
                grn.grn_number, grn.status
            )));
        }
        let mut line = uow
            .list_grn_lines(grn_id)
            .await?
            .into_iter()
            .find(|l| l.lot_id == Some(lot_id))
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No GRN line for lot {}", lot.lot_number))
            })?;
        if line.qc_status != QcStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "line {} of GRN {} already has QC decision {}",
                line.line_number, grn.grn_number, line.qc_status
            )));
        }

        let quarantined = Self::quarantine_row_in(uow.as_mut(), lot_id).await?;
        let ctx = MovementContext::new(actor_id, ReferenceType::Grn, Some(grn.id))
            .with_notes(grn.grn_number.clone());
        let lot = Self::apply_qc_in(uow.as_mut(), &grn, &mut line, quarantined, &decision, &ctx, now).await?;
        uow.update_grn_line(&line).await?;
        uow.commit().await?;

        self.events
            .publish(qc_event(&lot, lot.qc_status == QcStatus::Passed))
            .await;
        Ok(QcRecord { line, lot })
    }

    async fn apply_qc_in(
        uow: &mut dyn UnitOfWork,
        grn: &grn::Model,
        line: &mut grn_line_item::Model,
        quarantined: stock::Model,
        decision: &QcDecision,
        ctx: &MovementContext,
        now: DateTime<Utc>,
    ) -> Result<lot::Model, ServiceError> {
        let lot_id = line.lot_id.ok_or_else(|| {
            ServiceError::InternalError(format!("line {} has no lot", line.line_number))
        })?;

        match decision {
            QcDecision::Pass {
                accepted_quantity,
                storage_location_id,
                notes,
            } => {
                let accepted = accepted_quantity.unwrap_or(line.received_quantity);
                if accepted <= Decimal::ZERO || accepted > line.received_quantity {
                    return Err(ServiceError::InvalidQuantity(format!(
                        "accepted quantity {} must be positive and at most the received {}",
                        accepted, line.received_quantity
                    )));
                }
                let lot = LotRegistry::pass_qc_in(uow, lot_id, notes.clone(), now).await?;
                let storage = Self::storage_location_in(
                    uow,
                    grn,
                    storage_location_id.or(line.storage_location_id),
                )
                .await?;

                let moved =
                    StockLedger::transfer_row(uow, quarantined, storage.id, accepted, ctx, now).await?;
                let rejected = line.received_quantity - accepted;
                if rejected > Decimal::ZERO {
                    let rejection = ctx.clone().with_notes(format!(
                        "{} QC rejection of {}",
                        grn.grn_number, lot.lot_number
                    ));
                    StockLedger::adjust_row(
                        uow,
                        moved.source,
                        -rejected,
                        AdjustmentReason::QcRejection,
                        &rejection,
                        now,
                    )
                    .await?;
                    warn!(lot_number = %lot.lot_number, rejected = %rejected, "Partial QC rejection written off");
                }

                line.accepted_quantity = Some(accepted);
                line.rejected_quantity = rejected;
                line.storage_location_id = Some(storage.id);
                line.qc_status = QcStatus::Passed;
                line.qc_notes = notes.clone();
                Ok(lot)
            }
            QcDecision::Fail { reason } => {
                let lot = LotRegistry::fail_qc_in(uow, lot_id, reason.clone(), now).await?;
                line.accepted_quantity = Some(Decimal::ZERO);
                line.rejected_quantity = line.received_quantity;
                line.qc_status = QcStatus::Failed;
                line.qc_notes = Some(reason.clone());
                Ok(lot)
            }
        }
    }

    /// The requested bin if it is a usable storage location in the receipt's
    /// warehouse, otherwise the warehouse's default storage location.
    async fn storage_location_in(
        uow: &mut dyn UnitOfWork,
        grn: &grn::Model,
        requested: Option<Uuid>,
    ) -> Result<crate::entities::location::Model, ServiceError> {
        let Some(location_id) = requested else {
            return LocationService::default_location_in(uow, grn.warehouse_id, ZoneType::Storage).await;
        };
        let location = LocationService::load_in(uow, location_id).await?;
        if location.warehouse_id != grn.warehouse_id {
            return Err(ServiceError::ValidationError(format!(
                "location {} is not in the receiving warehouse",
                location.code
            )));
        }
        if location.zone_type == ZoneType::Quarantine {
            return Err(ServiceError::ValidationError(format!(
                "location {} is a quarantine location",
                location.code
            )));
        }
        Ok(location)
    }

    async fn quarantine_row_in(
        uow: &mut dyn UnitOfWork,
        lot_id: Uuid,
    ) -> Result<stock::Model, ServiceError> {
        for position in uow.list_stock(&StockQuery::for_lot(lot_id)).await? {
            if position.stock.quantity <= Decimal::ZERO {
                continue;
            }
            let location = LocationService::load_in(uow, position.stock.location_id).await?;
            if location.zone_type == ZoneType::Quarantine {
                return Ok(position.stock);
            }
        }
        Err(ServiceError::NotFound(format!(
            "No quarantined stock for lot {}",
            lot_id
        )))
    }

    pub async fn get_grn(&self, grn_id: Uuid) -> Result<GrnDetails, ServiceError> {
        let mut uow = self.store.begin().await?;
        let grn = Self::load_in(uow.as_mut(), grn_id).await?;
        let lines = uow.list_grn_lines(grn_id).await?;
        uow.commit().await?;
        Ok(GrnDetails { grn, lines })
    }

    async fn load_in(uow: &mut dyn UnitOfWork, grn_id: Uuid) -> Result<grn::Model, ServiceError> {
        uow.find_grn(grn_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("GRN {} not found", grn_id)))
    }

    async fn insert_line(
        uow: &mut dyn UnitOfWork,
        grn: &grn::Model,
        line_number: i32,
        input: GrnLineInput,
        now: DateTime<Utc>,
    ) -> Result<grn_line_item::Model, ServiceError> {
        uow.insert_grn_line(grn_line_item::Model {
            id: Uuid::new_v4(),
            grn_id: grn.id,
            line_number,
            po_line_item_id: input.po_line_item_id,
            material_id: input.material_id,
            expected_quantity: input.expected_quantity,
            received_quantity: input.received_quantity,
            accepted_quantity: None,
            rejected_quantity: Decimal::ZERO,
            unit_of_measure: input.unit_of_measure,
            supplier_lot_number: input.supplier_lot_number,
            manufactured_date: input.manufactured_date,
            expiry_date: input.expiry_date,
            storage_location_id: input.storage_location_id,
            lot_id: None,
            qc_status: QcStatus::Pending,
            qc_notes: None,
            created_at: now,
        })
        .await
    }

    async fn announce(&self, completion: &GrnCompletion, events: Vec<Event>) {
        counter!("lot_ledger_grns_completed_total", 1);
        info!(
            grn_number = %completion.grn.grn_number,
            lots = completion.lots.len(),
            "GRN completed"
        );
        for event in events {
            self.events.publish(event).await;
        }
    }
}

fn validate_line(line: &GrnLineInput, grn_date: NaiveDate) -> Result<(), ServiceError> {
    line.validate()?;
    ensure_positive(line.received_quantity)?;
    if matches!(line.expected_quantity, Some(expected) if expected.is_sign_negative()) {
        return Err(ServiceError::InvalidQuantity(
            "expected quantity must not be negative".to_string(),
        ));
    }
    if line.expiry_date <= grn_date {
        return Err(ServiceError::InvalidExpiry(format!(
            "expiry {} must be after receipt date {}",
            line.expiry_date, grn_date
        )));
    }
    if matches!(line.manufactured_date, Some(made) if made > line.expiry_date) {
        return Err(ServiceError::InvalidExpiry(format!(
            "manufactured date is after expiry {}",
            line.expiry_date
        )));
    }
    Ok(())
}
