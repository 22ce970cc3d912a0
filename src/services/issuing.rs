//! Goods issue: consumes stock in FEFO order, or consumes exactly what a
//! reservation pinned, and records a goods issue document per call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::entities::{
    goods_issue, goods_issue_line, stock_reservation, GoodsIssueStatus, IssueType, ReferenceType,
    ReservationType,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender, IssuedLot};
use crate::fefo;
use crate::store::{LedgerStore, StockQuery, UnitOfWork};

use super::lots::LotRegistry;
use super::movements::MovementContext;
use super::reservations::ReservationService;
use super::stock_ledger::{ensure_positive, StockLedger};
use super::{next_document_number, year_period, EngineSettings};

/// What to do when eligible supply does not cover a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortagePolicy {
    /// Fail the whole issue and change nothing.
    #[default]
    AllOrNothing,
    /// Issue what is eligible and report the rest as shortage.
    AllowPartial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLineRequest {
    pub material_id: Uuid,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CreateGoodsIssueCommand {
    pub issue_type: IssueType,
    pub reference_type: ReferenceType,
    pub reference_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub lines: Vec<IssueLineRequest>,
    #[serde(default)]
    pub shortage_policy: ShortagePolicy,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
    pub issued_by: Uuid,
}

/// Single-material issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueStockCommand {
    pub material_id: Uuid,
    pub quantity: Decimal,
    pub issue_type: IssueType,
    pub reference_type: ReferenceType,
    pub reference_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    #[serde(default)]
    pub shortage_policy: ShortagePolicy,
    pub issued_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineShortage {
    pub material_id: Uuid,
    pub requested: Decimal,
    pub issued: Decimal,
    pub shortage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsIssueDetails {
    pub goods_issue: goods_issue::Model,
    pub lines: Vec<goods_issue_line::Model>,
    pub lots_issued: Vec<IssuedLot>,
    pub shortages: Vec<LineShortage>,
}

impl GoodsIssueDetails {
    pub fn issued_quantity(&self) -> Decimal {
        self.lines.iter().map(|l| l.issued_quantity).sum()
    }

    pub fn shortage_quantity(&self) -> Decimal {
        self.shortages.iter().map(|s| s.shortage).sum()
    }
}

/// Per-material issue totals, published after commit.
struct MaterialIssue {
    material_id: Uuid,
    quantity: Decimal,
    lots: Vec<IssuedLot>,
}

pub struct GoodsIssueService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
    settings: EngineSettings,
}

impl GoodsIssueService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        events: EventSender,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            settings,
        }
    }

    /// Issues one material in FEFO order.
    #[instrument(skip(self, command), fields(material_id = %command.material_id, quantity = %command.quantity))]
    pub async fn issue_stock(&self, command: IssueStockCommand) -> Result<GoodsIssueDetails, ServiceError> {
        self.create_goods_issue(CreateGoodsIssueCommand {
            issue_type: command.issue_type,
            reference_type: command.reference_type,
            reference_id: command.reference_id,
            warehouse_id: command.warehouse_id,
            lines: vec![IssueLineRequest {
                material_id: command.material_id,
                quantity: command.quantity,
            }],
            shortage_policy: command.shortage_policy,
            notes: None,
            issued_by: command.issued_by,
        })
        .await
    }

    /// Issues every line of a document in one unit of work.
    #[instrument(skip(self, command), fields(lines = command.lines.len()))]
    pub async fn create_goods_issue(
        &self,
        command: CreateGoodsIssueCommand,
    ) -> Result<GoodsIssueDetails, ServiceError> {
        command.validate()?;
        for line in &command.lines {
            ensure_positive(line.quantity)?;
        }

        let first_material = command
            .lines
            .first()
            .map(|l| l.material_id)
            .unwrap_or_default();
        let command = &command;
        let (details, issued) = self
            .settings
            .retry_policy()
            .run(
                "issue",
                |_| self.try_issue(command),
                |attempts| ServiceError::ReservationConflict {
                    material_id: first_material,
                    attempts,
                },
            )
            .await?;

        self.announce(&details, issued).await;
        Ok(details)
    }

    async fn try_issue(
        &self,
        command: &CreateGoodsIssueCommand,
    ) -> Result<(GoodsIssueDetails, Vec<MaterialIssue>), ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let header = Self::insert_header(
            uow.as_mut(),
            command.issue_type,
            command.reference_type,
            command.reference_id,
            command.warehouse_id,
            command.notes.clone(),
            command.issued_by,
            now,
        )
        .await?;
        let ctx = MovementContext::new(command.issued_by, ReferenceType::GoodsIssue, Some(header.id))
            .with_notes(header.issue_number.clone());

        let mut lines = Vec::new();
        let mut lots_issued = Vec::new();
        let mut shortages = Vec::new();
        let mut issued = Vec::new();

        for request in &command.lines {
            let positions = uow
                .list_stock(
                    &StockQuery::for_material(request.material_id)
                        .in_warehouse(command.warehouse_id)
                        .locked(),
                )
                .await?;
            let plan = fefo::plan(&positions, request.quantity, now);
            if !plan.is_complete() && command.shortage_policy == ShortagePolicy::AllOrNothing {
                return Err(ServiceError::insufficient(
                    request.material_id,
                    request.quantity,
                    plan.allocated(),
                ));
            }

            let mut material_lots = Vec::with_capacity(plan.allocations.len());
            for allocation in &plan.allocations {
                let row = positions
                    .iter()
                    .find(|p| p.stock.id == allocation.stock_id)
                    .map(|p| p.stock.clone())
                    .ok_or(ServiceError::ConcurrentModification(allocation.stock_id))?;
                let row = match StockLedger::issue_row(uow.as_mut(), row, allocation.quantity, &ctx, now).await {
                    Ok(row) => row,
                    Err(ServiceError::InsufficientStock { .. }) => {
                        return Err(ServiceError::ConcurrentModification(allocation.stock_id))
                    }
                    Err(e) => return Err(e),
                };

                let line = Self::insert_line(
                    uow.as_mut(),
                    &header,
                    lines.len() as i32 + 1,
                    &row,
                    allocation.quantity,
                    now,
                )
                .await?;
                lines.push(line);
                material_lots.push(IssuedLot {
                    lot_id: Some(allocation.lot_id),
                    lot_number: Some(allocation.lot_number.clone()),
                    location_id: allocation.location_id,
                    quantity: allocation.quantity,
                });
            }

            if !plan.is_complete() {
                warn!(
                    material_id = %request.material_id,
                    requested = %request.quantity,
                    shortage = %plan.remaining_unfulfilled,
                    "Partial issue"
                );
                shortages.push(LineShortage {
                    material_id: request.material_id,
                    requested: request.quantity,
                    issued: plan.allocated(),
                    shortage: plan.remaining_unfulfilled,
                });
            }
            lots_issued.extend(material_lots.iter().cloned());
            issued.push(MaterialIssue {
                material_id: request.material_id,
                quantity: plan.allocated(),
                lots: material_lots,
            });
        }

        if lines.is_empty() {
            if let Some(request) = command.lines.first() {
                return Err(ServiceError::insufficient(
                    request.material_id,
                    request.quantity,
                    Decimal::ZERO,
                ));
            }
        }

        uow.commit().await?;
        Ok((
            GoodsIssueDetails {
                goods_issue: header,
                lines,
                lots_issued,
                shortages,
            },
            issued,
        ))
    }

    /// Issues exactly the rows a reservation pinned and fulfills it.
    #[instrument(skip(self))]
    pub async fn issue_reservation(
        &self,
        reservation_id: Uuid,
        issue_type: IssueType,
        issued_by: Uuid,
    ) -> Result<GoodsIssueDetails, ServiceError> {
        let (details, reservation) = self
            .settings
            .retry_policy()
            .run(
                "issue_reservation",
                |_| self.try_issue_reservation(reservation_id, issue_type, issued_by),
                |_| ServiceError::ConcurrentModification(reservation_id),
            )
            .await?;

        let issued = vec![MaterialIssue {
            material_id: reservation.material_id,
            quantity: details.issued_quantity(),
            lots: details.lots_issued.clone(),
        }];
        self.announce(&details, issued).await;
        self.events
            .publish(Event::ReservationFulfilled {
                reservation_id,
                material_id: reservation.material_id,
                quantity: reservation.quantity,
            })
            .await;
        Ok(details)
    }

    async fn try_issue_reservation(
        &self,
        reservation_id: Uuid,
        issue_type: IssueType,
        issued_by: Uuid,
    ) -> Result<(GoodsIssueDetails, stock_reservation::Model), ServiceError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let reservation = ReservationService::load_in(uow.as_mut(), reservation_id).await?;
        ReservationService::ensure_active(&reservation)?;

        let pins: Vec<_> = uow
            .list_reservation_allocations(reservation_id)
            .await?
            .into_iter()
            .filter(|p| !p.consumed)
            .collect();
        if pins.is_empty() {
            return Err(ServiceError::InvalidStatus(format!(
                "reservation {} has nothing left to issue",
                reservation_id
            )));
        }

        let header = Self::insert_header(
            uow.as_mut(),
            issue_type,
            reference_type_for(reservation.reservation_type),
            Some(reservation.reference_id),
            None,
            Some(format!("reservation {}", reservation.id)),
            issued_by,
            now,
        )
        .await?;
        let ctx = MovementContext::new(issued_by, ReferenceType::GoodsIssue, Some(header.id))
            .with_notes(header.issue_number.clone());

        let mut lines = Vec::with_capacity(pins.len());
        let mut lots_issued = Vec::with_capacity(pins.len());
        for mut pin in pins {
            let lot = match pin.lot_id {
                Some(lot_id) => {
                    let lot = LotRegistry::load_in(uow.as_mut(), lot_id).await?;
                    lot.ensure_eligible(now)?;
                    Some(lot)
                }
                None => None,
            };
            let row = StockLedger::load_row_in(uow.as_mut(), pin.stock_id).await?;
            let row = StockLedger::issue_reserved_row(uow.as_mut(), row, pin.quantity, &ctx, now).await?;
            pin.consumed = true;
            uow.update_reservation_allocation(&pin).await?;

            let line = Self::insert_line(
                uow.as_mut(),
                &header,
                lines.len() as i32 + 1,
                &row,
                pin.quantity,
                now,
            )
            .await?;
            lines.push(line);
            lots_issued.push(IssuedLot {
                lot_id: pin.lot_id,
                lot_number: lot.map(|l| l.lot_number),
                location_id: pin.location_id,
                quantity: pin.quantity,
            });
        }

        let reservation = ReservationService::fulfill_in(uow.as_mut(), reservation, now).await?;
        uow.commit().await?;

        Ok((
            GoodsIssueDetails {
                goods_issue: header,
                lines,
                lots_issued,
                shortages: Vec::new(),
            },
            reservation,
        ))
    }

    pub async fn get_goods_issue(&self, goods_issue_id: Uuid) -> Result<GoodsIssueDetails, ServiceError> {
        let mut uow = self.store.begin().await?;
        let goods_issue = uow
            .find_goods_issue(goods_issue_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Goods issue {} not found", goods_issue_id)))?;
        let lines = uow.list_goods_issue_lines(goods_issue_id).await?;
        uow.commit().await?;

        let lots_issued = lines
            .iter()
            .map(|l| IssuedLot {
                lot_id: l.lot_id,
                lot_number: None,
                location_id: l.location_id,
                quantity: l.issued_quantity,
            })
            .collect();
        Ok(GoodsIssueDetails {
            goods_issue,
            lines,
            lots_issued,
            shortages: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_header(
        uow: &mut dyn UnitOfWork,
        issue_type: IssueType,
        reference_type: ReferenceType,
        reference_id: Option<Uuid>,
        warehouse_id: Option<Uuid>,
        notes: Option<String>,
        issued_by: Uuid,
        now: DateTime<Utc>,
    ) -> Result<goods_issue::Model, ServiceError> {
        let issue_number = next_document_number(uow, "GI", &year_period(now), 4).await?;
        // The document only becomes visible on commit, so it is written as completed.
        uow.insert_goods_issue(goods_issue::Model {
            id: Uuid::new_v4(),
            issue_number,
            issue_date: now.date_naive(),
            issue_type,
            reference_type,
            reference_id,
            warehouse_id,
            status: GoodsIssueStatus::Completed,
            notes,
            issued_by,
            created_at: now,
            updated_at: now,
        })
        .await
    }

    async fn insert_line(
        uow: &mut dyn UnitOfWork,
        header: &goods_issue::Model,
        line_number: i32,
        row: &crate::entities::stock::Model,
        quantity: Decimal,
        now: DateTime<Utc>,
    ) -> Result<goods_issue_line::Model, ServiceError> {
        uow.insert_goods_issue_line(goods_issue_line::Model {
            id: Uuid::new_v4(),
            goods_issue_id: header.id,
            line_number,
            material_id: row.material_id,
            stock_id: row.id,
            lot_id: row.lot_id,
            location_id: row.location_id,
            issued_quantity: quantity,
            unit_of_measure: row.unit_of_measure.clone(),
            created_at: now,
        })
        .await
    }

    async fn announce(&self, details: &GoodsIssueDetails, issued: Vec<MaterialIssue>) {
        counter!("lot_ledger_goods_issues_total", 1);
        info!(
            issue_number = %details.goods_issue.issue_number,
            quantity = %details.issued_quantity(),
            shortage = %details.shortage_quantity(),
            "Goods issued"
        );
        for material in issued.into_iter().filter(|m| !m.lots.is_empty()) {
            self.events
                .publish(Event::StockIssued {
                    goods_issue_id: details.goods_issue.id,
                    issue_number: details.goods_issue.issue_number.clone(),
                    material_id: material.material_id,
                    quantity: material.quantity,
                    reference_type: details.goods_issue.reference_type,
                    reference_id: details.goods_issue.reference_id,
                    lots: material.lots,
                })
                .await;
        }
    }
}

fn reference_type_for(reservation_type: ReservationType) -> ReferenceType {
    match reservation_type {
        ReservationType::SalesOrder => ReferenceType::SalesOrder,
        ReservationType::WorkOrder => ReferenceType::WorkOrder,
        ReservationType::Transfer => ReferenceType::Transfer,
    }
}
