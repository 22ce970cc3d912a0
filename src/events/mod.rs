use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{AdjustmentReason, ReferenceType, ReservationType};

/// Per-line summary published when a GRN completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedLot {
    pub line_id: Uuid,
    pub po_line_item_id: Option<Uuid>,
    pub material_id: Uuid,
    pub lot_id: Uuid,
    pub lot_number: String,
    pub received_quantity: Decimal,
    /// `None` while QC is still pending
    pub accepted_quantity: Option<Decimal>,
}

/// A lot consumed by an issue, for downstream traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedLot {
    pub lot_id: Option<Uuid>,
    pub lot_number: Option<String>,
    pub location_id: Uuid,
    pub quantity: Decimal,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes after a commit. The state change already happened, so a
    /// closed channel is logged rather than surfaced to the caller.
    pub async fn publish(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "Dropping event after commit");
        }
    }
}

/// Notifications emitted after ledger changes commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    GrnCompleted {
        grn_id: Uuid,
        grn_number: String,
        po_id: Option<Uuid>,
        warehouse_id: Uuid,
        lots: Vec<ReceivedLot>,
    },
    LotQcDecided {
        lot_id: Uuid,
        lot_number: String,
        passed: bool,
        notes: Option<String>,
    },
    LotExpired {
        lot_id: Uuid,
        lot_number: String,
        material_id: Uuid,
        expiry_date: NaiveDate,
    },
    LotExpiringSoon {
        lot_id: Uuid,
        lot_number: String,
        material_id: Uuid,
        expiry_date: NaiveDate,
        days_until_expiry: i64,
    },
    StockReserved {
        reservation_id: Uuid,
        material_id: Uuid,
        quantity: Decimal,
        reservation_type: ReservationType,
        reference_id: Uuid,
    },
    ReservationReleased {
        reservation_id: Uuid,
        material_id: Uuid,
        quantity: Decimal,
        expired: bool,
    },
    ReservationFulfilled {
        reservation_id: Uuid,
        material_id: Uuid,
        quantity: Decimal,
    },
    StockIssued {
        goods_issue_id: Uuid,
        issue_number: String,
        material_id: Uuid,
        quantity: Decimal,
        reference_type: ReferenceType,
        reference_id: Option<Uuid>,
        lots: Vec<IssuedLot>,
    },
    StockAdjusted {
        stock_id: Uuid,
        material_id: Uuid,
        delta: Decimal,
        reason: AdjustmentReason,
        new_quantity: Decimal,
    },
    /// Available stock for a material fell to or below its reorder threshold.
    LowStockAlert {
        material_id: Uuid,
        available: Decimal,
        threshold: Decimal,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::GrnCompleted { .. } => "grn_completed",
            Event::LotQcDecided { .. } => "lot_qc_decided",
            Event::LotExpired { .. } => "lot_expired",
            Event::LotExpiringSoon { .. } => "lot_expiring_soon",
            Event::StockReserved { .. } => "stock_reserved",
            Event::ReservationReleased { .. } => "reservation_released",
            Event::ReservationFulfilled { .. } => "reservation_fulfilled",
            Event::StockIssued { .. } => "stock_issued",
            Event::StockAdjusted { .. } => "stock_adjusted",
            Event::LowStockAlert { .. } => "low_stock_alert",
        }
    }
}

/// Drains the event channel, logging each event. Downstream consumers
/// (purchase orders, notifications) subscribe at this point.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::GrnCompleted {
                grn_number,
                po_id,
                lots,
                ..
            } => {
                info!(
                    grn_number = %grn_number,
                    po_id = ?po_id,
                    lots = lots.len(),
                    "Goods receipt completed"
                );
            }
            Event::LotExpired {
                lot_number,
                expiry_date,
                ..
            } => {
                warn!(lot_number = %lot_number, expiry_date = %expiry_date, "Lot expired");
            }
            Event::LotExpiringSoon {
                lot_number,
                days_until_expiry,
                ..
            } => {
                warn!(
                    lot_number = %lot_number,
                    days_until_expiry,
                    "Lot approaching expiry"
                );
            }
            Event::LowStockAlert {
                material_id,
                available,
                threshold,
            } => {
                warn!(
                    material_id = %material_id,
                    available = %available,
                    threshold = %threshold,
                    "Material below reorder threshold"
                );
            }
            other => match serde_json::to_string(other) {
                Ok(payload) => {
                    info!(event = other.name(), payload = %payload, "Event received")
                }
                Err(e) => {
                    warn!(event = other.name(), error = %e, "Event payload not serializable")
                }
            },
        }
    }

    info!("Event processing loop stopped");
}
