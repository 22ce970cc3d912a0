#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use lot_ledger::entities::{location, lot, ZoneType};
use lot_ledger::services::locations::RegisterLocationCommand;
use lot_ledger::services::receiving::{CreateGrnCommand, GrnLineInput, QcDecision};
use lot_ledger::{
    Event, EngineSettings, EventSender, FixedClock, InventoryServices, LedgerStore, MemoryStore,
};

/// 2026-10-17 09:00 UTC, the instant every harness starts at.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap()
}

pub fn days_from_start(days: i64) -> NaiveDate {
    start().date_naive() + Duration::days(days)
}

/// One warehouse with a quarantine bin and two storage bins, wired to a
/// settable clock and a captured event channel.
pub struct Harness {
    pub services: InventoryServices,
    pub clock: Arc<FixedClock>,
    pub warehouse_id: Uuid,
    pub quarantine: location::Model,
    pub bin_a: location::Model,
    pub bin_b: location::Model,
    pub operator: Uuid,
    events: mpsc::Receiver<Event>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(EngineSettings::default()).await
    }

    pub async fn with_settings(settings: EngineSettings) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), settings).await
    }

    pub async fn with_store(store: Arc<dyn LedgerStore>, settings: EngineSettings) -> Self {
        let clock = Arc::new(FixedClock::new(start()));
        let (tx, rx) = mpsc::channel(1024);
        let services = InventoryServices::new(store, clock.clone(), EventSender::new(tx), settings);

        let warehouse_id = Uuid::new_v4();
        let zone_id = Uuid::new_v4();
        let register = |code: &str, zone_type: ZoneType| RegisterLocationCommand {
            warehouse_id,
            zone_id,
            code: code.to_string(),
            zone_type,
        };
        let quarantine = services
            .locations
            .register_location(register("QA-01", ZoneType::Quarantine))
            .await
            .expect("quarantine bin");
        let bin_a = services
            .locations
            .register_location(register("ST-01", ZoneType::Storage))
            .await
            .expect("storage bin A");
        let bin_b = services
            .locations
            .register_location(register("ST-02", ZoneType::Storage))
            .await
            .expect("storage bin B");

        Self {
            services,
            clock,
            warehouse_id,
            quarantine,
            bin_a,
            bin_b,
            operator: Uuid::new_v4(),
            events: rx,
        }
    }

    pub fn grn_command(&self, lines: Vec<GrnLineInput>) -> CreateGrnCommand {
        CreateGrnCommand {
            warehouse_id: self.warehouse_id,
            grn_date: None,
            po_id: None,
            po_number: Some("PO-1001".into()),
            supplier_id: Some(Uuid::new_v4()),
            delivery_note_number: None,
            notes: None,
            received_by: self.operator,
            lines,
        }
    }

    /// Receives `quantity` of `material` as a new lot, passes QC and stores it in `bin`.
    pub async fn stocked_lot(
        &self,
        material_id: Uuid,
        expiry_date: NaiveDate,
        quantity: Decimal,
        bin: &location::Model,
    ) -> lot::Model {
        let completion = self
            .services
            .receiving
            .receive_stock(
                self.grn_command(vec![line(material_id, quantity, expiry_date)]),
                Some(QcDecision::Pass {
                    accepted_quantity: None,
                    storage_location_id: Some(bin.id),
                    notes: None,
                }),
            )
            .await
            .expect("receipt");
        completion.lots.into_iter().next().expect("one lot per line")
    }

    /// Everything published since the last call.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn line(material_id: Uuid, quantity: Decimal, expiry_date: NaiveDate) -> GrnLineInput {
    GrnLineInput {
        material_id,
        po_line_item_id: None,
        expected_quantity: Some(quantity),
        received_quantity: quantity,
        unit_of_measure: "EA".into(),
        supplier_lot_number: None,
        manufactured_date: None,
        expiry_date,
        storage_location_id: None,
    }
}
