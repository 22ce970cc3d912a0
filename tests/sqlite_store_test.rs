mod common;

use std::sync::Arc;

use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{days_from_start, Harness};
use lot_ledger::db::{self, DbConfig};
use lot_ledger::entities::{IssueType, ReferenceType, ReservationType};
use lot_ledger::services::issuing::{IssueStockCommand, ShortagePolicy};
use lot_ledger::services::reservations::CreateReservationCommand;
use lot_ledger::{EngineSettings, SeaOrmStore};

// Ignored by default: exercises the SeaORM store against in-memory SQLite.
// Run with: cargo test --test sqlite_store_test -- --ignored
#[tokio::test]
#[ignore]
async fn receive_reserve_issue_against_sqlite() {
    let pool = db::establish_connection_with_config(&DbConfig::sqlite_memory())
        .await
        .expect("sqlite connect");
    db::run_migrations(&pool).await.expect("migrations");
    db::check_connection(&pool).await.expect("health check");

    let store = Arc::new(SeaOrmStore::new(Arc::new(pool)));
    let h = Harness::with_store(store, EngineSettings::default()).await;
    let material = Uuid::new_v4();
    let early = h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;
    h.stocked_lot(material, days_from_start(90), dec!(10), &h.bin_b).await;

    let found = h
        .services
        .lots
        .find_by_number(&early.lot_number)
        .await
        .expect("lot by number");
    assert_eq!(found.id, early.id);

    let reservation = h
        .services
        .reservations
        .create_reservation(CreateReservationCommand {
            material_id: material,
            quantity: dec!(12),
            reservation_type: ReservationType::SalesOrder,
            reference_id: Uuid::new_v4(),
            reference_number: None,
            warehouse_id: Some(h.warehouse_id),
            expires_at: None,
            created_by: h.operator,
        })
        .await
        .expect("reserve");
    assert_eq!(reservation.allocations[0].lot_id, Some(early.id));

    let issued = h
        .services
        .issuing
        .issue_stock(IssueStockCommand {
            material_id: material,
            quantity: dec!(8),
            issue_type: IssueType::Sales,
            reference_type: ReferenceType::SalesOrder,
            reference_id: None,
            warehouse_id: None,
            shortage_policy: ShortagePolicy::AllOrNothing,
            issued_by: h.operator,
        })
        .await
        .expect("issue");
    assert_eq!(issued.issued_quantity(), dec!(8));

    let availability = h
        .services
        .stock
        .check_availability(material, dec!(1), None)
        .await
        .expect("availability");
    assert_eq!(availability.total_qty, dec!(12));
    assert_eq!(availability.reserved_qty, dec!(12));
    assert_eq!(availability.available_qty, dec!(0));

    let history = h
        .services
        .movements
        .movements_for_material(material, 100)
        .await
        .expect("movements");
    assert!(history.len() >= 6);
}
