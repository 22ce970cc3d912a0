mod common;

use chrono::Duration;
use rstest::rstest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{days_from_start, line, Harness};
use lot_ledger::entities::{MovementType, ReferenceType};
use lot_ledger::services::MovementContext;

#[tokio::test]
async fn plan_walks_lots_in_expiry_order() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    let late = h.stocked_lot(material, days_from_start(90), dec!(10), &h.bin_a).await;
    let early = h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_b).await;
    let middle = h.stocked_lot(material, days_from_start(60), dec!(10), &h.bin_a).await;

    let plan = h
        .services
        .stock
        .plan_allocation(material, dec!(25), None)
        .await
        .unwrap();

    let order: Vec<_> = plan.allocations.iter().map(|a| (a.lot_id, a.quantity)).collect();
    assert_eq!(
        order,
        vec![(early.id, dec!(10)), (middle.id, dec!(10)), (late.id, dec!(5))]
    );
    assert!(plan.is_complete());
}

#[rstest]
#[case::inside_first_lot(dec!(5), vec![dec!(5)], dec!(0))]
#[case::exactly_first_lot(dec!(10), vec![dec!(10)], dec!(0))]
#[case::spills_into_second(dec!(15), vec![dec!(10), dec!(5)], dec!(0))]
#[case::short(dec!(30), vec![dec!(10), dec!(10)], dec!(10))]
#[case::fractional(dec!(10.25), vec![dec!(10), dec!(0.25)], dec!(0))]
#[tokio::test]
async fn plan_splits_demand_across_lots(
    #[case] requested: Decimal,
    #[case] expected: Vec<Decimal>,
    #[case] unfulfilled: Decimal,
) {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(20), dec!(10), &h.bin_a).await;
    h.stocked_lot(material, days_from_start(40), dec!(10), &h.bin_a).await;

    let plan = h
        .services
        .stock
        .plan_allocation(material, requested, None)
        .await
        .unwrap();

    let taken: Vec<_> = plan.allocations.iter().map(|a| a.quantity).collect();
    assert_eq!(taken, expected);
    assert_eq!(plan.remaining_unfulfilled, unfulfilled);
}

#[tokio::test]
async fn equal_expiry_breaks_ties_by_lot_number() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    let expiry = days_from_start(45);
    let first = h.stocked_lot(material, expiry, dec!(4), &h.bin_b).await;
    let second = h.stocked_lot(material, expiry, dec!(4), &h.bin_a).await;
    assert!(first.lot_number < second.lot_number);

    let plan = h
        .services
        .stock
        .plan_allocation(material, dec!(6), None)
        .await
        .unwrap();

    assert_eq!(plan.allocations[0].lot_id, first.id);
    assert_eq!(plan.allocations[0].quantity, dec!(4));
    assert_eq!(plan.allocations[1].lot_id, second.id);
    assert_eq!(plan.allocations[1].quantity, dec!(2));
}

#[tokio::test]
async fn shortfall_is_reported_not_raised() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(30), &h.bin_a).await;

    let plan = h
        .services
        .stock
        .plan_allocation(material, dec!(100), None)
        .await
        .unwrap();

    assert!(!plan.is_complete());
    assert_eq!(plan.allocated(), dec!(30));
    assert_eq!(plan.remaining_unfulfilled, dec!(70));
}

#[tokio::test]
async fn expired_lots_drop_out_on_their_expiry_date() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    let short_lived = h.stocked_lot(material, days_from_start(5), dec!(10), &h.bin_a).await;
    let long_lived = h.stocked_lot(material, days_from_start(40), dec!(10), &h.bin_b).await;

    h.clock.advance(Duration::days(4));
    let before = h
        .services
        .stock
        .plan_allocation(material, dec!(5), None)
        .await
        .unwrap();
    assert_eq!(before.allocations[0].lot_id, short_lived.id);

    // The expiry date itself is already ineligible
    h.clock.advance(Duration::days(1));
    let after = h
        .services
        .stock
        .plan_allocation(material, dec!(5), None)
        .await
        .unwrap();
    assert_eq!(after.allocations.len(), 1);
    assert_eq!(after.allocations[0].lot_id, long_lived.id);

    let availability = h
        .services
        .stock
        .check_availability(material, dec!(15), None)
        .await
        .unwrap();
    assert_eq!(availability.total_qty, dec!(10));
    assert_eq!(availability.available_qty, dec!(10));
    assert!(!availability.is_available);
    assert_eq!(availability.shortage_qty, dec!(5));
}

#[tokio::test]
async fn pending_and_blocked_lots_are_not_allocated() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();

    // QC pending: stays in quarantine
    h.services
        .receiving
        .receive_stock(h.grn_command(vec![line(material, dec!(50), days_from_start(20))]), None)
        .await
        .unwrap();
    let blocked = h.stocked_lot(material, days_from_start(25), dec!(50), &h.bin_a).await;
    h.services
        .lots
        .block_lot(blocked.id, "customer complaint".into())
        .await
        .unwrap();
    let usable = h.stocked_lot(material, days_from_start(90), dec!(8), &h.bin_b).await;

    let plan = h
        .services
        .stock
        .plan_allocation(material, dec!(20), None)
        .await
        .unwrap();
    assert_eq!(plan.allocations.len(), 1);
    assert_eq!(plan.allocations[0].lot_id, usable.id);
    assert_eq!(plan.remaining_unfulfilled, dec!(12));

    let availability = h
        .services
        .stock
        .check_availability(material, dec!(8), None)
        .await
        .unwrap();
    assert_eq!(availability.total_qty, dec!(8));
    assert!(availability.is_available);
}

#[tokio::test]
async fn reserved_quantity_is_not_offered_again() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    let lot = h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;
    let row = h.services.stock.stock_for_lot(lot.id).await.unwrap();
    let stored = row
        .iter()
        .find(|p| p.stock.location_id == h.bin_a.id)
        .unwrap()
        .stock
        .clone();

    h.services.stock.reserve(stored.id, dec!(7)).await.unwrap();

    let plan = h
        .services
        .stock
        .plan_allocation(material, dec!(5), None)
        .await
        .unwrap();
    assert_eq!(plan.allocated(), dec!(3));

    let availability = h
        .services
        .stock
        .check_availability(material, dec!(3), None)
        .await
        .unwrap();
    assert_eq!(availability.total_qty, dec!(10));
    assert_eq!(availability.reserved_qty, dec!(7));
    assert_eq!(availability.available_qty, dec!(3));
    assert!(availability.is_available);
}

#[tokio::test]
async fn warehouse_filter_limits_the_plan() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;

    let elsewhere = h
        .services
        .stock
        .plan_allocation(material, dec!(5), Some(Uuid::new_v4()))
        .await
        .unwrap();
    assert!(elsewhere.allocations.is_empty());

    let here = h
        .services
        .stock
        .plan_allocation(material, dec!(5), Some(h.warehouse_id))
        .await
        .unwrap();
    assert!(here.is_complete());
}

#[tokio::test]
async fn transfers_keep_the_lot_and_log_one_movement() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    let lot = h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;
    let source = h
        .services
        .stock
        .stock_for_lot(lot.id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.stock.location_id == h.bin_a.id)
        .unwrap()
        .stock;

    let outcome = h
        .services
        .stock
        .transfer(
            source.id,
            h.bin_b.id,
            dec!(4),
            MovementContext::new(h.operator, ReferenceType::Transfer, None),
        )
        .await
        .unwrap();

    assert_eq!(outcome.source.quantity, dec!(6));
    assert_eq!(outcome.destination.quantity, dec!(4));
    assert_eq!(outcome.destination.lot_id, Some(lot.id));
    assert_eq!(outcome.movement.movement_type, MovementType::Transfer);
    assert!(outcome.movement.movement_number.starts_with("MOV-TRF-2026-"));

    let history = h
        .services
        .movements
        .movements_for_lot(lot.id, 50)
        .await
        .unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|m| m.movement_type == MovementType::Transfer)
            .count(),
        2,
        "receipt transfer out of quarantine plus the bin move"
    );
}
