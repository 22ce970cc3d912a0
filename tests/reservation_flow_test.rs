mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{days_from_start, start, Harness};
use lot_ledger::entities::{IssueType, ReservationStatus, ReservationType};
use lot_ledger::services::reservations::CreateReservationCommand;
use lot_ledger::{EngineSettings, Event, ServiceError};

fn reserve(h: &Harness, material_id: Uuid, quantity: Decimal) -> CreateReservationCommand {
    CreateReservationCommand {
        material_id,
        quantity,
        reservation_type: ReservationType::SalesOrder,
        reference_id: Uuid::new_v4(),
        reference_number: Some("SO-2026-0042".into()),
        warehouse_id: Some(h.warehouse_id),
        expires_at: None,
        created_by: h.operator,
    }
}

async fn reserved_total(h: &Harness, material_id: Uuid) -> Decimal {
    h.services
        .stock
        .stock_for_material(material_id, None)
        .await
        .unwrap()
        .iter()
        .map(|p| p.stock.reserved_quantity)
        .sum()
}

#[tokio::test]
async fn reservation_pins_rows_in_fefo_order() {
    let mut h = Harness::new().await;
    let material = Uuid::new_v4();
    let later = h.stocked_lot(material, days_from_start(60), dec!(10), &h.bin_a).await;
    let sooner = h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_b).await;
    h.drain_events();

    let details = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, dec!(15)))
        .await
        .unwrap();

    assert_eq!(details.reservation.status, ReservationStatus::Active);
    assert_eq!(details.reservation.unit_of_measure, "EA");
    let pins: Vec<_> = details
        .allocations
        .iter()
        .map(|a| (a.lot_id, a.quantity))
        .collect();
    assert_eq!(pins, vec![(Some(sooner.id), dec!(10)), (Some(later.id), dec!(5))]);
    assert_eq!(details.outstanding_quantity(), dec!(15));
    assert_eq!(reserved_total(&h, material).await, dec!(15));

    let availability = h
        .services
        .stock
        .check_availability(material, dec!(5), None)
        .await
        .unwrap();
    assert_eq!(availability.available_qty, dec!(5));

    let events = h.drain_events();
    assert_matches!(
        events.as_slice(),
        [Event::StockReserved { quantity, reservation_type: ReservationType::SalesOrder, .. }]
            if *quantity == dec!(15)
    );
}

#[tokio::test]
async fn short_supply_reserves_nothing() {
    let mut h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;
    h.stocked_lot(material, days_from_start(40), dec!(10), &h.bin_b).await;
    h.drain_events();

    let err = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, dec!(25)))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::InsufficientStock { requested, available, .. }
            if requested == dec!(25) && available == dec!(20)
    );
    assert_eq!(reserved_total(&h, material).await, Decimal::ZERO);
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn rejects_bad_requests_up_front() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;

    let zero = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, Decimal::ZERO))
        .await;
    assert_matches!(zero, Err(ServiceError::InvalidQuantity(_)));

    let mut stale = reserve(&h, material, dec!(1));
    stale.expires_at = Some(start() - Duration::minutes(1));
    let stale = h.services.reservations.create_reservation(stale).await;
    assert_matches!(stale, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn release_is_idempotent() {
    let mut h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;
    let details = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, dec!(6)))
        .await
        .unwrap();
    h.drain_events();

    let released = h
        .services
        .reservations
        .release_reservation(details.reservation.id)
        .await
        .unwrap();
    assert_eq!(released.reservation.status, ReservationStatus::Released);
    assert_eq!(released.reservation.released_at, Some(start()));
    assert_eq!(reserved_total(&h, material).await, Decimal::ZERO);

    let again = h
        .services
        .reservations
        .release_reservation(details.reservation.id)
        .await
        .unwrap();
    assert_eq!(again.reservation.status, ReservationStatus::Released);
    assert_eq!(reserved_total(&h, material).await, Decimal::ZERO);

    let events = h.drain_events();
    assert_eq!(events.len(), 1, "only the first release is announced");
    assert_matches!(
        &events[0],
        Event::ReservationReleased { expired: false, quantity, .. } if *quantity == dec!(6)
    );
}

#[tokio::test]
async fn fulfilled_reservation_cannot_be_released() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;
    let details = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, dec!(4)))
        .await
        .unwrap();

    h.services
        .issuing
        .issue_reservation(details.reservation.id, IssueType::Sales, h.operator)
        .await
        .unwrap();

    let err = h
        .services
        .reservations
        .release_reservation(details.reservation.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));

    let fulfilled = h
        .services
        .reservations
        .get_reservation(details.reservation.id)
        .await
        .unwrap();
    assert_eq!(fulfilled.reservation.status, ReservationStatus::Fulfilled);
    assert_eq!(fulfilled.outstanding_quantity(), Decimal::ZERO);
}

#[tokio::test]
async fn fulfill_requires_every_pin_issued() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;
    let details = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, dec!(4)))
        .await
        .unwrap();

    let err = h
        .services
        .reservations
        .fulfill_reservation(details.reservation.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
}

#[tokio::test]
async fn default_ttl_expires_reservations_on_sweep() {
    let settings = EngineSettings {
        default_reservation_ttl: Some(Duration::hours(1)),
        ..EngineSettings::default()
    };
    let mut h = Harness::with_settings(settings).await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;

    let timed = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, dec!(3)))
        .await
        .unwrap();
    assert_eq!(timed.reservation.expires_at, Some(start() + Duration::hours(1)));

    let mut explicit = reserve(&h, material, dec!(2));
    explicit.expires_at = Some(start() + Duration::days(2));
    let lasting = h
        .services
        .reservations
        .create_reservation(explicit)
        .await
        .unwrap();
    h.drain_events();

    // Nothing is due yet
    let early = h
        .services
        .reservations
        .sweep_expired_reservations()
        .await
        .unwrap();
    assert!(early.expired.is_empty());

    h.clock.advance(Duration::hours(2));
    let report = h
        .services
        .reservations
        .sweep_expired_reservations()
        .await
        .unwrap();
    assert_eq!(report.expired, vec![timed.reservation.id]);
    assert_eq!(report.released_quantity, dec!(3));
    assert_eq!(reserved_total(&h, material).await, dec!(2));

    let expired = h
        .services
        .reservations
        .get_reservation(timed.reservation.id)
        .await
        .unwrap();
    assert_eq!(expired.reservation.status, ReservationStatus::Expired);
    let still_active = h
        .services
        .reservations
        .get_reservation(lasting.reservation.id)
        .await
        .unwrap();
    assert_eq!(still_active.reservation.status, ReservationStatus::Active);

    let events = h.drain_events();
    assert_matches!(
        events.as_slice(),
        [Event::ReservationReleased { expired: true, .. }]
    );

    // An expired reservation releases as a no-op
    let noop = h
        .services
        .reservations
        .release_reservation(timed.reservation.id)
        .await
        .unwrap();
    assert_eq!(noop.reservation.status, ReservationStatus::Expired);
    assert_eq!(reserved_total(&h, material).await, dec!(2));
}

#[tokio::test]
async fn concurrent_reservations_never_oversell() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(30), dec!(10), &h.bin_a).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let reservations = h.services.reservations.clone();
        let command = reserve(&h, material, dec!(1));
        tasks.push(tokio::spawn(async move {
            reservations.create_reservation(command).await.is_ok()
        }));
    }
    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap() {
            successes += 1;
        }
    }

    assert_eq!(successes, 10);
    assert_eq!(reserved_total(&h, material).await, dec!(10));
}

#[tokio::test]
async fn cancelling_an_order_releases_its_open_reservations() {
    let mut h = Harness::new().await;
    let (material, other) = (Uuid::new_v4(), Uuid::new_v4());
    h.stocked_lot(material, days_from_start(40), dec!(20), &h.bin_a).await;
    h.stocked_lot(other, days_from_start(40), dec!(20), &h.bin_b).await;
    let order = Uuid::new_v4();

    let for_order = |material_id, quantity| CreateReservationCommand {
        reference_id: order,
        ..reserve(&h, material_id, quantity)
    };
    let shipped = h
        .services
        .reservations
        .create_reservation(for_order(material, dec!(4)))
        .await
        .unwrap();
    let open_a = h
        .services
        .reservations
        .create_reservation(for_order(material, dec!(6)))
        .await
        .unwrap();
    let open_b = h
        .services
        .reservations
        .create_reservation(for_order(other, dec!(3)))
        .await
        .unwrap();
    let unrelated = h
        .services
        .reservations
        .create_reservation(reserve(&h, material, dec!(2)))
        .await
        .unwrap();
    h.services
        .issuing
        .issue_reservation(shipped.reservation.id, IssueType::Sales, h.operator)
        .await
        .unwrap();
    h.drain_events();

    let report = h
        .services
        .reservations
        .release_by_reference(ReservationType::SalesOrder, order)
        .await
        .unwrap();

    let mut released = report.released.clone();
    released.sort();
    let mut expected = vec![open_a.reservation.id, open_b.reservation.id];
    expected.sort();
    assert_eq!(released, expected);
    assert_eq!(report.skipped, vec![shipped.reservation.id]);
    assert_eq!(report.released_quantity, dec!(9));
    assert_eq!(reserved_total(&h, material).await, dec!(2));
    assert_eq!(reserved_total(&h, other).await, Decimal::ZERO);

    let fulfilled = h
        .services
        .reservations
        .get_reservation(shipped.reservation.id)
        .await
        .unwrap();
    assert_eq!(fulfilled.reservation.status, ReservationStatus::Fulfilled);
    let untouched = h
        .services
        .reservations
        .get_reservation(unrelated.reservation.id)
        .await
        .unwrap();
    assert_eq!(untouched.reservation.status, ReservationStatus::Active);

    let events = h.drain_events();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| matches!(e, Event::ReservationReleased { expired: false, .. })));

    // A second cancellation finds nothing left to release
    let again = h
        .services
        .reservations
        .release_by_reference(ReservationType::SalesOrder, order)
        .await
        .unwrap();
    assert!(again.released.is_empty());
    assert_eq!(again.skipped.len(), 3);
}
