mod common;

use assert_matches::assert_matches;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{days_from_start, Harness};
use lot_ledger::entities::{
    GoodsIssueStatus, IssueType, MovementType, ReferenceType, ReservationStatus, ReservationType,
};
use lot_ledger::services::issuing::{
    CreateGoodsIssueCommand, IssueLineRequest, IssueStockCommand, ShortagePolicy,
};
use lot_ledger::services::reservations::CreateReservationCommand;
use lot_ledger::{Event, ServiceError};

fn issue(h: &Harness, material_id: Uuid, quantity: Decimal, policy: ShortagePolicy) -> IssueStockCommand {
    IssueStockCommand {
        material_id,
        quantity,
        issue_type: IssueType::Production,
        reference_type: ReferenceType::WorkOrder,
        reference_id: Some(Uuid::new_v4()),
        warehouse_id: Some(h.warehouse_id),
        shortage_policy: policy,
        issued_by: h.operator,
    }
}

async fn on_hand(h: &Harness, material_id: Uuid) -> Decimal {
    h.services
        .stock
        .stock_for_material(material_id, None)
        .await
        .unwrap()
        .iter()
        .map(|p| p.stock.quantity)
        .sum()
}

#[tokio::test]
async fn issue_consumes_the_earliest_expiry_first() {
    let mut h = Harness::new().await;
    let material = Uuid::new_v4();
    let later = h.stocked_lot(material, days_from_start(200), dec!(10), &h.bin_a).await;
    let sooner = h.stocked_lot(material, days_from_start(50), dec!(10), &h.bin_b).await;
    h.drain_events();

    let details = h
        .services
        .issuing
        .issue_stock(issue(&h, material, dec!(14), ShortagePolicy::AllOrNothing))
        .await
        .unwrap();

    assert_eq!(details.goods_issue.issue_number, "GI-2026-0001");
    assert_eq!(details.goods_issue.status, GoodsIssueStatus::Completed);
    assert_eq!(details.issued_quantity(), dec!(14));
    assert!(details.shortages.is_empty());
    let consumed: Vec<_> = details.lines.iter().map(|l| (l.lot_id, l.issued_quantity)).collect();
    assert_eq!(
        consumed,
        vec![(Some(sooner.id), dec!(10)), (Some(later.id), dec!(4))]
    );
    assert_eq!(on_hand(&h, material).await, dec!(6));

    let outs: Vec<_> = h
        .services
        .movements
        .movements_for_material(material, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.movement_type == MovementType::Out)
        .collect();
    assert_eq!(outs.len(), 2);
    assert!(outs.iter().all(|m| m.reference_type == ReferenceType::GoodsIssue
        && m.reference_id == Some(details.goods_issue.id)));

    assert_matches!(
        h.drain_events().as_slice(),
        [Event::StockIssued { lots, quantity, .. }] if lots.len() == 2 && *quantity == dec!(14)
    );
}

#[tokio::test]
async fn all_or_nothing_changes_nothing_on_shortage() {
    let mut h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(50), dec!(10), &h.bin_a).await;
    h.stocked_lot(material, days_from_start(60), dec!(10), &h.bin_b).await;
    h.drain_events();

    let err = h
        .services
        .issuing
        .issue_stock(issue(&h, material, dec!(25), ShortagePolicy::AllOrNothing))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock { requested, available, .. }
            if requested == dec!(25) && available == dec!(20)
    );
    assert_eq!(on_hand(&h, material).await, dec!(20));
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn allow_partial_issues_what_is_there_and_reports_the_rest() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(50), dec!(10), &h.bin_a).await;
    h.stocked_lot(material, days_from_start(60), dec!(10), &h.bin_b).await;

    let details = h
        .services
        .issuing
        .issue_stock(issue(&h, material, dec!(25), ShortagePolicy::AllowPartial))
        .await
        .unwrap();

    assert_eq!(details.issued_quantity(), dec!(20));
    assert_eq!(details.shortage_quantity(), dec!(5));
    assert_eq!(details.shortages[0].requested, dec!(25));
    assert_eq!(on_hand(&h, material).await, Decimal::ZERO);

    let nothing_left = h
        .services
        .issuing
        .issue_stock(issue(&h, material, dec!(1), ShortagePolicy::AllowPartial))
        .await;
    assert_matches!(nothing_left, Err(ServiceError::InsufficientStock { .. }));
}

#[tokio::test]
async fn issues_leave_reserved_stock_alone() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(50), dec!(10), &h.bin_a).await;
    h.services
        .reservations
        .create_reservation(CreateReservationCommand {
            material_id: material,
            quantity: dec!(7),
            reservation_type: ReservationType::WorkOrder,
            reference_id: Uuid::new_v4(),
            reference_number: None,
            warehouse_id: None,
            expires_at: None,
            created_by: h.operator,
        })
        .await
        .unwrap();

    let err = h
        .services
        .issuing
        .issue_stock(issue(&h, material, dec!(5), ShortagePolicy::AllOrNothing))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock { available, .. } if available == dec!(3));

    let details = h
        .services
        .issuing
        .issue_stock(issue(&h, material, dec!(3), ShortagePolicy::AllOrNothing))
        .await
        .unwrap();
    assert_eq!(details.issued_quantity(), dec!(3));
    assert_eq!(on_hand(&h, material).await, dec!(7));
}

#[tokio::test]
async fn issuing_a_reservation_consumes_its_pins_and_fulfills_it() {
    let mut h = Harness::new().await;
    let material = Uuid::new_v4();
    h.stocked_lot(material, days_from_start(50), dec!(10), &h.bin_a).await;
    h.stocked_lot(material, days_from_start(80), dec!(10), &h.bin_b).await;
    let reservation = h
        .services
        .reservations
        .create_reservation(CreateReservationCommand {
            material_id: material,
            quantity: dec!(12),
            reservation_type: ReservationType::SalesOrder,
            reference_id: Uuid::new_v4(),
            reference_number: Some("SO-7".into()),
            warehouse_id: Some(h.warehouse_id),
            expires_at: None,
            created_by: h.operator,
        })
        .await
        .unwrap();
    h.drain_events();

    let details = h
        .services
        .issuing
        .issue_reservation(reservation.reservation.id, IssueType::Sales, h.operator)
        .await
        .unwrap();

    assert_eq!(details.issued_quantity(), dec!(12));
    assert_eq!(details.goods_issue.reference_type, ReferenceType::SalesOrder);
    assert_eq!(
        details.goods_issue.reference_id,
        Some(reservation.reservation.reference_id)
    );
    let stock = h
        .services
        .stock
        .stock_for_material(material, None)
        .await
        .unwrap();
    let quantity: Decimal = stock.iter().map(|p| p.stock.quantity).sum();
    let reserved: Decimal = stock.iter().map(|p| p.stock.reserved_quantity).sum();
    assert_eq!(quantity, dec!(8));
    assert_eq!(reserved, Decimal::ZERO);

    let fulfilled = h
        .services
        .reservations
        .get_reservation(reservation.reservation.id)
        .await
        .unwrap();
    assert_eq!(fulfilled.reservation.status, ReservationStatus::Fulfilled);
    assert!(fulfilled.allocations.iter().all(|a| a.consumed));

    let events = h.drain_events();
    assert_matches!(
        events.as_slice(),
        [Event::StockIssued { .. }, Event::ReservationFulfilled { .. }]
    );

    let again = h
        .services
        .issuing
        .issue_reservation(reservation.reservation.id, IssueType::Sales, h.operator)
        .await;
    assert_matches!(again, Err(ServiceError::AlreadyCompleted(_)));
}

#[tokio::test]
async fn blocked_pinned_lot_stops_the_reservation_issue() {
    let h = Harness::new().await;
    let material = Uuid::new_v4();
    let lot = h.stocked_lot(material, days_from_start(50), dec!(10), &h.bin_a).await;
    let reservation = h
        .services
        .reservations
        .create_reservation(CreateReservationCommand {
            material_id: material,
            quantity: dec!(4),
            reservation_type: ReservationType::Transfer,
            reference_id: Uuid::new_v4(),
            reference_number: None,
            warehouse_id: None,
            expires_at: None,
            created_by: h.operator,
        })
        .await
        .unwrap();
    h.services
        .lots
        .block_lot(lot.id, "recall".into())
        .await
        .unwrap();

    let err = h
        .services
        .issuing
        .issue_reservation(reservation.reservation.id, IssueType::Sample, h.operator)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::LotNotEligible { lot_id, .. } if lot_id == lot.id);
    assert_eq!(on_hand(&h, material).await, dec!(10));

    let still_active = h
        .services
        .reservations
        .get_reservation(reservation.reservation.id)
        .await
        .unwrap();
    assert_eq!(still_active.reservation.status, ReservationStatus::Active);
}

#[tokio::test]
async fn multi_line_documents_round_trip_through_lookup() {
    let h = Harness::new().await;
    let (resin, hardener) = (Uuid::new_v4(), Uuid::new_v4());
    h.stocked_lot(resin, days_from_start(100), dec!(50), &h.bin_a).await;
    h.stocked_lot(hardener, days_from_start(100), dec!(20), &h.bin_b).await;

    let details = h
        .services
        .issuing
        .create_goods_issue(CreateGoodsIssueCommand {
            issue_type: IssueType::Production,
            reference_type: ReferenceType::WorkOrder,
            reference_id: Some(Uuid::new_v4()),
            warehouse_id: Some(h.warehouse_id),
            lines: vec![
                IssueLineRequest {
                    material_id: resin,
                    quantity: dec!(30),
                },
                IssueLineRequest {
                    material_id: hardener,
                    quantity: dec!(6),
                },
            ],
            shortage_policy: ShortagePolicy::AllOrNothing,
            notes: Some("batch 7".into()),
            issued_by: h.operator,
        })
        .await
        .unwrap();

    let loaded = h
        .services
        .issuing
        .get_goods_issue(details.goods_issue.id)
        .await
        .unwrap();
    assert_eq!(loaded.goods_issue.issue_number, details.goods_issue.issue_number);
    assert_eq!(loaded.lines.len(), 2);
    assert_eq!(loaded.issued_quantity(), dec!(36));
    assert_eq!(
        loaded.lines.iter().map(|l| l.line_number).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let empty = h
        .services
        .issuing
        .create_goods_issue(CreateGoodsIssueCommand {
            issue_type: IssueType::Scrap,
            reference_type: ReferenceType::Adjustment,
            reference_id: None,
            warehouse_id: None,
            lines: Vec::new(),
            shortage_policy: ShortagePolicy::AllOrNothing,
            notes: None,
            issued_by: h.operator,
        })
        .await;
    assert_matches!(empty, Err(ServiceError::ValidationError(_)));
}
