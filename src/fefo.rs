//! First-Expired-First-Out allocation.
//!
//! Allocation is a pure computation over a snapshot of stock rows: it never
//! touches storage and never fails on a shortfall. A shortfall comes back as
//! `remaining_unfulfilled > 0` and the caller decides what to do with it.
//! Every read path that needs eligible stock (reservations, issues,
//! availability checks) goes through [`eligible_sorted`], so there is exactly
//! one set of eligibility rules.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{lot, stock};

/// A stock row joined with its lot (if lot-tracked).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockPosition {
    pub stock: stock::Model,
    pub lot: Option<lot::Model>,
}

impl StockPosition {
    pub fn new(stock: stock::Model, lot: Option<lot::Model>) -> Self {
        Self { stock, lot }
    }

    /// Lot present, lot eligible at `now`, and something left to allocate.
    pub fn is_allocatable(&self, now: DateTime<Utc>) -> bool {
        self.lot_is_eligible(now) && self.stock.available() > Decimal::ZERO
    }

    pub fn lot_is_eligible(&self, now: DateTime<Utc>) -> bool {
        match &self.lot {
            Some(lot) => self.stock.lot_id == Some(lot.id) && lot.is_eligible(now),
            None => false,
        }
    }
}

/// One row touched by an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub stock_id: Uuid,
    pub lot_id: Uuid,
    pub lot_number: String,
    pub location_id: Uuid,
    pub expiry_date: NaiveDate,
    pub quantity: Decimal,
    /// Row version the allocation was computed against
    pub stock_version: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationResult {
    pub allocations: Vec<Allocation>,
    pub remaining_unfulfilled: Decimal,
}

impl AllocationResult {
    pub fn is_complete(&self) -> bool {
        self.remaining_unfulfilled.is_zero()
    }

    pub fn allocated(&self) -> Decimal {
        self.allocations.iter().map(|a| a.quantity).sum()
    }
}

/// Keeps allocatable rows and orders them by expiry, then lot number, then
/// location, then row id, so identical input always yields identical output.
pub fn eligible_sorted(positions: &[StockPosition], now: DateTime<Utc>) -> Vec<&StockPosition> {
    let mut eligible: Vec<&StockPosition> = positions
        .iter()
        .filter(|p| p.is_allocatable(now))
        .collect();

    eligible.sort_by(|a, b| {
        let key = |p: &StockPosition| {
            let lot = p.lot.as_ref();
            (
                lot.map(|l| l.expiry_date),
                lot.map(|l| l.lot_number.clone()),
                p.stock.location_id,
                p.stock.id,
            )
        };
        key(a).cmp(&key(b))
    });
    eligible
}

/// Greedy walk over rows already filtered and sorted by [`eligible_sorted`].
pub fn allocate(sorted: &[&StockPosition], requested: Decimal) -> AllocationResult {
    let mut remaining = requested.max(Decimal::ZERO);
    let mut allocations = Vec::new();

    for position in sorted {
        if remaining.is_zero() {
            break;
        }
        let Some(lot) = position.lot.as_ref() else {
            continue;
        };
        let take = position.stock.available().min(remaining);
        if take <= Decimal::ZERO {
            continue;
        }
        allocations.push(Allocation {
            stock_id: position.stock.id,
            lot_id: lot.id,
            lot_number: lot.lot_number.clone(),
            location_id: position.stock.location_id,
            expiry_date: lot.expiry_date,
            quantity: take,
            stock_version: position.stock.version,
        });
        remaining -= take;
    }

    AllocationResult {
        allocations,
        remaining_unfulfilled: remaining,
    }
}

/// Filter, sort and allocate in one step.
pub fn plan(positions: &[StockPosition], requested: Decimal, now: DateTime<Utc>) -> AllocationResult {
    let sorted = eligible_sorted(positions, now);
    allocate(&sorted, requested)
}

/// Totals over rows whose lot is eligible, regardless of how much is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EligibleTotals {
    pub total: Decimal,
    pub reserved: Decimal,
    pub available: Decimal,
}

pub fn eligible_totals(positions: &[StockPosition], now: DateTime<Utc>) -> EligibleTotals {
    positions
        .iter()
        .filter(|p| p.lot_is_eligible(now))
        .fold(EligibleTotals::default(), |mut acc, p| {
            acc.total += p.stock.quantity;
            acc.reserved += p.stock.reserved_quantity;
            acc.available += p.stock.available().max(Decimal::ZERO);
            acc
        })
}
