//! Lot Ledger
//!
//! Lot-tracked warehouse inventory: lots with expiry and QC state, a stock
//! ledger with a reserved/available split, FEFO allocation, reservations,
//! goods receipts and goods issues, all backed by an append-only movement log.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod clock;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod fefo;
pub mod migrator;
pub mod services;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use errors::ServiceError;
pub use events::{Event, EventSender};
pub use services::{EngineSettings, InventoryServices};
pub use store::{LedgerStore, MemoryStore, SeaOrmStore, UnitOfWork};
