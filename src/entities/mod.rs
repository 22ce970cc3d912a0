pub mod document_sequence;
pub mod goods_issue;
pub mod goods_issue_line;
pub mod grn;
pub mod grn_line_item;
pub mod inventory_count;
pub mod inventory_count_line;
pub mod location;
pub mod lot;
pub mod reservation_allocation;
pub mod stock;
pub mod stock_movement;
pub mod stock_reservation;

pub use goods_issue::{GoodsIssueStatus, IssueType};
pub use grn::GrnStatus;
pub use inventory_count::CountStatus;
pub use location::ZoneType;
pub use lot::{LotStatus, QcStatus};
pub use stock::StockKey;
pub use stock_movement::{AdjustmentReason, MovementType, ReferenceType};
pub use stock_reservation::{ReservationStatus, ReservationType};
