use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Boundary-safe error payload for collaborators and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code (e.g. `insufficient_stock`)
    pub error: String,
    /// Human-readable description with storage detail removed
    pub message: String,
    /// RFC 3339 timestamp of when the error was rendered
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error(
        "Insufficient stock for material {material_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        material_id: Uuid,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Lot {lot_id} is not eligible: {reason}")]
    LotNotEligible { lot_id: Uuid, reason: String },

    #[error("Already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Reservation conflict for material {material_id} after {attempts} attempts")]
    ReservationConflict { material_id: Uuid, attempts: u32 },

    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    pub fn insufficient(material_id: Uuid, requested: Decimal, available: Decimal) -> Self {
        ServiceError::InsufficientStock {
            material_id,
            requested,
            available,
        }
    }

    /// Stable code for each error kind. This is the single source of truth for
    /// how errors are identified outside the engine.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::LotNotEligible { .. } => "lot_not_eligible",
            Self::AlreadyCompleted(_) => "already_completed",
            Self::ReservationConflict { .. } => "reservation_conflict",
            Self::InvalidExpiry(_) => "invalid_expiry",
            Self::NotFound(_) => "not_found",
            Self::InvalidStatus(_) => "invalid_status",
            Self::ValidationError(_) => "validation_error",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::DatabaseError(_) | Self::InternalError(_) => "internal_error",
        }
    }

    /// Whether a fresh attempt of the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }

    /// Returns the error message suitable for callers.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal error".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            _ => self.to_string(),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.error_code().to_string(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
