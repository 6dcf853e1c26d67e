use thiserror::Error;
use uuid::Uuid;

use crate::models::assignment::AssignmentStatus;
use crate::models::booking::BookingStatus;

/// Failures raised by the storage layer. Only `Conflict` and `Unavailable`
/// are eligible for transactional retry.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("booking {0} not found")]
    BookingNotFound(Uuid),

    #[error("assignment {0} not found")]
    AssignmentNotFound(Uuid),

    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("missing required fields for {state}: {fields:?}")]
    MissingRequiredFields {
        state: BookingStatus,
        fields: Vec<&'static str>,
    },

    #[error("no drivers available")]
    NoDriversAvailable,

    #[error("driver {0} is no longer available")]
    DriverNoLongerAvailable(Uuid),

    #[error("driver {driver_id} does not own assignment {assignment_id}")]
    UnauthorizedResponse {
        assignment_id: Uuid,
        driver_id: Uuid,
    },

    #[error("assignment {assignment_id} already processed ({status:?})")]
    AlreadyProcessed {
        assignment_id: Uuid,
        status: AssignmentStatus,
    },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("bad request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable machine-readable code for API consumers, alongside the
    /// human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::BookingNotFound(_) => "BOOKING_NOT_FOUND",
            DispatchError::AssignmentNotFound(_) => "ASSIGNMENT_NOT_FOUND",
            DispatchError::DriverNotFound(_) => "DRIVER_NOT_FOUND",
            DispatchError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            DispatchError::MissingRequiredFields { .. } => "MISSING_REQUIRED_FIELDS",
            DispatchError::NoDriversAvailable => "NO_DRIVERS_AVAILABLE",
            DispatchError::DriverNoLongerAvailable(_) => "DRIVER_NO_LONGER_AVAILABLE",
            DispatchError::UnauthorizedResponse { .. } => "UNAUTHORIZED_RESPONSE",
            DispatchError::AlreadyProcessed { .. } => "ALREADY_PROCESSED",
            DispatchError::StateConflict(_) => "STATE_CONFLICT",
            DispatchError::Validation(_) => "VALIDATION_ERROR",
            DispatchError::Store(err) if err.is_transient() => "SERVICE_UNAVAILABLE",
            DispatchError::Store(_) => "STORE_ERROR",
            DispatchError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the transactional retry layer may re-run the unit of work.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Store(err) if err.is_transient())
    }
}
