use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::VehicleType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl AssignmentStatus {
    pub fn is_terminal(self) -> bool {
        self != AssignmentStatus::Pending
    }
}

/// Driver details frozen at offer time, shown to the customer while the offer
/// is outstanding even if the profile changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSnapshot {
    pub name: String,
    pub phone: String,
    pub rating: f64,
    pub vehicle_type: VehicleType,
    pub distance_km: f64,
    pub eta_minutes: f64,
}

/// A time-bounded offer of one booking to one driver. At most one non-terminal
/// assignment exists per booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub driver_id: Uuid,
    pub status: AssignmentStatus,
    pub driver_snapshot: DriverSnapshot,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}
