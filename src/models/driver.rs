use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Bicycle,
    TwoWheeler,
    Car,
    Van,
    Truck,
}

impl VehicleType {
    /// Average city speed used for ETA estimation.
    pub fn speed_kmh(self) -> f64 {
        match self {
            VehicleType::Bicycle => 15.0,
            VehicleType::TwoWheeler => 25.0,
            VehicleType::Car => 35.0,
            VehicleType::Van => 30.0,
            VehicleType::Truck => 25.0,
        }
    }
}

/// Daily working window; `days` lists the weekdays the driver takes jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingHours {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        use chrono::{Datelike, Timelike};

        if !self.days.contains(&at.weekday()) {
            return false;
        }

        let time = NaiveTime::from_hms_opt(at.hour(), at.minute(), at.second())
            .unwrap_or(NaiveTime::MIN);

        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            // Overnight window, e.g. 20:00-04:00.
            time >= self.start || time <= self.end
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverStats {
    pub total_trips: u32,
    pub completed_trips: u32,
    pub cancelled_trips: u32,
    pub avg_response_secs: f64,
}

impl DriverStats {
    pub fn completion_rate(&self) -> f64 {
        if self.total_trips == 0 {
            return 1.0;
        }
        self.completed_trips as f64 / self.total_trips as f64
    }

    pub fn cancellation_rate(&self) -> f64 {
        if self.total_trips == 0 {
            return 0.0;
        }
        self.cancelled_trips as f64 / self.total_trips as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverProfile {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub rating: f64,
    pub vehicle_type: VehicleType,
    pub capacity_kg: f64,
    pub is_verified: bool,
    pub is_active: bool,
    pub working_hours: WorkingHours,
    pub stats: DriverStats,
}

/// Live availability record, mutated by the assignment manager on offer and
/// response and by state-machine side effects on terminal transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverAvailability {
    pub driver_id: Uuid,
    pub is_online: bool,
    pub is_available: bool,
    pub current_location: GeoPoint,
    pub current_booking_id: Option<Uuid>,
    pub last_seen: DateTime<Utc>,
}

impl DriverAvailability {
    pub fn online_at(driver_id: Uuid, location: GeoPoint) -> Self {
        Self {
            driver_id,
            is_online: true,
            is_available: true,
            current_location: location,
            current_booking_id: None,
            last_seen: Utc::now(),
        }
    }

    /// Bind the driver to a booking. Keeps the availability invariant:
    /// a bound driver is never available.
    pub fn bind(&mut self, booking_id: Uuid) {
        self.current_booking_id = Some(booking_id);
        self.is_available = false;
    }

    pub fn release(&mut self) {
        self.current_booking_id = None;
        self.is_available = true;
    }
}
