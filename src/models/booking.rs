use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

/// Booking lifecycle states. The adjacency in [`BookingStatus::transitions_to`]
/// is the single source of truth for which transitions are legal; nothing else
/// in the crate is allowed to hardcode edge checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    DriverAssigned,
    /// Legacy alias of `DriverAssigned` still present in stored history.
    Accepted,
    DriverEnroute,
    DriverArrived,
    PickedUp,
    InTransit,
    Delivered,
    MoneyCollection,
    Completed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 12] = [
        BookingStatus::Pending,
        BookingStatus::DriverAssigned,
        BookingStatus::Accepted,
        BookingStatus::DriverEnroute,
        BookingStatus::DriverArrived,
        BookingStatus::PickedUp,
        BookingStatus::InTransit,
        BookingStatus::Delivered,
        BookingStatus::MoneyCollection,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::Rejected,
    ];

    /// Legal outgoing edges. Terminal states return an empty slice.
    pub fn transitions_to(self) -> &'static [BookingStatus] {
        use BookingStatus::*;

        match self {
            Pending => &[DriverAssigned, Cancelled, Rejected],
            DriverAssigned => &[DriverEnroute, Rejected, Cancelled],
            Accepted => &[DriverEnroute, Cancelled],
            DriverEnroute => &[DriverArrived, Cancelled],
            DriverArrived => &[PickedUp, Cancelled],
            PickedUp => &[InTransit, Cancelled],
            InTransit => &[Delivered, Cancelled],
            Delivered => &[MoneyCollection, Completed],
            MoneyCollection => &[Completed],
            Completed => &[],
            Cancelled => &[],
            Rejected => &[Pending, Cancelled],
        }
    }

    pub fn can_transition_to(self, target: BookingStatus) -> bool {
        self.transitions_to().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.transitions_to().is_empty()
    }

    /// States in which the booking still holds a driver's attention; used by
    /// the disconnect path to decide which bookings need reassignment.
    pub fn is_active_with_driver(self) -> bool {
        use BookingStatus::*;
        matches!(
            self,
            DriverAssigned | Accepted | DriverEnroute | DriverArrived | PickedUp | InTransit
        )
    }

    /// Fields that must be present (and non-null) on the booking document
    /// after the transition payload is merged.
    pub fn required_fields(self) -> &'static [&'static str] {
        use BookingStatus::*;

        match self {
            Pending => &[],
            DriverAssigned => &["driver_id", "assigned_at"],
            Accepted => &["driver_id", "accepted_at"],
            DriverEnroute => &["enroute_at"],
            DriverArrived => &["arrived_at"],
            PickedUp => &["picked_up_at"],
            InTransit => &["in_transit_at"],
            Delivered => &["delivered_at"],
            MoneyCollection => &["money_collected_at"],
            Completed => &["completed_at"],
            Cancelled => &["cancelled_at", "cancellation_reason"],
            Rejected => &["rejected_at"],
        }
    }

    /// Timestamp field stamped automatically when this state is entered.
    pub fn timestamp_field(self) -> Option<&'static str> {
        use BookingStatus::*;

        match self {
            Pending => None,
            DriverAssigned => Some("assigned_at"),
            Accepted => Some("accepted_at"),
            DriverEnroute => Some("enroute_at"),
            DriverArrived => Some("arrived_at"),
            PickedUp => Some("picked_up_at"),
            InTransit => Some("in_transit_at"),
            Delivered => Some("delivered_at"),
            MoneyCollection => Some("money_collected_at"),
            Completed => Some("completed_at"),
            Cancelled => Some("cancelled_at"),
            Rejected => Some("rejected_at"),
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use BookingStatus::*;

        let name = match self {
            Pending => "pending",
            DriverAssigned => "driver_assigned",
            Accepted => "accepted",
            DriverEnroute => "driver_enroute",
            DriverArrived => "driver_arrived",
            PickedUp => "picked_up",
            InTransit => "in_transit",
            Delivered => "delivered",
            MoneyCollection => "money_collection",
            Completed => "completed",
            Cancelled => "cancelled",
            Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub coordinates: GeoPoint,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDetails {
    pub weight_kg: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub status: BookingStatus,
    pub pickup: Waypoint,
    pub dropoff: Waypoint,
    pub package: PackageDetails,
    pub fare: f64,
    pub assigned_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub enroute_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub in_transit_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub money_collected_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub rejection_reason: Option<String>,
    pub last_transition_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(
        customer_id: Uuid,
        pickup: Waypoint,
        dropoff: Waypoint,
        package: PackageDetails,
        fare: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            driver_id: None,
            status: BookingStatus::Pending,
            pickup,
            dropoff,
            package,
            fare,
            assigned_at: None,
            accepted_at: None,
            enroute_at: None,
            arrived_at: None,
            picked_up_at: None,
            in_transit_at: None,
            delivered_at: None,
            money_collected_at: None,
            completed_at: None,
            cancelled_at: None,
            rejected_at: None,
            cancellation_reason: None,
            rejection_reason: None,
            last_transition_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
