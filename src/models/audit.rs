use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::booking::BookingStatus;

/// Who drove a transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Actor {
    Customer(Uuid),
    Driver(Uuid),
    Admin(Uuid),
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Customer(id) => write!(f, "customer:{id}"),
            Actor::Driver(id) => write!(f, "driver:{id}"),
            Actor::Admin(id) => write!(f, "admin:{id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Forward,
    Rollback,
}

/// Append-only audit entry written in the same transaction as the booking
/// mutation it records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub from_status: BookingStatus,
    pub to_status: BookingStatus,
    pub actor: Actor,
    pub kind: TransitionKind,
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}
