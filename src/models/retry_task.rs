use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

/// Why a reassignment was scheduled; carried into the cancellation reason when
/// attempts run out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReassignmentTrigger {
    NoDrivers,
    Rejection,
    Timeout,
    Disconnect,
}

/// Durable record of a scheduled reassignment attempt. Consumed by the retry
/// sweep rather than an in-process timer so retries survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTask {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub retry_count: u32,
    pub trigger: ReassignmentTrigger,
    pub status: RetryTaskStatus,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RetryTask {
    pub fn schedule(
        booking_id: Uuid,
        retry_count: u32,
        trigger: ReassignmentTrigger,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            retry_count,
            trigger,
            status: RetryTaskStatus::Pending,
            scheduled_for,
            created_at: Utc::now(),
        }
    }
}
