use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::assignment::AssignmentManager;
use crate::engine::matching::MatchingEngine;
use crate::engine::state_machine::{StateMachine, payload_from};
use crate::error::DispatchError;
use crate::models::audit::Actor;
use crate::models::booking::{Booking, BookingStatus};
use crate::models::driver::DriverAvailability;
use crate::models::retry_task::{ReassignmentTrigger, RetryTask, RetryTaskStatus};
use crate::notify::Notifier;
use crate::store::retry::execute_transaction_with_retry;
use crate::store::{Filter, TransactionalStore, batch_write, collections, fetch, query_as};

const NO_DRIVERS_REASON: &str = "no drivers available";
const NO_ACCEPT_REASON: &str = "no drivers available to accept";
const DISCONNECT_REASON: &str = "driver disconnected";

/// How a failed matching/assignment round was resolved.
#[derive(Debug)]
pub enum ReassignmentDecision {
    Scheduled {
        task_id: Uuid,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
    },
}

#[derive(Debug)]
pub enum RetryOutcome {
    /// A fresh offer went out to a driver.
    Offered {
        assignment_id: Uuid,
        driver_id: Uuid,
    },
    /// Matching failed again; another task was scheduled or the booking was
    /// cancelled.
    Rescheduled(ReassignmentDecision),
    /// The booking had already moved on; the task completed as a no-op.
    Superseded,
    /// The attempt errored; the task is marked failed.
    Failed,
}

#[derive(Debug)]
pub struct ProcessedRetry {
    pub task_id: Uuid,
    pub booking_id: Uuid,
    pub outcome: RetryOutcome,
}

/// Orchestrates recovery when matching or assignment fails: bounded
/// reassignment via durable RetryTasks, driver-disconnect cleanup, and
/// eventual cancellation with a machine-readable reason.
pub struct EdgeCaseCoordinator {
    store: Arc<dyn TransactionalStore>,
    state_machine: Arc<StateMachine>,
    matching: Arc<MatchingEngine>,
    assignments: Arc<AssignmentManager>,
    notifier: Arc<dyn Notifier>,
    config: DispatchConfig,
}

impl EdgeCaseCoordinator {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        state_machine: Arc<StateMachine>,
        matching: Arc<MatchingEngine>,
        assignments: Arc<AssignmentManager>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            state_machine,
            matching,
            assignments,
            notifier,
            config,
        }
    }

    /// Matching produced an empty pool: schedule a delayed retry, or cancel
    /// the booking once the attempt budget is spent.
    pub async fn handle_no_drivers_available(
        &self,
        booking_id: Uuid,
    ) -> Result<ReassignmentDecision, DispatchError> {
        self.schedule_or_cancel(booking_id, ReassignmentTrigger::NoDrivers, NO_DRIVERS_REASON)
            .await
    }

    /// A driver declined the offer: move the booking to `rejected` and
    /// schedule reassignment (or cancel on exhaustion).
    pub async fn handle_driver_rejection(
        &self,
        booking_id: Uuid,
        driver_id: Uuid,
        reason: &str,
    ) -> Result<ReassignmentDecision, DispatchError> {
        self.reject_and_reschedule(booking_id, driver_id, reason, ReassignmentTrigger::Rejection)
            .await
    }

    /// No response within the TTL is treated exactly like a rejection,
    /// recorded with reason "timeout".
    pub async fn handle_driver_timeout(
        &self,
        booking_id: Uuid,
        driver_id: Uuid,
    ) -> Result<ReassignmentDecision, DispatchError> {
        self.reject_and_reschedule(booking_id, driver_id, "timeout", ReassignmentTrigger::Timeout)
            .await
    }

    /// A driver dropped off the network: revoke their outstanding offers,
    /// reassign every active booking they hold, and update `last_seen`.
    /// Never forces the driver offline; going offline is an explicit action.
    pub async fn handle_driver_disconnect(
        &self,
        driver_id: Uuid,
    ) -> Result<Vec<(Uuid, ReassignmentDecision)>, DispatchError> {
        self.touch_last_seen(driver_id).await?;

        let mut affected: Vec<Uuid> = Vec::new();

        // Offers still awaiting a response: the booking itself is pending and
        // carries no driver yet.
        let offered: Vec<crate::models::assignment::Assignment> = query_as(
            self.store.as_ref(),
            collections::ASSIGNMENTS,
            &[
                Filter::eq("driver_id", driver_id),
                Filter::eq(
                    "status",
                    crate::models::assignment::AssignmentStatus::Pending,
                ),
            ],
        )
        .await?;
        affected.extend(offered.iter().map(|a| a.booking_id));

        // Bookings the driver already accepted and is working.
        let held: Vec<Booking> = query_as(
            self.store.as_ref(),
            collections::BOOKINGS,
            &[Filter::eq("driver_id", driver_id)],
        )
        .await?;
        affected.extend(
            held.iter()
                .filter(|b| b.status.is_active_with_driver())
                .map(|b| b.id),
        );

        affected.sort();
        affected.dedup();

        let mut decisions = Vec::new();
        for booking_id in affected {
            // One booking's recovery failing must not strand the rest.
            match self.recover_disconnected_booking(booking_id, driver_id).await {
                Ok(Some(decision)) => decisions.push((booking_id, decision)),
                Ok(None) => {}
                Err(err) => {
                    error!(
                        booking_id = %booking_id,
                        driver_id = %driver_id,
                        error = %err,
                        "disconnect recovery failed for booking"
                    );
                }
            }
        }

        info!(
            driver_id = %driver_id,
            bookings = decisions.len(),
            "driver disconnect handled"
        );
        Ok(decisions)
    }

    /// Recovery for one booking the disconnected driver was involved with.
    /// Pre-acceptance bookings go back to the pool; mid-trip bookings have no
    /// rejected edge and no viable hand-off once the package is with the
    /// driver, so they are cancelled.
    async fn recover_disconnected_booking(
        &self,
        booking_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Option<ReassignmentDecision>, DispatchError> {
        self.assignments
            .revoke_pending_offer(booking_id, driver_id, DISCONNECT_REASON)
            .await?;

        let booking: Booking = fetch(
            self.store.as_ref(),
            collections::BOOKINGS,
            &booking_id.to_string(),
        )
        .await?
        .ok_or(DispatchError::BookingNotFound(booking_id))?;

        match booking.status {
            BookingStatus::Pending | BookingStatus::DriverAssigned | BookingStatus::Rejected => {
                self.reject_and_reschedule(
                    booking_id,
                    driver_id,
                    DISCONNECT_REASON,
                    ReassignmentTrigger::Disconnect,
                )
                .await
                .map(Some)
            }
            status if status.is_active_with_driver() => {
                self.cancel_booking(booking_id, DISCONNECT_REASON).await?;
                Ok(Some(ReassignmentDecision::Cancelled {
                    reason: DISCONNECT_REASON.to_string(),
                }))
            }
            // Settled or past the driver's part; nothing to recover.
            _ => Ok(None),
        }
    }

    /// Consume due RetryTasks. Each task re-validates the booking's current
    /// state at execution time, so a task whose booking moved on completes as
    /// a no-op instead of erroring.
    pub async fn process_due_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessedRetry>, DispatchError> {
        let tasks: Vec<RetryTask> = query_as(
            self.store.as_ref(),
            collections::RETRY_TASKS,
            &[Filter::eq("status", RetryTaskStatus::Pending)],
        )
        .await?;

        let mut processed = Vec::new();
        for task in tasks {
            if task.scheduled_for > now {
                continue;
            }
            if !self.claim_task(task.id).await? {
                continue;
            }

            let outcome = match self.run_reassignment(&task).await {
                Ok(outcome) => {
                    self.mark_task(task.id, RetryTaskStatus::Completed).await?;
                    outcome
                }
                Err(err) => {
                    error!(
                        task_id = %task.id,
                        booking_id = %task.booking_id,
                        error = %err,
                        "reassignment attempt failed"
                    );
                    self.mark_task(task.id, RetryTaskStatus::Failed).await?;
                    RetryOutcome::Failed
                }
            };

            processed.push(ProcessedRetry {
                task_id: task.id,
                booking_id: task.booking_id,
                outcome,
            });
        }

        Ok(processed)
    }

    /// Mark pending tasks whose schedule has long passed as expired so lost
    /// work is visible instead of looking forever-pending.
    pub async fn cleanup_expired_tasks(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u32, DispatchError> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|err| DispatchError::Internal(format!("invalid stale window: {err}")))?;
        let tasks: Vec<RetryTask> = query_as(
            self.store.as_ref(),
            collections::RETRY_TASKS,
            &[Filter::eq("status", RetryTaskStatus::Pending)],
        )
        .await?;

        let mut expired = 0u32;
        for task in tasks {
            if task.scheduled_for + stale_after >= now {
                continue;
            }
            warn!(
                task_id = %task.id,
                booking_id = %task.booking_id,
                scheduled_for = %task.scheduled_for,
                "retry task was never processed; expiring"
            );
            self.mark_task(task.id, RetryTaskStatus::Expired).await?;
            expired += 1;
        }

        Ok(expired)
    }

    async fn run_reassignment(&self, task: &RetryTask) -> Result<RetryOutcome, DispatchError> {
        let booking: Booking = fetch(
            self.store.as_ref(),
            collections::BOOKINGS,
            &task.booking_id.to_string(),
        )
        .await?
        .ok_or(DispatchError::BookingNotFound(task.booking_id))?;

        match booking.status {
            BookingStatus::Pending | BookingStatus::Rejected => {}
            _ => {
                info!(
                    booking_id = %booking.id,
                    status = %booking.status,
                    "booking moved on; retry task is a no-op"
                );
                return Ok(RetryOutcome::Superseded);
            }
        }

        // Close out any offer left dangling from the previous round before
        // matching again.
        self.assignments
            .handle_expired_assignments(task.booking_id)
            .await?;

        if booking.status == BookingStatus::Rejected {
            self.state_machine
                .transition_booking(task.booking_id, BookingStatus::Pending, Map::new(), Actor::System)
                .await?;
        }

        let candidates = match self
            .matching
            .find_ranked_drivers(
                &booking.pickup.coordinates,
                None,
                Some(booking.package.weight_kg),
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(DispatchError::NoDriversAvailable) => {
                let decision = self.handle_no_drivers_available(task.booking_id).await?;
                return Ok(RetryOutcome::Rescheduled(decision));
            }
            Err(err) => return Err(err),
        };

        for candidate in &candidates {
            match self
                .assignments
                .attempt_driver_assignment(task.booking_id, candidate)
                .await
            {
                Ok(assignment) => {
                    return Ok(RetryOutcome::Offered {
                        assignment_id: assignment.id,
                        driver_id: assignment.driver_id,
                    });
                }
                Err(DispatchError::DriverNoLongerAvailable(driver_id)) => {
                    info!(%driver_id, "candidate vanished between matching and offer; trying next");
                }
                Err(err) => return Err(err),
            }
        }

        let decision = self.handle_no_drivers_available(task.booking_id).await?;
        Ok(RetryOutcome::Rescheduled(decision))
    }

    async fn reject_and_reschedule(
        &self,
        booking_id: Uuid,
        driver_id: Uuid,
        reason: &str,
        trigger: ReassignmentTrigger,
    ) -> Result<ReassignmentDecision, DispatchError> {
        let booking: Booking = fetch(
            self.store.as_ref(),
            collections::BOOKINGS,
            &booking_id.to_string(),
        )
        .await?
        .ok_or(DispatchError::BookingNotFound(booking_id))?;

        match booking.status {
            BookingStatus::Pending | BookingStatus::DriverAssigned => {
                // The `rejected` side effect releases the driver binding in
                // the same commit.
                self.state_machine
                    .transition_booking(
                        booking_id,
                        BookingStatus::Rejected,
                        payload_from(json!({ "rejection_reason": reason })),
                        Actor::Driver(driver_id),
                    )
                    .await?;
            }
            // Duplicate signal for a booking already back in the queue.
            BookingStatus::Rejected => {}
            BookingStatus::Cancelled => {
                return Ok(ReassignmentDecision::Cancelled {
                    reason: booking
                        .cancellation_reason
                        .unwrap_or_else(|| "cancelled".to_string()),
                });
            }
            other => {
                return Err(DispatchError::StateConflict(format!(
                    "booking {booking_id} is {other}; rejection does not apply"
                )));
            }
        }

        self.schedule_or_cancel(booking_id, trigger, NO_ACCEPT_REASON)
            .await
    }

    async fn schedule_or_cancel(
        &self,
        booking_id: Uuid,
        trigger: ReassignmentTrigger,
        exhausted_reason: &str,
    ) -> Result<ReassignmentDecision, DispatchError> {
        let attempts = self.reassignment_attempts(booking_id).await?;

        if attempts >= self.config.max_reassignment_attempts {
            let reason = exhausted_reason.to_string();
            self.cancel_booking(booking_id, &reason).await?;
            return Ok(ReassignmentDecision::Cancelled { reason });
        }

        let attempt = attempts + 1;
        let scheduled_for = Utc::now()
            + chrono::Duration::from_std(self.config.reassignment_delay)
                .map_err(|err| DispatchError::Internal(format!("invalid delay: {err}")))?;
        let task = RetryTask::schedule(booking_id, attempt, trigger, scheduled_for);

        batch_write(
            self.store.as_ref(),
            vec![crate::store::WriteOp::Set {
                collection: collections::RETRY_TASKS,
                id: task.id.to_string(),
                data: serde_json::to_value(&task).map_err(crate::error::StoreError::from)?,
            }],
        )
        .await?;

        info!(
            booking_id = %booking_id,
            attempt,
            scheduled_for = %scheduled_for,
            ?trigger,
            "reassignment scheduled"
        );

        Ok(ReassignmentDecision::Scheduled {
            task_id: task.id,
            attempt,
            scheduled_for,
        })
    }

    async fn cancel_booking(&self, booking_id: Uuid, reason: &str) -> Result<(), DispatchError> {
        let booking: Option<Booking> = fetch(
            self.store.as_ref(),
            collections::BOOKINGS,
            &booking_id.to_string(),
        )
        .await?;
        if booking.is_some_and(|b| b.status.is_terminal()) {
            return Ok(());
        }

        self.state_machine
            .transition_booking(
                booking_id,
                BookingStatus::Cancelled,
                payload_from(json!({ "cancellation_reason": reason })),
                Actor::System,
            )
            .await?;

        warn!(booking_id = %booking_id, reason, "booking cancelled by dispatch recovery");

        let notifier = self.notifier.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            notifier
                .notify_customer(booking_id, "booking_cancelled", json!({ "reason": reason }))
                .await;
        });

        Ok(())
    }

    async fn reassignment_attempts(&self, booking_id: Uuid) -> Result<u32, DispatchError> {
        let tasks: Vec<RetryTask> = query_as(
            self.store.as_ref(),
            collections::RETRY_TASKS,
            &[Filter::eq("booking_id", booking_id)],
        )
        .await?;
        Ok(tasks.iter().map(|t| t.retry_count).max().unwrap_or(0))
    }

    /// Atomically flip a task from pending to processing; false when another
    /// sweep got there first.
    async fn claim_task(&self, task_id: Uuid) -> Result<bool, DispatchError> {
        execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let key = task_id.to_string();
                    let Some(mut task) = tx.get::<RetryTask>(collections::RETRY_TASKS, &key).await?
                    else {
                        return Ok((tx, false));
                    };
                    if task.status != RetryTaskStatus::Pending {
                        return Ok((tx, false));
                    }
                    task.status = RetryTaskStatus::Processing;
                    tx.set(collections::RETRY_TASKS, &key, &task)?;
                    Ok((tx, true))
                })
            },
        )
        .await
    }

    async fn mark_task(
        &self,
        task_id: Uuid,
        status: RetryTaskStatus,
    ) -> Result<(), DispatchError> {
        execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let key = task_id.to_string();
                    if let Some(mut task) =
                        tx.get::<RetryTask>(collections::RETRY_TASKS, &key).await?
                    {
                        task.status = status;
                        tx.set(collections::RETRY_TASKS, &key, &task)?;
                    }
                    Ok((tx, ()))
                })
            },
        )
        .await
    }

    async fn touch_last_seen(&self, driver_id: Uuid) -> Result<(), DispatchError> {
        execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let key = driver_id.to_string();
                    if let Some(mut availability) = tx
                        .get::<DriverAvailability>(collections::DRIVER_AVAILABILITY, &key)
                        .await?
                    {
                        // Deliberately leaves is_online alone; a disconnect is
                        // not a sign-off.
                        availability.last_seen = Utc::now();
                        tx.set(collections::DRIVER_AVAILABILITY, &key, &availability)?;
                    }
                    Ok((tx, ()))
                })
            },
        )
        .await
    }
}
