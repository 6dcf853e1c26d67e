use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::matching::DriverCandidate;
use crate::engine::state_machine::{StateMachine, TransitionOutcome, payload_from};
use crate::error::DispatchError;
use crate::models::assignment::{Assignment, AssignmentStatus, DriverSnapshot};
use crate::models::audit::Actor;
use crate::models::booking::{Booking, BookingStatus};
use crate::models::driver::DriverAvailability;
use crate::notify::Notifier;
use crate::store::retry::execute_transaction_with_retry;
use crate::store::{Filter, TransactionalStore, Tx, collections, query_as};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverResponse {
    Accepted,
    Rejected,
}

/// What a processed driver response resolved to. A rejection is handed to the
/// edge-case coordinator by the caller; the manager itself never reschedules.
#[derive(Debug)]
pub enum DriverResponseOutcome {
    Accepted(TransitionOutcome),
    Rejected {
        booking_id: Uuid,
        driver_id: Uuid,
        reason: String,
    },
}

/// Resolution of a multi-driver acceptance race.
#[derive(Debug)]
pub struct ConcurrentAcceptance {
    pub winner: Uuid,
    pub losers: Vec<Uuid>,
    pub outcome: TransitionOutcome,
}

/// A pending offer the expiry sweep closed out.
#[derive(Debug, Clone, Copy)]
pub struct ExpiredOffer {
    pub assignment_id: Uuid,
    pub booking_id: Uuid,
    pub driver_id: Uuid,
}

/// Creates time-bounded offers, processes driver responses, and resolves
/// concurrent acceptances. Every mutation runs through the transactional
/// retry layer; competing offers serialize on the booking document.
pub struct AssignmentManager {
    store: Arc<dyn TransactionalStore>,
    notifier: Arc<dyn Notifier>,
    config: DispatchConfig,
}

impl AssignmentManager {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Offer the booking to `candidate`. Re-checks the driver's availability
    /// inside the transaction, enforces the one-live-offer invariant, binds
    /// the driver, and emits the offer notification after commit.
    pub async fn attempt_driver_assignment(
        &self,
        booking_id: Uuid,
        candidate: &DriverCandidate,
    ) -> Result<Assignment, DispatchError> {
        let ttl = chrono::Duration::from_std(self.config.assignment_ttl)
            .map_err(|err| DispatchError::Internal(format!("invalid assignment ttl: {err}")))?;

        let assignment = execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let booking_key = booking_id.to_string();
                    let mut booking_doc: Value = tx
                        .get(collections::BOOKINGS, &booking_key)
                        .await?
                        .ok_or(DispatchError::BookingNotFound(booking_id))?;
                    let booking: Booking = serde_json::from_value(booking_doc.clone())
                        .map_err(|err| {
                            DispatchError::Internal(format!("malformed booking: {err}"))
                        })?;

                    if booking.status != BookingStatus::Pending {
                        return Err(DispatchError::StateConflict(format!(
                            "booking {booking_id} is {}, not awaiting assignment",
                            booking.status
                        )));
                    }

                    let live: Vec<Assignment> = query_as(
                        self.store.as_ref(),
                        collections::ASSIGNMENTS,
                        &[
                            Filter::eq("booking_id", booking_id),
                            Filter::eq("status", AssignmentStatus::Pending),
                        ],
                    )
                    .await?;
                    if !live.is_empty() {
                        return Err(DispatchError::StateConflict(format!(
                            "booking {booking_id} already has a live offer"
                        )));
                    }

                    let availability_key = candidate.driver_id.to_string();
                    let mut availability: DriverAvailability = tx
                        .get(collections::DRIVER_AVAILABILITY, &availability_key)
                        .await?
                        .ok_or(DispatchError::DriverNotFound(candidate.driver_id))?;
                    if !availability.is_online
                        || !availability.is_available
                        || availability.current_booking_id.is_some()
                    {
                        return Err(DispatchError::DriverNoLongerAvailable(candidate.driver_id));
                    }

                    availability.bind(booking_id);
                    tx.set(
                        collections::DRIVER_AVAILABILITY,
                        &availability_key,
                        &availability,
                    )?;

                    let now = Utc::now();
                    let assignment = Assignment {
                        id: Uuid::new_v4(),
                        booking_id,
                        driver_id: candidate.driver_id,
                        status: AssignmentStatus::Pending,
                        driver_snapshot: DriverSnapshot {
                            name: candidate.profile.name.clone(),
                            phone: candidate.profile.phone.clone(),
                            rating: candidate.profile.rating,
                            vehicle_type: candidate.profile.vehicle_type,
                            distance_km: candidate.distance_km,
                            eta_minutes: candidate.eta_minutes,
                        },
                        assigned_at: now,
                        expires_at: now + ttl,
                        responded_at: None,
                        rejection_reason: None,
                    };
                    tx.set(
                        collections::ASSIGNMENTS,
                        &assignment.id.to_string(),
                        &assignment,
                    )?;

                    // Touch the booking so concurrent offer attempts conflict
                    // at commit instead of both succeeding.
                    booking_doc["updated_at"] =
                        serde_json::to_value(now).map_err(crate::error::StoreError::from)?;
                    tx.set(collections::BOOKINGS, &booking_key, &booking_doc)?;

                    Ok((tx, assignment))
                })
            },
        )
        .await?;

        info!(
            booking_id = %booking_id,
            driver_id = %assignment.driver_id,
            assignment_id = %assignment.id,
            expires_at = %assignment.expires_at,
            "assignment offered"
        );

        let notifier = self.notifier.clone();
        let offer = assignment.clone();
        tokio::spawn(async move {
            notifier
                .notify_driver(
                    offer.driver_id,
                    "assignment_offer",
                    json!({
                        "assignment_id": offer.id,
                        "booking_id": offer.booking_id,
                        "expires_at": offer.expires_at,
                    }),
                )
                .await;
        });

        Ok(assignment)
    }

    /// Process a driver's accept/reject for an outstanding offer. Ownership
    /// and pending-ness are validated inside the transaction; acceptance
    /// transitions the booking in the same commit.
    pub async fn handle_driver_response(
        &self,
        assignment_id: Uuid,
        driver_id: Uuid,
        response: DriverResponse,
        reason: Option<String>,
    ) -> Result<DriverResponseOutcome, DispatchError> {
        let reason = &reason;
        let outcome = execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let key = assignment_id.to_string();
                    let mut assignment: Assignment = tx
                        .get(collections::ASSIGNMENTS, &key)
                        .await?
                        .ok_or(DispatchError::AssignmentNotFound(assignment_id))?;

                    if assignment.driver_id != driver_id {
                        return Err(DispatchError::UnauthorizedResponse {
                            assignment_id,
                            driver_id,
                        });
                    }
                    if assignment.status.is_terminal() {
                        return Err(DispatchError::AlreadyProcessed {
                            assignment_id,
                            status: assignment.status,
                        });
                    }

                    assignment.responded_at = Some(Utc::now());

                    match response {
                        DriverResponse::Accepted => {
                            assignment.status = AssignmentStatus::Accepted;
                            tx.set(collections::ASSIGNMENTS, &key, &assignment)?;

                            // The availability binding made at offer time stays
                            // in place; it is only released on terminal booking
                            // states.
                            let outcome = StateMachine::apply_transition(
                                &mut tx,
                                assignment.booking_id,
                                BookingStatus::DriverAssigned,
                                &payload_from(json!({ "driver_id": driver_id })),
                                Actor::Driver(driver_id),
                            )
                            .await?;

                            Ok((tx, DriverResponseOutcome::Accepted(outcome)))
                        }
                        DriverResponse::Rejected => {
                            let reason = reason
                                .clone()
                                .unwrap_or_else(|| "rejected by driver".to_string());
                            assignment.status = AssignmentStatus::Rejected;
                            assignment.rejection_reason = Some(reason.clone());
                            tx.set(collections::ASSIGNMENTS, &key, &assignment)?;

                            Self::release_if_bound(&mut tx, driver_id, assignment.booking_id)
                                .await?;

                            Ok((
                                tx,
                                DriverResponseOutcome::Rejected {
                                    booking_id: assignment.booking_id,
                                    driver_id,
                                    reason,
                                },
                            ))
                        }
                    }
                })
            },
        )
        .await?;

        match &outcome {
            DriverResponseOutcome::Accepted(transition) => {
                info!(
                    booking_id = %transition.booking_id,
                    driver_id = %driver_id,
                    "driver accepted assignment"
                );
                let notifier = self.notifier.clone();
                let booking_id = transition.booking_id;
                tokio::spawn(async move {
                    notifier
                        .notify_customer(
                            booking_id,
                            "driver_assigned",
                            json!({ "driver_id": driver_id }),
                        )
                        .await;
                });
            }
            DriverResponseOutcome::Rejected {
                booking_id, reason, ..
            } => {
                info!(
                    booking_id = %booking_id,
                    driver_id = %driver_id,
                    reason,
                    "driver rejected assignment"
                );
            }
        }

        Ok(outcome)
    }

    /// Canonical resolver for N drivers accepting the same booking: one
    /// transaction re-reads the booking, the first driver in `driver_ids`
    /// wins, everyone else's offer is rejected and their binding freed.
    pub async fn handle_concurrent_acceptance(
        &self,
        booking_id: Uuid,
        driver_ids: &[Uuid],
    ) -> Result<ConcurrentAcceptance, DispatchError> {
        let winner = *driver_ids.first().ok_or_else(|| {
            DispatchError::Validation("no drivers supplied for acceptance resolution".to_string())
        })?;

        let outcome = execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let booking: Booking = tx
                        .get(collections::BOOKINGS, &booking_id.to_string())
                        .await?
                        .ok_or(DispatchError::BookingNotFound(booking_id))?;
                    if booking.status != BookingStatus::Pending {
                        return Err(DispatchError::StateConflict(format!(
                            "booking {booking_id} is {}, not awaiting assignment",
                            booking.status
                        )));
                    }

                    let pending: Vec<Assignment> = query_as(
                        self.store.as_ref(),
                        collections::ASSIGNMENTS,
                        &[
                            Filter::eq("booking_id", booking_id),
                            Filter::eq("status", AssignmentStatus::Pending),
                        ],
                    )
                    .await?;

                    let now = Utc::now();
                    for listed in &pending {
                        // Re-read through the transaction so the commit is
                        // stamped against the version we acted on.
                        let key = listed.id.to_string();
                        let Some(mut assignment) =
                            tx.get::<Assignment>(collections::ASSIGNMENTS, &key).await?
                        else {
                            continue;
                        };
                        if assignment.status.is_terminal() {
                            continue;
                        }

                        assignment.responded_at = Some(now);
                        if assignment.driver_id == winner {
                            assignment.status = AssignmentStatus::Accepted;
                        } else {
                            assignment.status = AssignmentStatus::Rejected;
                            assignment.rejection_reason =
                                Some("another driver accepted first".to_string());
                            Self::release_if_bound(&mut tx, assignment.driver_id, booking_id)
                                .await?;
                        }
                        tx.set(collections::ASSIGNMENTS, &key, &assignment)?;
                    }

                    let transition = StateMachine::apply_transition(
                        &mut tx,
                        booking_id,
                        BookingStatus::DriverAssigned,
                        &payload_from(json!({ "driver_id": winner })),
                        Actor::Driver(winner),
                    )
                    .await?;

                    Ok((tx, transition))
                })
            },
        )
        .await?;

        let losers: Vec<Uuid> = driver_ids
            .iter()
            .copied()
            .filter(|id| *id != winner)
            .collect();

        info!(
            booking_id = %booking_id,
            winner = %winner,
            losers = losers.len(),
            "concurrent acceptance resolved"
        );

        for loser in losers.clone() {
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                notifier
                    .notify_driver(
                        loser,
                        "assignment_lost",
                        json!({ "booking_id": booking_id }),
                    )
                    .await;
            });
        }

        Ok(ConcurrentAcceptance {
            winner,
            losers,
            outcome,
        })
    }

    /// Expire overdue pending offers for one booking, freeing the bound
    /// driver. Cleanup only: if the booking has already moved on, the offer
    /// is closed out without touching the booking.
    pub async fn handle_expired_assignments(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<ExpiredOffer>, DispatchError> {
        let pending: Vec<Assignment> = query_as(
            self.store.as_ref(),
            collections::ASSIGNMENTS,
            &[
                Filter::eq("booking_id", booking_id),
                Filter::eq("status", AssignmentStatus::Pending),
            ],
        )
        .await?;

        self.expire_overdue(pending).await
    }

    /// Crate-wide expiry pass over every pending offer.
    pub async fn sweep_expired_assignments(&self) -> Result<Vec<ExpiredOffer>, DispatchError> {
        let pending: Vec<Assignment> = query_as(
            self.store.as_ref(),
            collections::ASSIGNMENTS,
            &[Filter::eq("status", AssignmentStatus::Pending)],
        )
        .await?;

        self.expire_overdue(pending).await
    }

    async fn expire_overdue(
        &self,
        pending: Vec<Assignment>,
    ) -> Result<Vec<ExpiredOffer>, DispatchError> {
        let mut expired = Vec::new();

        for assignment in pending {
            if assignment.expires_at > Utc::now() {
                continue;
            }

            let assignment_id = assignment.id;
            let closed = execute_transaction_with_retry(
                self.store.clone(),
                &self.config.retry_policy,
                |mut tx| {
                    Box::pin(async move {
                        let key = assignment_id.to_string();
                        let Some(mut current) =
                            tx.get::<Assignment>(collections::ASSIGNMENTS, &key).await?
                        else {
                            return Ok((tx, None));
                        };
                        // Re-validate at execution time: a response that won
                        // the race makes this a no-op.
                        if current.status.is_terminal() || current.expires_at > Utc::now() {
                            return Ok((tx, None));
                        }

                        current.status = AssignmentStatus::Expired;
                        tx.set(collections::ASSIGNMENTS, &key, &current)?;

                        Self::release_if_bound(&mut tx, current.driver_id, current.booking_id)
                            .await?;

                        Ok((
                            tx,
                            Some(ExpiredOffer {
                                assignment_id: current.id,
                                booking_id: current.booking_id,
                                driver_id: current.driver_id,
                            }),
                        ))
                    })
                },
            )
            .await?;

            if let Some(offer) = closed {
                warn!(
                    assignment_id = %offer.assignment_id,
                    booking_id = %offer.booking_id,
                    driver_id = %offer.driver_id,
                    "assignment expired without response"
                );
                expired.push(offer);
            }
        }

        Ok(expired)
    }

    /// Revoke a driver's pending offer for a booking without waiting for the
    /// TTL. Used by the disconnect path.
    pub(crate) async fn revoke_pending_offer(
        &self,
        booking_id: Uuid,
        driver_id: Uuid,
        reason: &str,
    ) -> Result<(), DispatchError> {
        let pending: Vec<Assignment> = query_as(
            self.store.as_ref(),
            collections::ASSIGNMENTS,
            &[
                Filter::eq("booking_id", booking_id),
                Filter::eq("driver_id", driver_id),
                Filter::eq("status", AssignmentStatus::Pending),
            ],
        )
        .await?;

        for assignment in pending {
            let assignment_id = assignment.id;
            let reason = &reason;
            execute_transaction_with_retry(
                self.store.clone(),
                &self.config.retry_policy,
                |mut tx| {
                    Box::pin(async move {
                        let key = assignment_id.to_string();
                        let Some(mut current) =
                            tx.get::<Assignment>(collections::ASSIGNMENTS, &key).await?
                        else {
                            return Ok((tx, ()));
                        };
                        if current.status.is_terminal() {
                            return Ok((tx, ()));
                        }

                        current.status = AssignmentStatus::Rejected;
                        current.rejection_reason = Some(reason.to_string());
                        current.responded_at = Some(Utc::now());
                        tx.set(collections::ASSIGNMENTS, &key, &current)?;

                        Self::release_if_bound(&mut tx, driver_id, booking_id).await?;
                        Ok((tx, ()))
                    })
                },
            )
            .await?;
        }

        Ok(())
    }

    async fn release_if_bound(
        tx: &mut Tx,
        driver_id: Uuid,
        booking_id: Uuid,
    ) -> Result<(), DispatchError> {
        let key = driver_id.to_string();
        if let Some(mut availability) = tx
            .get::<DriverAvailability>(collections::DRIVER_AVAILABILITY, &key)
            .await?
        {
            if availability.current_booking_id == Some(booking_id) {
                availability.release();
                tx.set(collections::DRIVER_AVAILABILITY, &key, &availability)?;
            }
        }
        Ok(())
    }
}
