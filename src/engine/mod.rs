pub mod assignment;
pub mod edge_cases;
pub mod matching;
pub mod state_machine;
pub mod sweeps;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::assignment::{
    AssignmentManager, ConcurrentAcceptance, DriverResponse, DriverResponseOutcome,
};
use crate::engine::edge_cases::{
    EdgeCaseCoordinator, ProcessedRetry, ReassignmentDecision, RetryOutcome,
};
use crate::engine::matching::MatchingEngine;
use crate::engine::state_machine::{StateMachine, TransitionOutcome, payload_from};
use crate::error::DispatchError;
use crate::geo::GeoPoint;
use crate::models::assignment::Assignment;
use crate::models::audit::Actor;
use crate::models::booking::{Booking, BookingStatus, PackageDetails, Waypoint};
use crate::models::driver::{DriverAvailability, DriverProfile};
use crate::models::retry_task::ReassignmentTrigger;
use crate::notify::Notifier;
use crate::observability::metrics::Metrics;
use crate::store::retry::execute_transaction_with_retry;
use crate::store::{TransactionalStore, WriteOp, batch_write, collections, fetch};

/// Broadcast to interested consumers (websockets, audit feeds). Lagging
/// receivers miss events; nothing in the engine depends on delivery.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    BookingCreated {
        booking_id: Uuid,
    },
    OfferCreated {
        booking_id: Uuid,
        driver_id: Uuid,
        assignment_id: Uuid,
    },
    BookingAssigned {
        booking_id: Uuid,
        driver_id: Uuid,
    },
    OfferExpired {
        booking_id: Uuid,
        driver_id: Uuid,
        assignment_id: Uuid,
    },
    ReassignmentScheduled {
        booking_id: Uuid,
        attempt: u32,
    },
    BookingCancelled {
        booking_id: Uuid,
        reason: String,
    },
}

/// How a dispatch round ended: an offer went out, or the failure was handed
/// to the edge-case coordinator.
#[derive(Debug)]
pub enum DispatchOutcome {
    Offered(Assignment),
    Deferred(ReassignmentDecision),
}

#[derive(Debug)]
pub enum RespondOutcome {
    Assigned(TransitionOutcome),
    Reassignment(ReassignmentDecision),
}

/// Top-level entry point: wires the state machine, matcher, assignment
/// manager, and edge-case coordinator over one injected store and notifier.
/// An API layer maps its endpoints onto these operations.
pub struct DispatchEngine {
    store: Arc<dyn TransactionalStore>,
    config: DispatchConfig,
    metrics: Metrics,
    state_machine: Arc<StateMachine>,
    matching: Arc<MatchingEngine>,
    assignments: Arc<AssignmentManager>,
    edge_cases: Arc<EdgeCaseCoordinator>,
    events_tx: broadcast::Sender<DispatchEvent>,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        let state_machine = Arc::new(StateMachine::new(
            store.clone(),
            config.retry_policy.clone(),
        ));
        let matching = Arc::new(MatchingEngine::new(store.clone(), config.clone()));
        let assignments = Arc::new(AssignmentManager::new(
            store.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let edge_cases = Arc::new(EdgeCaseCoordinator::new(
            store.clone(),
            state_machine.clone(),
            matching.clone(),
            assignments.clone(),
            notifier,
            config.clone(),
        ));

        Self {
            store,
            config,
            metrics: Metrics::new(),
            state_machine,
            matching,
            assignments,
            edge_cases,
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events_tx.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    pub fn matching(&self) -> &MatchingEngine {
        &self.matching
    }

    pub fn assignments(&self) -> &AssignmentManager {
        &self.assignments
    }

    pub fn edge_cases(&self) -> &EdgeCaseCoordinator {
        &self.edge_cases
    }

    /// Create a booking in `pending`. Dispatch is a separate call so the API
    /// layer can acknowledge creation before matching starts.
    pub async fn create_booking(
        &self,
        customer_id: Uuid,
        pickup: Waypoint,
        dropoff: Waypoint,
        package: PackageDetails,
        fare: f64,
    ) -> Result<Booking, DispatchError> {
        validate_waypoint(&pickup)?;
        validate_waypoint(&dropoff)?;
        if package.weight_kg <= 0.0 {
            return Err(DispatchError::Validation(
                "package weight must be positive".to_string(),
            ));
        }
        if fare < 0.0 {
            return Err(DispatchError::Validation(
                "fare cannot be negative".to_string(),
            ));
        }

        let booking = Booking::new(customer_id, pickup, dropoff, package, fare);
        batch_write(
            self.store.as_ref(),
            vec![WriteOp::Set {
                collection: collections::BOOKINGS,
                id: booking.id.to_string(),
                data: serde_json::to_value(&booking).map_err(crate::error::StoreError::from)?,
            }],
        )
        .await?;

        info!(booking_id = %booking.id, customer_id = %customer_id, "booking created");
        self.emit(DispatchEvent::BookingCreated {
            booking_id: booking.id,
        });
        Ok(booking)
    }

    /// One full dispatch round: expire stale offers, match, offer to the best
    /// candidate, and fall through to the coordinator when supply is missing.
    pub async fn dispatch_booking(&self, booking_id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        // Opportunistic sweep so a dangling offer never blocks a new round.
        self.assignments.handle_expired_assignments(booking_id).await?;

        let booking: Booking = fetch(
            self.store.as_ref(),
            collections::BOOKINGS,
            &booking_id.to_string(),
        )
        .await?
        .ok_or(DispatchError::BookingNotFound(booking_id))?;

        match booking.status {
            BookingStatus::Pending => {}
            BookingStatus::Rejected => {
                self.state_machine
                    .transition_booking(
                        booking_id,
                        BookingStatus::Pending,
                        Default::default(),
                        Actor::System,
                    )
                    .await?;
            }
            other => {
                return Err(DispatchError::StateConflict(format!(
                    "booking {booking_id} is {other}; cannot dispatch"
                )));
            }
        }

        let start = Instant::now();
        let candidates = match self
            .matching
            .find_ranked_drivers(
                &booking.pickup.coordinates,
                None,
                Some(booking.package.weight_kg),
            )
            .await
        {
            Ok(candidates) => {
                self.metrics
                    .matching_latency_seconds
                    .with_label_values(&["success"])
                    .observe(start.elapsed().as_secs_f64());
                candidates
            }
            Err(DispatchError::NoDriversAvailable) => {
                self.metrics
                    .matching_latency_seconds
                    .with_label_values(&["empty"])
                    .observe(start.elapsed().as_secs_f64());
                return self.defer(booking_id, ReassignmentTrigger::NoDrivers).await;
            }
            Err(err) => {
                self.metrics
                    .matching_latency_seconds
                    .with_label_values(&["error"])
                    .observe(start.elapsed().as_secs_f64());
                return Err(err);
            }
        };

        for candidate in &candidates {
            match self
                .assignments
                .attempt_driver_assignment(booking_id, candidate)
                .await
            {
                Ok(assignment) => {
                    self.metrics
                        .assignments_total
                        .with_label_values(&["offered"])
                        .inc();
                    self.emit(DispatchEvent::OfferCreated {
                        booking_id,
                        driver_id: assignment.driver_id,
                        assignment_id: assignment.id,
                    });
                    return Ok(DispatchOutcome::Offered(assignment));
                }
                Err(DispatchError::DriverNoLongerAvailable(driver_id)) => {
                    info!(%driver_id, "candidate no longer available; trying next");
                }
                Err(err) => return Err(err),
            }
        }

        self.defer(booking_id, ReassignmentTrigger::NoDrivers).await
    }

    async fn defer(
        &self,
        booking_id: Uuid,
        trigger: ReassignmentTrigger,
    ) -> Result<DispatchOutcome, DispatchError> {
        let decision = self.edge_cases.handle_no_drivers_available(booking_id).await?;
        self.metrics
            .reassignments_total
            .with_label_values(&[trigger_label(trigger)])
            .inc();
        self.emit_decision(booking_id, &decision);
        Ok(DispatchOutcome::Deferred(decision))
    }

    /// Route a driver's accept/reject to the assignment manager and, on
    /// rejection, hand the booking to the coordinator for another round.
    pub async fn driver_respond(
        &self,
        assignment_id: Uuid,
        driver_id: Uuid,
        response: DriverResponse,
        reason: Option<String>,
    ) -> Result<RespondOutcome, DispatchError> {
        let outcome = self
            .assignments
            .handle_driver_response(assignment_id, driver_id, response, reason)
            .await?;

        match outcome {
            DriverResponseOutcome::Accepted(transition) => {
                self.metrics
                    .assignments_total
                    .with_label_values(&["accepted"])
                    .inc();
                self.emit(DispatchEvent::BookingAssigned {
                    booking_id: transition.booking_id,
                    driver_id,
                });
                Ok(RespondOutcome::Assigned(transition))
            }
            DriverResponseOutcome::Rejected {
                booking_id, reason, ..
            } => {
                self.metrics
                    .assignments_total
                    .with_label_values(&["rejected"])
                    .inc();
                let decision = self
                    .edge_cases
                    .handle_driver_rejection(booking_id, driver_id, &reason)
                    .await?;
                self.metrics
                    .reassignments_total
                    .with_label_values(&[trigger_label(ReassignmentTrigger::Rejection)])
                    .inc();
                self.emit_decision(booking_id, &decision);
                Ok(RespondOutcome::Reassignment(decision))
            }
        }
    }

    /// Resolve N drivers accepting the same booking at once; first in the
    /// provided order wins under transaction isolation.
    pub async fn resolve_concurrent_acceptance(
        &self,
        booking_id: Uuid,
        driver_ids: &[Uuid],
    ) -> Result<ConcurrentAcceptance, DispatchError> {
        let resolution = self
            .assignments
            .handle_concurrent_acceptance(booking_id, driver_ids)
            .await?;

        self.metrics
            .assignments_total
            .with_label_values(&["accepted"])
            .inc();
        self.emit(DispatchEvent::BookingAssigned {
            booking_id,
            driver_id: resolution.winner,
        });
        Ok(resolution)
    }

    /// Explicit customer/admin cancellation, distinct from supply-exhaustion
    /// cancellations in both reason and actor.
    pub async fn cancel_booking(
        &self,
        booking_id: Uuid,
        reason: &str,
        actor: Actor,
    ) -> Result<TransitionOutcome, DispatchError> {
        let outcome = self
            .state_machine
            .transition_booking(
                booking_id,
                BookingStatus::Cancelled,
                payload_from(json!({ "cancellation_reason": reason })),
                actor,
            )
            .await?;

        self.metrics
            .bookings_cancelled_total
            .with_label_values(&["explicit"])
            .inc();
        self.emit(DispatchEvent::BookingCancelled {
            booking_id,
            reason: reason.to_string(),
        });
        Ok(outcome)
    }

    pub async fn driver_disconnected(
        &self,
        driver_id: Uuid,
    ) -> Result<Vec<(Uuid, ReassignmentDecision)>, DispatchError> {
        let decisions = self.edge_cases.handle_driver_disconnect(driver_id).await?;
        for (booking_id, decision) in &decisions {
            self.metrics
                .reassignments_total
                .with_label_values(&[trigger_label(ReassignmentTrigger::Disconnect)])
                .inc();
            self.emit_decision(*booking_id, decision);
        }
        Ok(decisions)
    }

    /// Expire overdue offers and schedule a new round for each affected
    /// booking. Intended for the periodic sweep; also safe to call ad hoc.
    pub async fn run_expiry_sweep_once(&self) -> Result<usize, DispatchError> {
        let expired = self.assignments.sweep_expired_assignments().await?;

        for offer in &expired {
            self.metrics.expired_assignments_total.inc();
            self.metrics
                .assignments_total
                .with_label_values(&["expired"])
                .inc();
            self.emit(DispatchEvent::OfferExpired {
                booking_id: offer.booking_id,
                driver_id: offer.driver_id,
                assignment_id: offer.assignment_id,
            });

            let decision = self
                .edge_cases
                .handle_driver_timeout(offer.booking_id, offer.driver_id)
                .await?;
            self.metrics
                .reassignments_total
                .with_label_values(&[trigger_label(ReassignmentTrigger::Timeout)])
                .inc();
            self.emit_decision(offer.booking_id, &decision);
        }

        Ok(expired.len())
    }

    /// Consume due retry tasks and expire stale ones.
    pub async fn run_retry_sweep_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessedRetry>, DispatchError> {
        let processed = self.edge_cases.process_due_retries(now).await?;

        for entry in &processed {
            let label = match &entry.outcome {
                RetryOutcome::Offered { .. } => "offered",
                RetryOutcome::Rescheduled(_) => "rescheduled",
                RetryOutcome::Superseded => "superseded",
                RetryOutcome::Failed => "failed",
            };
            self.metrics
                .retry_tasks_processed_total
                .with_label_values(&[label])
                .inc();

            match &entry.outcome {
                RetryOutcome::Offered {
                    assignment_id,
                    driver_id,
                } => {
                    self.metrics
                        .assignments_total
                        .with_label_values(&["offered"])
                        .inc();
                    self.emit(DispatchEvent::OfferCreated {
                        booking_id: entry.booking_id,
                        driver_id: *driver_id,
                        assignment_id: *assignment_id,
                    });
                }
                RetryOutcome::Rescheduled(decision) => {
                    self.emit_decision(entry.booking_id, decision);
                }
                RetryOutcome::Superseded | RetryOutcome::Failed => {}
            }
        }

        let stale_after = self.config.reassignment_delay * 10;
        self.edge_cases.cleanup_expired_tasks(now, stale_after).await?;

        Ok(processed)
    }

    // Driver-side bookkeeping the API layer maps onto its endpoints.

    pub async fn upsert_driver(&self, profile: &DriverProfile) -> Result<(), DispatchError> {
        batch_write(
            self.store.as_ref(),
            vec![WriteOp::Set {
                collection: collections::DRIVERS,
                id: profile.id.to_string(),
                data: serde_json::to_value(profile).map_err(crate::error::StoreError::from)?,
            }],
        )
        .await?;
        Ok(())
    }

    pub async fn driver_online(
        &self,
        driver_id: Uuid,
        location: GeoPoint,
    ) -> Result<(), DispatchError> {
        let availability = DriverAvailability::online_at(driver_id, location);
        batch_write(
            self.store.as_ref(),
            vec![WriteOp::Set {
                collection: collections::DRIVER_AVAILABILITY,
                id: driver_id.to_string(),
                data: serde_json::to_value(&availability)
                    .map_err(crate::error::StoreError::from)?,
            }],
        )
        .await?;
        info!(%driver_id, "driver online");
        Ok(())
    }

    /// Explicit sign-off. Contrast with a disconnect, which never touches
    /// `is_online`.
    pub async fn driver_offline(&self, driver_id: Uuid) -> Result<(), DispatchError> {
        execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let key = driver_id.to_string();
                    let mut availability: DriverAvailability = tx
                        .get(collections::DRIVER_AVAILABILITY, &key)
                        .await?
                        .ok_or(DispatchError::DriverNotFound(driver_id))?;
                    availability.is_online = false;
                    availability.is_available = false;
                    availability.last_seen = Utc::now();
                    tx.set(collections::DRIVER_AVAILABILITY, &key, &availability)?;
                    Ok((tx, ()))
                })
            },
        )
        .await?;

        info!(%driver_id, "driver offline");
        Ok(())
    }

    pub async fn update_driver_location(
        &self,
        driver_id: Uuid,
        location: GeoPoint,
    ) -> Result<(), DispatchError> {
        execute_transaction_with_retry(
            self.store.clone(),
            &self.config.retry_policy,
            |mut tx| {
                Box::pin(async move {
                    let key = driver_id.to_string();
                    let mut availability: DriverAvailability = tx
                        .get(collections::DRIVER_AVAILABILITY, &key)
                        .await?
                        .ok_or(DispatchError::DriverNotFound(driver_id))?;
                    availability.current_location = location;
                    availability.last_seen = Utc::now();
                    tx.set(collections::DRIVER_AVAILABILITY, &key, &availability)?;
                    Ok((tx, ()))
                })
            },
        )
        .await?;
        Ok(())
    }

    pub async fn booking(&self, booking_id: Uuid) -> Result<Option<Booking>, DispatchError> {
        Ok(fetch(
            self.store.as_ref(),
            collections::BOOKINGS,
            &booking_id.to_string(),
        )
        .await?)
    }

    pub async fn assignment(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<Assignment>, DispatchError> {
        Ok(fetch(
            self.store.as_ref(),
            collections::ASSIGNMENTS,
            &assignment_id.to_string(),
        )
        .await?)
    }

    pub async fn driver_availability(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<DriverAvailability>, DispatchError> {
        Ok(fetch(
            self.store.as_ref(),
            collections::DRIVER_AVAILABILITY,
            &driver_id.to_string(),
        )
        .await?)
    }

    fn emit(&self, event: DispatchEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_decision(&self, booking_id: Uuid, decision: &ReassignmentDecision) {
        match decision {
            ReassignmentDecision::Scheduled { attempt, .. } => {
                self.emit(DispatchEvent::ReassignmentScheduled {
                    booking_id,
                    attempt: *attempt,
                });
            }
            ReassignmentDecision::Cancelled { reason } => {
                self.metrics
                    .bookings_cancelled_total
                    .with_label_values(&["supply_exhausted"])
                    .inc();
                self.emit(DispatchEvent::BookingCancelled {
                    booking_id,
                    reason: reason.clone(),
                });
            }
        }
    }
}

fn trigger_label(trigger: ReassignmentTrigger) -> &'static str {
    match trigger {
        ReassignmentTrigger::NoDrivers => "no_drivers",
        ReassignmentTrigger::Rejection => "rejection",
        ReassignmentTrigger::Timeout => "timeout",
        ReassignmentTrigger::Disconnect => "disconnect",
    }
}

fn validate_waypoint(waypoint: &Waypoint) -> Result<(), DispatchError> {
    let GeoPoint { lat, lng } = waypoint.coordinates;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(DispatchError::Validation(format!(
            "coordinates out of range: ({lat}, {lng})"
        )));
    }
    if waypoint.address.trim().is_empty() {
        return Err(DispatchError::Validation(
            "address cannot be empty".to_string(),
        ));
    }
    Ok(())
}
