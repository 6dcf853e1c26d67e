use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::DispatchError;
use crate::models::audit::{Actor, StateTransitionRecord, TransitionKind};
use crate::models::booking::{Booking, BookingStatus};
use crate::models::driver::DriverAvailability;
use crate::store::retry::execute_transaction_with_retry;
use crate::store::{TransactionalStore, Tx, collections};

/// Result of a committed transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionOutcome {
    pub booking_id: Uuid,
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub transition_id: Uuid,
}

/// Convenience for building transition payloads from a JSON object literal.
pub fn payload_from(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn jval<T: serde::Serialize>(value: &T) -> Result<Value, DispatchError> {
    Ok(serde_json::to_value(value).map_err(crate::error::StoreError::from)?)
}

/// Owns the booking lifecycle: edge validation, required-field checks, atomic
/// application with audit trail, and the driver-binding side effects that must
/// commit together with the status change.
pub struct StateMachine {
    store: Arc<dyn TransactionalStore>,
    retry: RetryPolicy,
}

impl StateMachine {
    pub fn new(store: Arc<dyn TransactionalStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Transition a booking to `new_state`, merging `payload` into the
    /// document. Runs inside the transactional retry layer; the booking
    /// update, audit record, and availability side effects commit atomically.
    pub async fn transition_booking(
        &self,
        booking_id: Uuid,
        new_state: BookingStatus,
        payload: Map<String, Value>,
        actor: Actor,
    ) -> Result<TransitionOutcome, DispatchError> {
        let payload = &payload;
        let outcome = execute_transaction_with_retry(
            self.store.clone(),
            &self.retry,
            |mut tx| {
                Box::pin(async move {
                    let outcome =
                        Self::apply_transition(&mut tx, booking_id, new_state, payload, actor)
                            .await?;
                    Ok((tx, outcome))
                })
            },
        )
        .await?;

        info!(
            booking_id = %outcome.booking_id,
            from = %outcome.from,
            to = %outcome.to,
            actor = %actor,
            "booking transitioned"
        );
        Ok(outcome)
    }

    /// Undo the booking's most recent forward transition. The reversed edge is
    /// validated against the same adjacency table and the undo is recorded as
    /// a distinct audit kind.
    pub async fn rollback_booking(
        &self,
        booking_id: Uuid,
        actor: Actor,
    ) -> Result<TransitionOutcome, DispatchError> {
        let outcome = execute_transaction_with_retry(
            self.store.clone(),
            &self.retry,
            |mut tx| {
                Box::pin(async move {
                    let outcome = Self::apply_rollback(&mut tx, booking_id, actor).await?;
                    Ok((tx, outcome))
                })
            },
        )
        .await?;

        info!(
            booking_id = %outcome.booking_id,
            from = %outcome.from,
            to = %outcome.to,
            "booking rolled back"
        );
        Ok(outcome)
    }

    /// Transition logic against an open transaction, composable by callers
    /// that need the booking change to commit with their own writes.
    pub(crate) async fn apply_transition(
        tx: &mut Tx,
        booking_id: Uuid,
        new_state: BookingStatus,
        payload: &Map<String, Value>,
        actor: Actor,
    ) -> Result<TransitionOutcome, DispatchError> {
        let id_str = booking_id.to_string();
        let mut doc: Value = tx
            .get(collections::BOOKINGS, &id_str)
            .await?
            .ok_or(DispatchError::BookingNotFound(booking_id))?;

        let from: BookingStatus =
            serde_json::from_value(doc.get("status").cloned().unwrap_or(Value::Null))
                .map_err(|err| DispatchError::Internal(format!("malformed booking status: {err}")))?;

        if !from.can_transition_to(new_state) {
            return Err(DispatchError::InvalidStateTransition {
                from,
                to: new_state,
            });
        }

        let now = Utc::now();
        let transition_id = Uuid::new_v4();
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| DispatchError::Internal("booking is not an object".to_string()))?;

        for (key, value) in payload {
            obj.insert(key.clone(), value.clone());
        }

        obj.insert("status".to_string(), jval(&new_state)?);
        obj.insert("updated_at".to_string(), jval(&now)?);
        obj.insert("last_transition_id".to_string(), jval(&transition_id)?);

        if let Some(field) = new_state.timestamp_field() {
            let already_set = obj.get(field).is_some_and(|v| !v.is_null());
            if !already_set {
                obj.insert(field.to_string(), jval(&now)?);
            }
        }

        // Re-entering the pool after a rejection: the previous driver no
        // longer belongs to this booking.
        if new_state == BookingStatus::Pending {
            obj.insert("driver_id".to_string(), Value::Null);
        }

        let missing: Vec<&'static str> = new_state
            .required_fields()
            .iter()
            .copied()
            .filter(|field| obj.get(*field).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(DispatchError::MissingRequiredFields {
                state: new_state,
                fields: missing,
            });
        }

        let booking: Booking = serde_json::from_value(doc.clone())
            .map_err(|err| DispatchError::Validation(format!("invalid booking payload: {err}")))?;

        tx.set(collections::BOOKINGS, &id_str, &doc)?;

        Self::apply_side_effects(tx, &booking, from, new_state).await?;

        let record = StateTransitionRecord {
            id: transition_id,
            booking_id,
            from_status: from,
            to_status: new_state,
            actor,
            kind: TransitionKind::Forward,
            payload: payload.clone(),
            created_at: now,
        };
        tx.set(
            collections::STATE_TRANSITIONS,
            &transition_id.to_string(),
            &record,
        )?;

        Ok(TransitionOutcome {
            booking_id,
            from,
            to: new_state,
            transition_id,
        })
    }

    async fn apply_side_effects(
        tx: &mut Tx,
        booking: &Booking,
        _from: BookingStatus,
        new_state: BookingStatus,
    ) -> Result<(), DispatchError> {
        match new_state {
            BookingStatus::DriverAssigned | BookingStatus::Accepted => {
                let driver_id = booking
                    .driver_id
                    .ok_or_else(|| DispatchError::Internal("assigned booking without driver".to_string()))?;
                let key = driver_id.to_string();
                let mut availability: DriverAvailability = tx
                    .get(collections::DRIVER_AVAILABILITY, &key)
                    .await?
                    .ok_or(DispatchError::DriverNotFound(driver_id))?;
                availability.bind(booking.id);
                tx.set(collections::DRIVER_AVAILABILITY, &key, &availability)?;
            }
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Rejected => {
                if let Some(driver_id) = booking.driver_id {
                    let key = driver_id.to_string();
                    if let Some(mut availability) = tx
                        .get::<DriverAvailability>(collections::DRIVER_AVAILABILITY, &key)
                        .await?
                    {
                        // Only release a driver still bound to this booking.
                        if availability.current_booking_id == Some(booking.id) {
                            availability.release();
                            tx.set(collections::DRIVER_AVAILABILITY, &key, &availability)?;
                        }
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub(crate) async fn apply_rollback(
        tx: &mut Tx,
        booking_id: Uuid,
        actor: Actor,
    ) -> Result<TransitionOutcome, DispatchError> {
        let id_str = booking_id.to_string();
        let mut doc: Value = tx
            .get(collections::BOOKINGS, &id_str)
            .await?
            .ok_or(DispatchError::BookingNotFound(booking_id))?;

        let booking: Booking = serde_json::from_value(doc.clone())
            .map_err(|err| DispatchError::Internal(format!("malformed booking: {err}")))?;

        let last_id = booking.last_transition_id.ok_or_else(|| {
            DispatchError::StateConflict("booking has no transition to roll back".to_string())
        })?;

        let record: StateTransitionRecord = tx
            .get(collections::STATE_TRANSITIONS, &last_id.to_string())
            .await?
            .ok_or_else(|| {
                DispatchError::Internal(format!("audit record {last_id} missing"))
            })?;

        if record.kind != TransitionKind::Forward {
            return Err(DispatchError::StateConflict(
                "last transition was itself a rollback".to_string(),
            ));
        }
        if record.to_status != booking.status {
            return Err(DispatchError::StateConflict(format!(
                "booking moved to {} since transition {}",
                booking.status, last_id
            )));
        }
        // The edge being undone must be a legal forward edge.
        if !record.from_status.can_transition_to(record.to_status) {
            return Err(DispatchError::InvalidStateTransition {
                from: record.from_status,
                to: record.to_status,
            });
        }

        let now = Utc::now();
        let rollback_id = Uuid::new_v4();
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| DispatchError::Internal("booking is not an object".to_string()))?;

        obj.insert("status".to_string(), jval(&record.from_status)?);
        obj.insert("updated_at".to_string(), jval(&now)?);
        obj.insert("last_transition_id".to_string(), jval(&rollback_id)?);
        if let Some(field) = record.to_status.timestamp_field() {
            obj.insert(field.to_string(), Value::Null);
        }

        // Inverse side effects for the undone state.
        match record.to_status {
            BookingStatus::DriverAssigned | BookingStatus::Accepted => {
                obj.insert("driver_id".to_string(), Value::Null);
                if let Some(driver_id) = booking.driver_id {
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
                }
            }
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Rejected => {
                if let Some(driver_id) = booking.driver_id {
                    let key = driver_id.to_string();
                    if let Some(mut availability) = tx
                        .get::<DriverAvailability>(collections::DRIVER_AVAILABILITY, &key)
                        .await?
                    {
                        if availability.current_booking_id.is_none() {
                            availability.bind(booking_id);
                            tx.set(collections::DRIVER_AVAILABILITY, &key, &availability)?;
                        }
                    }
                }
            }
            _ => {}
        }

        tx.set(collections::BOOKINGS, &id_str, &doc)?;

        let rollback_record = StateTransitionRecord {
            id: rollback_id,
            booking_id,
            from_status: record.to_status,
            to_status: record.from_status,
            actor,
            kind: TransitionKind::Rollback,
            payload: Map::new(),
            created_at: now,
        };
        tx.set(
            collections::STATE_TRANSITIONS,
            &rollback_id.to_string(),
            &rollback_record,
        )?;

        Ok(TransitionOutcome {
            booking_id,
            from: record.to_status,
            to: record.from_status,
            transition_id: rollback_id,
        })
    }
}
