//! End-to-end tests driving the engine against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc, Weekday};
use serde_json::json;
use uuid::Uuid;

use dispatch_engine::config::{DispatchConfig, RetryPolicy};
use dispatch_engine::engine::assignment::DriverResponse;
use dispatch_engine::engine::edge_cases::ReassignmentDecision;
use dispatch_engine::engine::{DispatchEngine, DispatchEvent, DispatchOutcome, RespondOutcome};
use dispatch_engine::error::DispatchError;
use dispatch_engine::geo::GeoPoint;
use dispatch_engine::models::assignment::{Assignment, AssignmentStatus, DriverSnapshot};
use dispatch_engine::models::audit::Actor;
use dispatch_engine::models::booking::{Booking, BookingStatus, PackageDetails, Waypoint};
use dispatch_engine::models::driver::{
    DriverAvailability, DriverProfile, DriverStats, VehicleType, WorkingHours,
};
use dispatch_engine::notify::LogNotifier;
use dispatch_engine::store::memory::MemoryStore;
use dispatch_engine::store::{Filter, TransactionalStore, WriteOp, batch_write, collections};

const PICKUP: GeoPoint = GeoPoint {
    lat: 52.52,
    lng: 13.405,
};

fn test_config() -> DispatchConfig {
    DispatchConfig {
        reassignment_delay: Duration::ZERO,
        retry_policy: RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..DispatchConfig::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine_with(config: DispatchConfig) -> (Arc<DispatchEngine>, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(DispatchEngine::new(
        store.clone(),
        Arc::new(LogNotifier),
        config,
    ));
    (engine, store)
}

fn all_day_hours() -> WorkingHours {
    WorkingHours {
        days: vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ],
        start: NaiveTime::MIN,
        end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
    }
}

fn profile(id: Uuid) -> DriverProfile {
    DriverProfile {
        id,
        name: "Test Driver".to_string(),
        phone: "+491700000000".to_string(),
        rating: 4.5,
        vehicle_type: VehicleType::TwoWheeler,
        capacity_kg: 20.0,
        is_verified: true,
        is_active: true,
        working_hours: all_day_hours(),
        stats: DriverStats::default(),
    }
}

/// Offset in degrees of latitude; ~0.009 degrees per km.
fn near_pickup(km: f64) -> GeoPoint {
    GeoPoint {
        lat: PICKUP.lat + km * 0.009,
        lng: PICKUP.lng,
    }
}

async fn seed_driver(engine: &DispatchEngine, location: GeoPoint) -> Uuid {
    let id = Uuid::new_v4();
    engine.upsert_driver(&profile(id)).await.unwrap();
    engine.driver_online(id, location).await.unwrap();
    id
}

async fn seed_booking(engine: &DispatchEngine) -> Booking {
    engine
        .create_booking(
            Uuid::new_v4(),
            Waypoint {
                coordinates: PICKUP,
                address: "Pickup St 1".to_string(),
            },
            Waypoint {
                coordinates: near_pickup(3.0),
                address: "Dropoff Ave 2".to_string(),
            },
            PackageDetails { weight_kg: 5.0 },
            12.5,
        )
        .await
        .unwrap()
}

fn set_doc(collection: &'static str, id: String, data: serde_json::Value) -> WriteOp {
    WriteOp::Set {
        collection,
        id,
        data,
    }
}

/// A booking with every lifecycle field filled, so required-field checks never
/// mask the adjacency verdict.
fn saturated_booking(status: BookingStatus, driver_id: Uuid) -> Booking {
    let now = Utc::now();
    let mut booking = Booking::new(
        Uuid::new_v4(),
        Waypoint {
            coordinates: PICKUP,
            address: "Pickup St 1".to_string(),
        },
        Waypoint {
            coordinates: near_pickup(3.0),
            address: "Dropoff Ave 2".to_string(),
        },
        PackageDetails { weight_kg: 5.0 },
        10.0,
    );
    booking.status = status;
    booking.driver_id = Some(driver_id);
    booking.assigned_at = Some(now);
    booking.accepted_at = Some(now);
    booking.enroute_at = Some(now);
    booking.arrived_at = Some(now);
    booking.picked_up_at = Some(now);
    booking.in_transit_at = Some(now);
    booking.delivered_at = Some(now);
    booking.money_collected_at = Some(now);
    booking.completed_at = Some(now);
    booking.cancelled_at = Some(now);
    booking.rejected_at = Some(now);
    booking.cancellation_reason = Some("seed".to_string());
    booking.rejection_reason = Some("seed".to_string());
    booking
}

#[tokio::test]
async fn every_state_pair_matches_the_adjacency_table() {
    let (engine, store) = engine_with(test_config());

    for from in BookingStatus::ALL {
        for to in BookingStatus::ALL {
            if from == to {
                continue;
            }

            let driver_id = Uuid::new_v4();
            let booking = saturated_booking(from, driver_id);
            let availability = DriverAvailability::online_at(driver_id, near_pickup(1.0));
            batch_write(
                store.as_ref(),
                vec![
                    set_doc(
                        collections::BOOKINGS,
                        booking.id.to_string(),
                        serde_json::to_value(&booking).unwrap(),
                    ),
                    set_doc(
                        collections::DRIVER_AVAILABILITY,
                        driver_id.to_string(),
                        serde_json::to_value(&availability).unwrap(),
                    ),
                ],
            )
            .await
            .unwrap();

            let result = engine
                .state_machine()
                .transition_booking(booking.id, to, Default::default(), Actor::System)
                .await;

            if from.can_transition_to(to) {
                let outcome = result.unwrap_or_else(|err| {
                    panic!("legal edge {from} -> {to} was refused: {err}")
                });
                assert_eq!(outcome.from, from);
                assert_eq!(outcome.to, to);

                let stored = engine.booking(booking.id).await.unwrap().unwrap();
                assert_eq!(stored.status, to);
            } else {
                match result {
                    Err(DispatchError::InvalidStateTransition { .. }) => {}
                    other => panic!("illegal edge {from} -> {to} gave {other:?}"),
                }
            }
        }
    }
}

#[tokio::test]
async fn failed_transition_leaves_booking_and_audit_untouched() {
    let (engine, store) = engine_with(test_config());
    let booking = seed_booking(&engine).await;

    let err = engine
        .state_machine()
        .transition_booking(
            booking.id,
            BookingStatus::Delivered,
            Default::default(),
            Actor::System,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE_TRANSITION");

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Pending);
    assert!(stored.last_transition_id.is_none());

    let audit = store
        .query(
            collections::STATE_TRANSITIONS,
            &[Filter::eq("booking_id", booking.id)],
        )
        .await
        .unwrap();
    assert!(audit.is_empty());
}

#[tokio::test]
async fn transient_conflicts_are_retried_until_commit() {
    let (engine, store) = engine_with(test_config());
    let booking = seed_booking(&engine).await;

    store.inject_conflicts(2);
    engine
        .cancel_booking(booking.id, "customer changed plans", Actor::Customer(booking.customer_id))
        .await
        .unwrap();

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(
        stored.cancellation_reason.as_deref(),
        Some("customer changed plans")
    );
    assert!(stored.cancelled_at.is_some());
}

#[tokio::test]
async fn matching_skips_unsuitable_drivers() {
    let (engine, store) = engine_with(test_config());

    let good = seed_driver(&engine, near_pickup(1.0)).await;

    // Bound to another booking.
    let bound = Uuid::new_v4();
    engine.upsert_driver(&profile(bound)).await.unwrap();
    let mut availability = DriverAvailability::online_at(bound, near_pickup(1.0));
    availability.bind(Uuid::new_v4());
    batch_write(
        store.as_ref(),
        vec![set_doc(
            collections::DRIVER_AVAILABILITY,
            bound.to_string(),
            serde_json::to_value(&availability).unwrap(),
        )],
    )
    .await
    .unwrap();

    // Too small a vehicle for the package.
    let tiny = Uuid::new_v4();
    let mut tiny_profile = profile(tiny);
    tiny_profile.capacity_kg = 2.0;
    engine.upsert_driver(&tiny_profile).await.unwrap();
    engine.driver_online(tiny, near_pickup(1.0)).await.unwrap();

    // Not verified.
    let unverified = Uuid::new_v4();
    let mut unverified_profile = profile(unverified);
    unverified_profile.is_verified = false;
    engine.upsert_driver(&unverified_profile).await.unwrap();
    engine
        .driver_online(unverified, near_pickup(1.0))
        .await
        .unwrap();

    // Outside even the maximum radius.
    seed_driver(&engine, near_pickup(30.0)).await;

    let candidates = engine
        .matching()
        .find_ranked_drivers(&PICKUP, None, Some(5.0))
        .await
        .unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].driver_id, good);
}

#[tokio::test]
async fn empty_pool_widens_the_radius_once() {
    let (engine, _store) = engine_with(test_config());

    // Beyond the 5 km default, inside the doubled 10 km radius.
    let reachable = seed_driver(&engine, near_pickup(8.0)).await;

    let candidates = engine
        .matching()
        .find_ranked_drivers(&PICKUP, None, None)
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].driver_id, reachable);
    assert!(candidates[0].distance_km > 5.0);
}

#[tokio::test]
async fn expansion_never_exceeds_the_maximum_radius() {
    let (engine, _store) = engine_with(test_config());
    seed_driver(&engine, near_pickup(30.0)).await;

    let err = engine
        .matching()
        .find_ranked_drivers(&PICKUP, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_DRIVERS_AVAILABLE");
}

#[tokio::test]
async fn no_supply_is_retried_three_times_then_cancelled() {
    let (engine, _store) = engine_with(test_config());
    let booking = seed_booking(&engine).await;

    let outcome = engine.dispatch_booking(booking.id).await.unwrap();
    match outcome {
        DispatchOutcome::Deferred(ReassignmentDecision::Scheduled { attempt, .. }) => {
            assert_eq!(attempt, 1);
        }
        other => panic!("expected a scheduled retry, got {other:?}"),
    }

    // Attempts 2 and 3 reschedule; the fourth pass finds the budget spent.
    for expected_attempt in [2u32, 3] {
        let processed = engine.run_retry_sweep_once(Utc::now()).await.unwrap();
        assert_eq!(processed.len(), 1);
        match &processed[0].outcome {
            dispatch_engine::engine::edge_cases::RetryOutcome::Rescheduled(
                ReassignmentDecision::Scheduled { attempt, .. },
            ) => assert_eq!(*attempt, expected_attempt),
            other => panic!("expected reschedule, got {other:?}"),
        }
    }

    let processed = engine.run_retry_sweep_once(Utc::now()).await.unwrap();
    assert_eq!(processed.len(), 1);
    match &processed[0].outcome {
        dispatch_engine::engine::edge_cases::RetryOutcome::Rescheduled(
            ReassignmentDecision::Cancelled { reason },
        ) => assert_eq!(reason, "no drivers available"),
        other => panic!("expected cancellation, got {other:?}"),
    }

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(
        stored.cancellation_reason.as_deref(),
        Some("no drivers available")
    );
}

#[tokio::test]
async fn driver_accepts_within_the_ttl() {
    let (engine, _store) = engine_with(test_config());
    let driver = seed_driver(&engine, near_pickup(1.0)).await;
    let booking = seed_booking(&engine).await;

    let offer = match engine.dispatch_booking(booking.id).await.unwrap() {
        DispatchOutcome::Offered(assignment) => assignment,
        other => panic!("expected an offer, got {other:?}"),
    };
    assert_eq!(offer.driver_id, driver);
    assert!(offer.expires_at > Utc::now());

    // Someone else cannot answer this offer.
    let err = engine
        .driver_respond(offer.id, Uuid::new_v4(), DriverResponse::Accepted, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED_RESPONSE");

    match engine
        .driver_respond(offer.id, driver, DriverResponse::Accepted, None)
        .await
        .unwrap()
    {
        RespondOutcome::Assigned(outcome) => {
            assert_eq!(outcome.to, BookingStatus::DriverAssigned);
        }
        other => panic!("expected assignment, got {other:?}"),
    }

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::DriverAssigned);
    assert_eq!(stored.driver_id, Some(driver));
    assert!(stored.assigned_at.is_some());

    let availability = engine.driver_availability(driver).await.unwrap().unwrap();
    assert!(!availability.is_available);
    assert_eq!(availability.current_booking_id, Some(booking.id));

    // A second response hits the already-processed guard.
    let err = engine
        .driver_respond(offer.id, driver, DriverResponse::Accepted, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ALREADY_PROCESSED");
}

#[tokio::test]
async fn a_booking_never_carries_two_live_offers() {
    let (engine, _store) = engine_with(test_config());
    seed_driver(&engine, near_pickup(1.0)).await;
    seed_driver(&engine, near_pickup(2.0)).await;
    let booking = seed_booking(&engine).await;

    match engine.dispatch_booking(booking.id).await.unwrap() {
        DispatchOutcome::Offered(_) => {}
        other => panic!("expected an offer, got {other:?}"),
    }

    // The first driver is bound, but the second is free; the live-offer
    // invariant must still refuse a second offer.
    let err = engine.dispatch_booking(booking.id).await.unwrap_err();
    assert_eq!(err.code(), "STATE_CONFLICT");
}

#[tokio::test]
async fn concurrent_acceptance_has_exactly_one_winner() {
    let (engine, store) = engine_with(test_config());
    let booking = seed_booking(&engine).await;

    let drivers: Vec<Uuid> = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let mut writes = Vec::new();
    for driver_id in &drivers {
        engine.upsert_driver(&profile(*driver_id)).await.unwrap();

        let mut availability = DriverAvailability::online_at(*driver_id, near_pickup(1.0));
        availability.bind(booking.id);
        writes.push(set_doc(
            collections::DRIVER_AVAILABILITY,
            driver_id.to_string(),
            serde_json::to_value(&availability).unwrap(),
        ));

        let now = Utc::now();
        let assignment = Assignment {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            driver_id: *driver_id,
            status: AssignmentStatus::Pending,
            driver_snapshot: DriverSnapshot {
                name: "Test Driver".to_string(),
                phone: "+491700000000".to_string(),
                rating: 4.5,
                vehicle_type: VehicleType::TwoWheeler,
                distance_km: 1.0,
                eta_minutes: 5.0,
            },
            assigned_at: now,
            expires_at: now + chrono::Duration::seconds(180),
            responded_at: None,
            rejection_reason: None,
        };
        writes.push(set_doc(
            collections::ASSIGNMENTS,
            assignment.id.to_string(),
            serde_json::to_value(&assignment).unwrap(),
        ));
    }
    batch_write(store.as_ref(), writes).await.unwrap();

    let resolution = engine
        .resolve_concurrent_acceptance(booking.id, &drivers)
        .await
        .unwrap();
    assert_eq!(resolution.winner, drivers[0]);
    assert_eq!(resolution.losers, vec![drivers[1], drivers[2]]);

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::DriverAssigned);
    assert_eq!(stored.driver_id, Some(drivers[0]));

    let assignments: Vec<Assignment> = {
        let docs = store
            .query(
                collections::ASSIGNMENTS,
                &[Filter::eq("booking_id", booking.id)],
            )
            .await
            .unwrap();
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc.data).unwrap())
            .collect()
    };
    let accepted: Vec<_> = assignments
        .iter()
        .filter(|a| a.status == AssignmentStatus::Accepted)
        .collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].driver_id, drivers[0]);
    for rejected in assignments
        .iter()
        .filter(|a| a.status == AssignmentStatus::Rejected)
    {
        assert_eq!(
            rejected.rejection_reason.as_deref(),
            Some("another driver accepted first")
        );
    }

    // Losers get their availability back; the winner stays bound.
    let winner_availability = engine
        .driver_availability(drivers[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(winner_availability.current_booking_id, Some(booking.id));
    for loser in &resolution.losers {
        let availability = engine.driver_availability(*loser).await.unwrap().unwrap();
        assert!(availability.is_available);
        assert!(availability.current_booking_id.is_none());
    }
}

#[tokio::test]
async fn expired_offer_frees_the_driver_and_schedules_a_retry() {
    let config = DispatchConfig {
        assignment_ttl: Duration::ZERO,
        ..test_config()
    };
    let (engine, store) = engine_with(config);
    let driver = seed_driver(&engine, near_pickup(1.0)).await;
    let booking = seed_booking(&engine).await;

    let offer = match engine.dispatch_booking(booking.id).await.unwrap() {
        DispatchOutcome::Offered(assignment) => assignment,
        other => panic!("expected an offer, got {other:?}"),
    };

    let expired = engine.run_expiry_sweep_once().await.unwrap();
    assert_eq!(expired, 1);

    let assignment = engine.assignment(offer.id).await.unwrap().unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Expired);

    // Timeout is treated like a rejection: booking goes back for another
    // round, the driver is unbound.
    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Rejected);
    assert_eq!(stored.rejection_reason.as_deref(), Some("timeout"));

    // The reason lands in a real booking field, not a stray key.
    let raw = store
        .get(collections::BOOKINGS, &booking.id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert!(raw.data.get("reason").is_none());

    let availability = engine.driver_availability(driver).await.unwrap().unwrap();
    assert!(availability.is_available);
    assert!(availability.current_booking_id.is_none());
}

#[tokio::test]
async fn disconnect_reassigns_everything_the_driver_held() {
    let (engine, store) = engine_with(test_config());
    let driver = seed_driver(&engine, near_pickup(1.0)).await;

    // One booking the driver already accepted.
    let held = seed_booking(&engine).await;
    let offer = match engine.dispatch_booking(held.id).await.unwrap() {
        DispatchOutcome::Offered(assignment) => assignment,
        other => panic!("expected an offer, got {other:?}"),
    };
    engine
        .driver_respond(offer.id, driver, DriverResponse::Accepted, None)
        .await
        .unwrap();

    // One booking with an offer still awaiting the driver's answer.
    let offered = seed_booking(&engine).await;
    let now = Utc::now();
    let pending_offer = Assignment {
        id: Uuid::new_v4(),
        booking_id: offered.id,
        driver_id: driver,
        status: AssignmentStatus::Pending,
        driver_snapshot: DriverSnapshot {
            name: "Test Driver".to_string(),
            phone: "+491700000000".to_string(),
            rating: 4.5,
            vehicle_type: VehicleType::TwoWheeler,
            distance_km: 1.0,
            eta_minutes: 5.0,
        },
        assigned_at: now,
        expires_at: now + chrono::Duration::seconds(180),
        responded_at: None,
        rejection_reason: None,
    };
    batch_write(
        store.as_ref(),
        vec![set_doc(
            collections::ASSIGNMENTS,
            pending_offer.id.to_string(),
            serde_json::to_value(&pending_offer).unwrap(),
        )],
    )
    .await
    .unwrap();

    let decisions = engine.driver_disconnected(driver).await.unwrap();
    assert_eq!(decisions.len(), 2);
    for (_, decision) in &decisions {
        assert!(matches!(decision, ReassignmentDecision::Scheduled { .. }));
    }

    for booking_id in [held.id, offered.id] {
        let stored = engine.booking(booking_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Rejected);
    }

    let revoked = engine.assignment(pending_offer.id).await.unwrap().unwrap();
    assert_eq!(revoked.status, AssignmentStatus::Rejected);
    assert_eq!(
        revoked.rejection_reason.as_deref(),
        Some("driver disconnected")
    );

    // A network drop is not a sign-off.
    let availability = engine.driver_availability(driver).await.unwrap().unwrap();
    assert!(availability.is_online);
    assert!(availability.is_available);
    assert!(availability.current_booking_id.is_none());
}

#[tokio::test]
async fn disconnect_mid_trip_cancels_instead_of_failing() {
    let (engine, _store) = engine_with(test_config());
    let driver = seed_driver(&engine, near_pickup(1.0)).await;
    let booking = seed_booking(&engine).await;

    let offer = match engine.dispatch_booking(booking.id).await.unwrap() {
        DispatchOutcome::Offered(assignment) => assignment,
        other => panic!("expected an offer, got {other:?}"),
    };
    engine
        .driver_respond(offer.id, driver, DriverResponse::Accepted, None)
        .await
        .unwrap();
    engine
        .state_machine()
        .transition_booking(
            booking.id,
            BookingStatus::DriverEnroute,
            Default::default(),
            Actor::Driver(driver),
        )
        .await
        .unwrap();

    // No rejected edge exists past driver_assigned; the disconnect must still
    // resolve the booking instead of erroring out.
    let decisions = engine.driver_disconnected(driver).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].0, booking.id);
    match &decisions[0].1 {
        ReassignmentDecision::Cancelled { reason } => assert_eq!(reason, "driver disconnected"),
        other => panic!("expected cancellation, got {other:?}"),
    }

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(
        stored.cancellation_reason.as_deref(),
        Some("driver disconnected")
    );
    assert!(stored.cancelled_at.is_some());

    let availability = engine.driver_availability(driver).await.unwrap().unwrap();
    assert!(availability.is_online);
    assert!(availability.is_available);
    assert!(availability.current_booking_id.is_none());
}

#[tokio::test]
async fn rejection_transition_releases_the_driver_in_the_same_commit() {
    let (engine, _store) = engine_with(test_config());
    let driver = seed_driver(&engine, near_pickup(1.0)).await;
    let booking = seed_booking(&engine).await;

    let offer = match engine.dispatch_booking(booking.id).await.unwrap() {
        DispatchOutcome::Offered(assignment) => assignment,
        other => panic!("expected an offer, got {other:?}"),
    };
    engine
        .driver_respond(offer.id, driver, DriverResponse::Accepted, None)
        .await
        .unwrap();

    // Straight through the state machine, no coordinator cleanup afterwards:
    // the transition alone must free the driver.
    engine
        .state_machine()
        .transition_booking(
            booking.id,
            BookingStatus::Rejected,
            serde_json::from_value(json!({ "rejection_reason": "driver cancelled" })).unwrap(),
            Actor::Driver(driver),
        )
        .await
        .unwrap();

    let availability = engine.driver_availability(driver).await.unwrap().unwrap();
    assert!(availability.is_available);
    assert!(availability.current_booking_id.is_none());

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Rejected);
    assert_eq!(stored.rejection_reason.as_deref(), Some("driver cancelled"));
}

#[tokio::test]
async fn rollback_undoes_the_last_forward_transition() {
    let (engine, _store) = engine_with(test_config());
    let driver = seed_driver(&engine, near_pickup(1.0)).await;
    let booking = seed_booking(&engine).await;

    engine
        .state_machine()
        .transition_booking(
            booking.id,
            BookingStatus::DriverAssigned,
            serde_json::from_value(json!({ "driver_id": driver })).unwrap(),
            Actor::Driver(driver),
        )
        .await
        .unwrap();

    let outcome = engine
        .state_machine()
        .rollback_booking(booking.id, Actor::Admin(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(outcome.from, BookingStatus::DriverAssigned);
    assert_eq!(outcome.to, BookingStatus::Pending);

    let stored = engine.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Pending);
    assert!(stored.assigned_at.is_none());
    assert!(stored.driver_id.is_none());

    let availability = engine.driver_availability(driver).await.unwrap().unwrap();
    assert!(availability.is_available);

    // A second rollback has nothing forward-going left to undo.
    let err = engine
        .state_machine()
        .rollback_booking(booking.id, Actor::System)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STATE_CONFLICT");
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let (engine, _store) = engine_with(test_config());
    let mut events = engine.subscribe();

    seed_driver(&engine, near_pickup(1.0)).await;
    let booking = seed_booking(&engine).await;
    engine.dispatch_booking(booking.id).await.unwrap();

    match events.recv().await.unwrap() {
        DispatchEvent::BookingCreated { booking_id } => assert_eq!(booking_id, booking.id),
        other => panic!("expected BookingCreated, got {other:?}"),
    }
    match events.recv().await.unwrap() {
        DispatchEvent::OfferCreated { booking_id, .. } => assert_eq!(booking_id, booking.id),
        other => panic!("expected OfferCreated, got {other:?}"),
    }
}
