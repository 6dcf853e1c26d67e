use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::geo::{GeoPoint, eta_minutes, haversine_km};
use crate::models::driver::{DriverAvailability, DriverProfile, VehicleType};
use crate::store::{Filter, TransactionalStore, collections, fetch, query_as};

const RATING_POINTS: f64 = 40.0;
const COMPLETION_POINTS: f64 = 30.0;
const RESPONSE_POINTS: f64 = 20.0;
const CANCELLATION_PENALTY: f64 = 10.0;

/// Response-time bonus is full below this threshold and decays linearly to
/// zero at `RESPONSE_FLOOR_SECS`.
const RESPONSE_FULL_CREDIT_SECS: f64 = 60.0;
const RESPONSE_FLOOR_SECS: f64 = 300.0;

const BALANCED_RATING_WEIGHT: f64 = 0.4;
const BALANCED_DISTANCE_WEIGHT: f64 = 0.3;
const BALANCED_PERFORMANCE_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    Closest,
    BestRated,
    Fastest,
    Balanced,
}

impl FromStr for RankingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closest" => Ok(RankingStrategy::Closest),
            "best_rated" => Ok(RankingStrategy::BestRated),
            "fastest" => Ok(RankingStrategy::Fastest),
            "balanced" => Ok(RankingStrategy::Balanced),
            other => Err(format!("unknown ranking strategy: {other}")),
        }
    }
}

/// A driver that survived filtering, with everything ranking needs.
#[derive(Debug, Clone)]
pub struct DriverCandidate {
    pub driver_id: Uuid,
    pub profile: DriverProfile,
    pub location: GeoPoint,
    pub distance_km: f64,
    pub eta_minutes: f64,
    pub performance_score: f64,
}

/// 0-100 score from rating, completion rate, responsiveness, and
/// cancellation history.
pub fn performance_score(profile: &DriverProfile) -> f64 {
    let rating = (profile.rating / 5.0).clamp(0.0, 1.0) * RATING_POINTS;
    let completion = profile.stats.completion_rate().clamp(0.0, 1.0) * COMPLETION_POINTS;
    let response = response_bonus(profile.stats.avg_response_secs);
    let cancellation = profile.stats.cancellation_rate().clamp(0.0, 1.0) * CANCELLATION_PENALTY;

    (rating + completion + response - cancellation).clamp(0.0, 100.0)
}

fn response_bonus(avg_response_secs: f64) -> f64 {
    if avg_response_secs <= RESPONSE_FULL_CREDIT_SECS {
        return RESPONSE_POINTS;
    }

    let span = RESPONSE_FLOOR_SECS - RESPONSE_FULL_CREDIT_SECS;
    let overrun = avg_response_secs - RESPONSE_FULL_CREDIT_SECS;
    (RESPONSE_POINTS * (1.0 - overrun / span)).clamp(0.0, RESPONSE_POINTS)
}

/// Weighted ranking value for the `balanced` strategy.
pub fn balanced_score(candidate: &DriverCandidate, max_radius_km: f64) -> f64 {
    let rating = (candidate.profile.rating / 5.0).clamp(0.0, 1.0);
    let proximity = (1.0 - candidate.distance_km / max_radius_km).clamp(0.0, 1.0);
    let performance = candidate.performance_score / 100.0;

    rating * BALANCED_RATING_WEIGHT
        + proximity * BALANCED_DISTANCE_WEIGHT
        + performance * BALANCED_PERFORMANCE_WEIGHT
}

pub fn rank_candidates(
    candidates: &mut [DriverCandidate],
    strategy: RankingStrategy,
    max_radius_km: f64,
) {
    match strategy {
        RankingStrategy::Closest => {
            candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        }
        RankingStrategy::BestRated => {
            candidates.sort_by(|a, b| b.profile.rating.total_cmp(&a.profile.rating));
        }
        RankingStrategy::Fastest => {
            candidates.sort_by(|a, b| a.eta_minutes.total_cmp(&b.eta_minutes));
        }
        RankingStrategy::Balanced => {
            candidates.sort_by(|a, b| {
                balanced_score(b, max_radius_km).total_cmp(&balanced_score(a, max_radius_km))
            });
        }
    }
}

/// Finds, filters, scores, and ranks candidate drivers for a pickup, widening
/// the search once when the pool comes up empty.
pub struct MatchingEngine {
    store: Arc<dyn TransactionalStore>,
    config: DispatchConfig,
}

impl MatchingEngine {
    pub fn new(store: Arc<dyn TransactionalStore>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    /// Online, available, in-radius, unbound, and suitable drivers for the
    /// given pickup and constraints.
    pub async fn find_available_drivers(
        &self,
        pickup: &GeoPoint,
        radius_km: f64,
        vehicle_type: Option<VehicleType>,
        max_weight_kg: Option<f64>,
    ) -> Result<Vec<DriverCandidate>, DispatchError> {
        let now = Utc::now();
        let availabilities: Vec<DriverAvailability> = query_as(
            self.store.as_ref(),
            collections::DRIVER_AVAILABILITY,
            &[Filter::eq("is_online", true), Filter::eq("is_available", true)],
        )
        .await?;

        let mut candidates = Vec::new();
        for availability in availabilities {
            if availability.current_booking_id.is_some() {
                continue;
            }

            let distance_km = haversine_km(&availability.current_location, pickup);
            if distance_km > radius_km {
                continue;
            }

            let Some(profile) = fetch::<DriverProfile>(
                self.store.as_ref(),
                collections::DRIVERS,
                &availability.driver_id.to_string(),
            )
            .await?
            else {
                warn!(driver_id = %availability.driver_id, "availability without profile; skipping");
                continue;
            };

            if vehicle_type.is_some_and(|required| profile.vehicle_type != required) {
                continue;
            }

            if !Self::is_suitable(&profile, max_weight_kg, now) {
                continue;
            }

            let eta = eta_minutes(distance_km, profile.vehicle_type.speed_kmh());
            let score = performance_score(&profile);
            candidates.push(DriverCandidate {
                driver_id: availability.driver_id,
                location: availability.current_location,
                distance_km,
                eta_minutes: eta,
                performance_score: score,
                profile,
            });
        }

        debug!(
            count = candidates.len(),
            radius_km, "candidate drivers in radius"
        );
        Ok(candidates)
    }

    fn is_suitable(profile: &DriverProfile, max_weight_kg: Option<f64>, now: DateTime<Utc>) -> bool {
        if !profile.is_verified || !profile.is_active {
            return false;
        }
        if !profile.working_hours.contains(now) {
            return false;
        }
        if max_weight_kg.is_some_and(|weight| profile.capacity_kg < weight) {
            return false;
        }
        true
    }

    /// Double the radius, never past the configured maximum.
    pub fn expand_search_radius(&self, radius_km: f64) -> f64 {
        (radius_km * 2.0).min(self.config.max_search_radius_km)
    }

    /// Full matching pass: default radius, one capped expansion on an empty
    /// pool, then ranking. Fails with `NO_DRIVERS_AVAILABLE` when both passes
    /// come up empty.
    pub async fn find_ranked_drivers(
        &self,
        pickup: &GeoPoint,
        vehicle_type: Option<VehicleType>,
        max_weight_kg: Option<f64>,
    ) -> Result<Vec<DriverCandidate>, DispatchError> {
        let radius = self.config.default_search_radius_km;
        let mut candidates = self
            .find_available_drivers(pickup, radius, vehicle_type, max_weight_kg)
            .await?;

        if candidates.is_empty() {
            let expanded = self.expand_search_radius(radius);
            if expanded > radius {
                debug!(radius_km = expanded, "empty pool; expanding search radius");
                candidates = self
                    .find_available_drivers(pickup, expanded, vehicle_type, max_weight_kg)
                    .await?;
            }
        }

        if candidates.is_empty() {
            return Err(DispatchError::NoDriversAvailable);
        }

        rank_candidates(
            &mut candidates,
            self.config.ranking_strategy,
            self.config.max_search_radius_km,
        );
        Ok(candidates)
    }
}
