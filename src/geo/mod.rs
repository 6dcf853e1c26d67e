use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Multiplier applied on top of the raw travel-time estimate to absorb
/// traffic and pickup friction.
const ETA_BUFFER: f64 = 1.2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Estimated minutes to cover `distance_km` at `speed_kmh`, rounded up to a
/// whole minute before the 20% buffer is applied.
pub fn eta_minutes(distance_km: f64, speed_kmh: f64) -> f64 {
    if speed_kmh <= 0.0 {
        return f64::INFINITY;
    }

    (distance_km / speed_kmh * 60.0).ceil() * ETA_BUFFER
}

#[cfg(test)]
mod tests {
    use super::{GeoPoint, eta_minutes, haversine_km};

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn eta_rounds_up_then_buffers() {
        // 5 km at 25 km/h = 12 min exactly, buffered to 14.4.
        assert!((eta_minutes(5.0, 25.0) - 14.4).abs() < 1e-9);
        // 5.1 km at 25 km/h = 12.24 min, ceil to 13, buffered to 15.6.
        assert!((eta_minutes(5.1, 25.0) - 15.6).abs() < 1e-9);
    }

    #[test]
    fn eta_is_infinite_for_zero_speed() {
        assert!(eta_minutes(3.0, 0.0).is_infinite());
    }
}
