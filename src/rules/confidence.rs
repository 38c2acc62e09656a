//! Confidence scoring and great-circle distance, shared by every
//! evaluator (spec §4.4).

use super::types::ConfidenceSignal;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Combines a vector of `{name, weight, value}` signals into a single
/// 0-100 score. An evaluator with no signals (shouldn't happen, but
/// defensively) reports zero confidence rather than dividing by zero.
pub fn combine(signals: &[ConfidenceSignal]) -> u8 {
    let total_weight: f64 = signals.iter().map(|s| s.weight).sum();
    if total_weight <= 0.0 {
        return 0;
    }
    let score = signals.iter().map(|s| s.weight * s.value).sum::<f64>() / total_weight;
    score.clamp(0.0, 100.0).floor() as u8
}

/// Great-circle distance between two lat/lng points, in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (lat1, lng1, lat2, lng2) = (
        lat1.to_radians(),
        lng1.to_radians(),
        lat2.to_radians(),
        lng2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nyc_to_london() {
        let km = haversine_km(40.71, -74.01, 51.51, -0.13);
        assert!((5500.0..5600.0).contains(&km), "got {km}");
    }

    #[test]
    fn zero_distance() {
        assert_eq!(haversine_km(1.0, 1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn combine_weighted_average() {
        let signals = [
            ConfidenceSignal { name: "a", weight: 1.0, value: 100.0 },
            ConfidenceSignal { name: "b", weight: 1.0, value: 0.0 },
        ];
        assert_eq!(combine(&signals), 50);
    }

    #[test]
    fn combine_empty_is_zero() {
        assert_eq!(combine(&[]), 0);
    }
}
