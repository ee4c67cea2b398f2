//! Geodesic distance filtering

use crate::relays::Location;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates using the Haversine
/// formula, in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Keep only locations within `max_km` of the user's coordinates, annotating
/// each kept location with its distance.
pub fn filter_by_distance(
    locations: &[Location],
    user_lat: f64,
    user_lon: f64,
    max_km: f64,
) -> Vec<Location> {
    locations
        .iter()
        .filter_map(|loc| {
            let distance = haversine_km(user_lat, user_lon, loc.latitude, loc.longitude);
            (distance <= max_km).then(|| {
                let mut kept = loc.clone();
                kept.distance_km = Some(distance);
                kept
            })
        })
        .collect()
}
