//! Great-circle distance on a spherical earth.

use waypost_types::profile::EncodedLocation;

/// Mean earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two encoded locations, in metres.
pub fn distance_m(a: &EncodedLocation, b: &EncodedLocation) -> f64 {
    let lat1 = a.latitude_degrees().to_radians();
    let lat2 = b.latitude_degrees().to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude_degrees() - a.longitude_degrees()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Whether `point` lies within `radius_m` metres of `center`.
pub fn within_radius(center: &EncodedLocation, point: &EncodedLocation, radius_m: u32) -> bool {
    distance_m(center, point) <= f64::from(radius_m)
}
