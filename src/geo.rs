/// A rover or reference-station position in signed decimal degrees. Southern and
/// western hemispheres are negative, per spec section 3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

impl Position {
    pub fn new(lat_deg: f64, lon_deg: f64) -> Self {
        Position { lat_deg, lon_deg }
    }
}

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two positions, in kilometers.
///
/// Spherical haversine rather than a full WGS-84 geodesic: spec section 4.3
/// explicitly allows this, documenting it as <0.5% error relative to a geodesic
/// computation, which is immaterial next to GNSS reference-station spacing.
pub fn haversine_km(a: Position, b: Position) -> f64 {
    let lat1 = a.lat_deg.to_radians();
    let lat2 = b.lat_deg.to_radians();
    let dlat = (b.lat_deg - a.lat_deg).to_radians();
    let dlon = (b.lon_deg - a.lon_deg).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlon = (dlon / 2.0).sin();

    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_KM * c
}
