//! Small geodesy helpers shared by the speed estimators.

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two WGS84 points, in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Projects `(lat, lon)` into a local east/north plane centred on
/// `(origin_lat, origin_lon)` using the equirectangular approximation.
///
/// Returns `(east_m, north_m)`. Accurate to well under a metre for the few
/// hundred metres a train covers between two reports.
pub fn local_offset_m(origin_lat: f64, origin_lon: f64, lat: f64, lon: f64) -> (f64, f64) {
    let east = (lon - origin_lon).to_radians() * origin_lat.to_radians().cos() * EARTH_RADIUS_M;
    let north = (lat - origin_lat).to_radians() * EARTH_RADIUS_M;
    (east, north)
}

/// Component of the displacement from `origin` to `(lat, lon)` along a
/// compass bearing (degrees clockwise from north). Negative when the point
/// lies behind the heading.
pub fn along_track_m(origin_lat: f64, origin_lon: f64, lat: f64, lon: f64, bearing_deg: f64) -> f64 {
    let (east, north) = local_offset_m(origin_lat, origin_lon, lat, lon);
    let theta = bearing_deg.to_radians();
    east * theta.sin() + north * theta.cos()
}

/// Whether a coordinate pair is finite and within WGS84 bounds.
pub fn is_valid_position(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

pub fn ms_to_kmh(ms: f64) -> f64 {
    ms * 3.6
}

pub fn kmh_to_ms(kmh: f64) -> f64 {
    kmh / 3.6
}
