// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sky math used by the control loops: coordinate epoch conversion, mosaic
//! panel spacing, geomagnetic declination, and the IP-geolocation fallback.
//!
//! RA is in hours, Dec in degrees throughout, matching the device protocol.

use chrono::{Datelike, Utc};

/// Camera field of view along the RA axis, degrees.
const FOV_RA_DEG: f64 = 0.71;
/// Camera field of view along the Dec axis, degrees.
const FOV_DEC_DEG: f64 = 1.27;

/// Geomagnetic dipole north pole (IGRF-13 epoch 2020), degrees.
const DIPOLE_LAT_DEG: f64 = 80.65;
const DIPOLE_LON_DEG: f64 = -72.68;

/// Convert a requested coordinate to the apparent (current-epoch) frame the
/// device slews in.
///
/// J2000 coordinates are precessed with the rigorous annual-rate
/// approximation; apparent coordinates pass through unchanged.
pub fn parse_coordinate(is_j2000: bool, ra_hours: f64, dec_deg: f64) -> (f64, f64) {
    if !is_j2000 {
        return (ra_hours, dec_deg);
    }
    precess_j2000(ra_hours, dec_deg, years_since_j2000())
}

fn years_since_j2000() -> f64 {
    let now = Utc::now();
    let day_of_year = f64::from(now.ordinal()) / 365.25;
    f64::from(now.year() - 2000) + day_of_year
}

/// Annual-rate precession from J2000 to `years` later.
///
/// m = 3.075 s/yr, n = 20.043 arcsec/yr. Accurate to a few arcseconds over
/// the decades this device will see, well under its plate-solve tolerance.
fn precess_j2000(ra_hours: f64, dec_deg: f64, years: f64) -> (f64, f64) {
    let ra_rad = ra_hours * 15.0_f64.to_radians();
    let dec_rad = dec_deg.to_radians();

    // Guard tan(dec) blowing up at the pole.
    let tan_dec = if dec_deg.abs() > 89.9 { 89.9_f64.to_radians().tan() } else { dec_rad.tan() };

    let delta_ra_s = (3.075 + 1.336 * ra_rad.sin() * tan_dec) * years;
    let delta_dec_as = 20.043 * ra_rad.cos() * years;

    let ra = ra_hours + delta_ra_s / 3600.0;
    let dec = dec_deg + delta_dec_as / 3600.0;
    (ra.rem_euclid(24.0), dec.clamp(-90.0, 90.0))
}

/// Spacing between adjacent mosaic panel centers at the given center.
///
/// Returns `(delta_ra_hours, delta_dec_deg)`. The RA spacing depends on the
/// declination of the row (panels converge toward the poles), which is why
/// callers recompute it per row.
pub fn mosaic_next_center_spacing(
    _center_ra_hours: f64,
    center_dec_deg: f64,
    overlap_percent: f64,
) -> (f64, f64) {
    let keep = (1.0 - overlap_percent / 100.0).clamp(0.05, 1.0);
    let cos_dec = if center_dec_deg.abs() > 89.9 {
        89.9_f64.to_radians().cos()
    } else {
        center_dec_deg.to_radians().cos()
    };

    let delta_ra_hours = FOV_RA_DEG * keep / 15.0 / cos_dec;
    let delta_dec_deg = FOV_DEC_DEG * keep;
    (delta_ra_hours, delta_dec_deg)
}

/// Geomagnetic declination at a site, degrees east of true north.
///
/// Tilted-dipole approximation: the declination is the initial great-circle
/// bearing from the site to the dipole north pole. Adequate for the compass
/// fudge-angle correction, which the operator trims by hand anyway.
pub fn geomag_declination(lat_deg: f64, lon_deg: f64) -> f64 {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let pole_lat = DIPOLE_LAT_DEG.to_radians();
    let pole_lon = DIPOLE_LON_DEG.to_radians();

    let d_lon = pole_lon - lon;
    let y = d_lon.sin() * pole_lat.cos();
    let x = lat.cos() * pole_lat.sin() - lat.sin() * pole_lat.cos() * d_lon.cos();
    y.atan2(x).to_degrees()
}

/// Rotate a 2x2 calibration matrix counterclockwise by `degrees`.
pub fn apply_rotation(matrix: [[f64; 2]; 2], degrees: f64) -> [[f64; 2]; 2] {
    let r = degrees.to_radians();
    let (sin, cos) = r.sin_cos();
    // Rows of the rotation matrix times columns of the input.
    [
        [
            cos * matrix[0][0] - sin * matrix[1][0],
            cos * matrix[0][1] - sin * matrix[1][1],
        ],
        [
            sin * matrix[0][0] + cos * matrix[1][0],
            sin * matrix[0][1] + cos * matrix[1][1],
        ],
    ]
}

/// Estimate the site location from the machine's public IP address.
///
/// Used by the startup sequence when neither the request nor the config
/// provides a location. Returns `(lat, lon)`.
pub async fn current_gps_coordinates() -> Option<(f64, f64)> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .ok()?;
    let body: serde_json::Value =
        client.get("http://ip-api.com/json").send().await.ok()?.json().await.ok()?;

    let lat = body.get("lat").and_then(serde_json::Value::as_f64)?;
    let lon = body.get("lon").and_then(serde_json::Value::as_f64)?;
    Some((lat, lon))
}

#[cfg(test)]
#[path = "astro_tests.rs"]
mod tests;
