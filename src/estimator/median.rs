//! Segment-median speed estimate over a trailing time window.
//!
//! The median over many short segments shrugs off any single bad fix, and
//! the time and distance floors keep GPS wander at standstill from turning
//! into phantom speed.

use crate::config::MedianConfig;
use crate::geo::{haversine_m, ms_to_kmh};
use crate::model::{Sample, elapsed_secs};

/// Estimates speed in km/h from `history`, which should already include
/// `current`. Returns `None` when the window holds too few usable segments.
pub fn estimate(history: &[Sample], current: &Sample, cap_kmh: f64, config: &MedianConfig) -> Option<f64> {
    let window: Vec<&Sample> = history
        .iter()
        .filter(|s| {
            let age = elapsed_secs(s.timestamp, current.timestamp);
            (0.0..=config.window_secs).contains(&age)
        })
        .collect();

    if window.len() < config.min_samples.max(2) {
        return None;
    }

    let mut speeds: Vec<f64> = window
        .windows(2)
        .filter_map(|pair| {
            let (a, b) = (pair[0], pair[1]);
            let dt = elapsed_secs(a.timestamp, b.timestamp);
            if dt < config.min_segment_secs {
                return None;
            }
            let meters = haversine_m(a.latitude, a.longitude, b.latitude, b.longitude);
            if meters < config.min_segment_meters {
                return None;
            }
            let kmh = ms_to_kmh(meters / dt);
            if kmh < config.floor_kmh || kmh > config.hard_gate_kmh {
                return None;
            }
            Some(kmh.min(cap_kmh))
        })
        .collect();

    speeds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if speeds.len() >= config.trim_min_count.max(1) {
        let trim = (speeds.len() / 10).max(1);
        speeds.truncate(speeds.len() - trim);
    }

    if speeds.len() < config.min_values.max(1) {
        return None;
    }

    Some(median_sorted(&speeds))
}

fn median_sorted(values: &[f64]) -> f64 {
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_200_000, 0).unwrap() + Duration::seconds(secs)
    }

    /// Samples heading due east at `kmh`, one every `step` seconds.
    fn track(kmh: f64, step: i64, count: i64) -> Vec<Sample> {
        let lat: f64 = 59.0;
        let meters_per_deg_lon = crate::geo::EARTH_RADIUS_M * lat.to_radians().cos() * std::f64::consts::PI / 180.0;
        (0..count)
            .map(|i| {
                let meters = kmh / 3.6 * (i * step) as f64;
                Sample {
                    latitude: lat,
                    longitude: 18.0 + meters / meters_per_deg_lon,
                    timestamp: t(i * step),
                }
            })
            .collect()
    }

    #[test]
    fn test_constant_speed_three_samples() {
        let history = track(80.0, 10, 3);
        let current = *history.last().unwrap();
        let kmh = estimate(&history, &current, 250.0, &MedianConfig::default()).unwrap();
        assert!((kmh - 80.0).abs() < 1.0, "got {kmh}");
    }

    #[test]
    fn test_too_few_samples() {
        let history = track(80.0, 10, 2);
        let current = *history.last().unwrap();
        assert_eq!(estimate(&history, &current, 250.0, &MedianConfig::default()), None);
    }

    #[test]
    fn test_samples_outside_window_do_not_count() {
        // t = 0, 60, 120, 180: only the last two fall in the 90 s window
        let history = track(80.0, 60, 4);
        let current = *history.last().unwrap();
        assert_eq!(estimate(&history, &current, 250.0, &MedianConfig::default()), None);
    }

    #[test]
    fn test_standing_train_gives_no_estimate() {
        let history = track(0.0, 10, 5);
        let current = *history.last().unwrap();
        assert_eq!(estimate(&history, &current, 250.0, &MedianConfig::default()), None);
    }

    #[test]
    fn test_short_segments_are_skipped() {
        let history = track(80.0, 2, 6);
        let current = *history.last().unwrap();
        assert_eq!(estimate(&history, &current, 250.0, &MedianConfig::default()), None);
    }

    #[test]
    fn test_cap_applies_per_segment() {
        let history = track(200.0, 10, 4);
        let current = *history.last().unwrap();
        let kmh = estimate(&history, &current, 160.0, &MedianConfig::default()).unwrap();
        assert_eq!(kmh, 160.0);
    }

    #[test]
    fn test_single_outlier_is_ignored() {
        let mut history = track(60.0, 10, 7);
        // one fix jumps 400 m ahead
        history[3].longitude += 0.007;
        let current = *history.last().unwrap();
        let kmh = estimate(&history, &current, 250.0, &MedianConfig::default()).unwrap();
        assert!((kmh - 60.0).abs() < 5.0, "got {kmh}");
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median_sorted(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median_sorted(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }
}
