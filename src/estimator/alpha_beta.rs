//! Along-track alpha-beta filter.
//!
//! Each report's displacement is projected onto the reported bearing, which
//! keeps forward motion and drops most lateral GPS jitter. The resulting
//! instantaneous speed feeds a two-state (velocity, acceleration) filter whose
//! gains depend on the predicted speed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::{AlphaBetaConfig, Gains};
use crate::geo::{along_track_m, kmh_to_ms, ms_to_kmh};
use crate::model::{Sample, TrainKey, elapsed_secs};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterState {
    /// m/s along track.
    pub velocity: f64,
    /// m/s².
    pub acceleration: f64,
    pub last_timestamp: DateTime<Utc>,
    pub last_latitude: f64,
    pub last_longitude: f64,
}

impl FilterState {
    fn at(sample: &Sample) -> Self {
        Self {
            velocity: 0.0,
            acceleration: 0.0,
            last_timestamp: sample.timestamp,
            last_latitude: sample.latitude,
            last_longitude: sample.longitude,
        }
    }

    fn anchor(&mut self, sample: &Sample) {
        self.last_timestamp = sample.timestamp;
        self.last_latitude = sample.latitude;
        self.last_longitude = sample.longitude;
    }
}

/// Advances `state` with a new sample and returns the filtered speed in km/h.
///
/// `state` is `None` for a train seen for the first time; it is initialised
/// and no estimate is produced.
pub fn update(
    state: &mut Option<FilterState>,
    sample: &Sample,
    bearing_deg: f64,
    cap_kmh: f64,
    config: &AlphaBetaConfig,
) -> Option<f64> {
    let Some(filter) = state.as_mut() else {
        *state = Some(FilterState::at(sample));
        return None;
    };

    let dt = elapsed_secs(filter.last_timestamp, sample.timestamp);
    if !(config.min_dt_secs..=config.max_dt_secs).contains(&dt) {
        filter.anchor(sample);
        return None;
    }

    let along = along_track_m(
        filter.last_latitude,
        filter.last_longitude,
        sample.latitude,
        sample.longitude,
        bearing_deg,
    )
    .max(0.0);
    filter.anchor(sample);

    let measured = along / dt;
    if along < config.min_displacement_meters || measured > kmh_to_ms(config.max_speed_kmh) {
        return None;
    }

    let predicted = (filter.velocity + filter.acceleration * dt).max(0.0);
    let residual = measured - predicted;
    let gains = gains_for(ms_to_kmh(predicted), config);

    filter.velocity = (predicted + gains.alpha * residual).max(0.0);
    filter.acceleration += gains.beta * residual / dt;

    Some(ms_to_kmh(filter.velocity).clamp(0.0, cap_kmh))
}

fn gains_for(predicted_kmh: f64, config: &AlphaBetaConfig) -> Gains {
    if predicted_kmh < config.low_speed_kmh {
        config.low_gains
    } else if predicted_kmh < config.high_speed_kmh {
        config.medium_gains
    } else {
        config.high_gains
    }
}

/// Filter state for every tracked train.
#[derive(Debug, Default)]
pub struct FilterStore {
    states: HashMap<TrainKey, FilterState>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs [`update`] against the stored state for `key`.
    pub fn update(
        &mut self,
        key: &TrainKey,
        sample: &Sample,
        bearing_deg: f64,
        cap_kmh: f64,
        config: &AlphaBetaConfig,
    ) -> Option<f64> {
        let mut state = self.states.get(key).copied();
        let speed = update(&mut state, sample, bearing_deg, cap_kmh, config);
        if let Some(state) = state {
            self.states.insert(key.clone(), state);
        }
        speed
    }

    pub fn get(&self, key: &TrainKey) -> Option<&FilterState> {
        self.states.get(key)
    }

    pub fn contains(&self, key: &TrainKey) -> bool {
        self.states.contains_key(key)
    }

    pub fn evict(&mut self, key: &TrainKey) {
        self.states.remove(key);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_200_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn meters_per_deg_lon(lat: f64) -> f64 {
        crate::geo::EARTH_RADIUS_M * lat.to_radians().cos() * std::f64::consts::PI / 180.0
    }

    /// Eastbound sample after `secs` seconds at constant `kmh`.
    fn east(kmh: f64, secs: i64) -> Sample {
        let meters = kmh / 3.6 * secs as f64;
        Sample {
            latitude: 59.0,
            longitude: 18.0 + meters / meters_per_deg_lon(59.0),
            timestamp: t(secs),
        }
    }

    fn key() -> TrainKey {
        TrainKey::new("2024-06-01", "501")
    }

    #[test]
    fn test_first_observation_only_initialises() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        assert_eq!(store.update(&key(), &east(100.0, 0), 90.0, 250.0, &config), None);
        let state = store.get(&key()).unwrap();
        assert_eq!(state.velocity, 0.0);
        assert_eq!(state.acceleration, 0.0);
    }

    #[test]
    fn test_scenario_100_kmh_east() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        let mut last = None;
        for secs in [0, 10, 20, 30] {
            last = store.update(&key(), &east(100.0, secs), 90.0, 250.0, &config);
        }
        let kmh = last.unwrap();
        assert!((85.0..=115.0).contains(&kmh), "got {kmh}");
    }

    #[test]
    fn test_converges_to_constant_speed() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        let mut outputs = Vec::new();
        for i in 0..25 {
            if let Some(kmh) = store.update(&key(), &east(140.0, i * 10), 90.0, 250.0, &config) {
                outputs.push(kmh);
            }
        }
        assert_eq!(outputs.len(), 24);
        for kmh in &outputs[15..] {
            assert!((kmh - 140.0).abs() < 3.0, "got {kmh}");
        }
    }

    #[test]
    fn test_backward_motion_never_negative() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        store.update(&key(), &east(80.0, 0), 90.0, 250.0, &config);
        store.update(&key(), &east(80.0, 10), 90.0, 250.0, &config);
        // jumps back west of the previous fix while still heading east
        let back = Sample {
            timestamp: t(20),
            ..east(80.0, 0)
        };
        let speed = store.update(&key(), &back, 90.0, 250.0, &config);
        assert!(speed.is_none_or(|s| s >= 0.0));
        assert!(store.get(&key()).unwrap().velocity >= 0.0);
        assert_eq!(store.get(&key()).unwrap().last_timestamp, t(20));
    }

    #[test]
    fn test_gap_resets_anchor_without_touching_velocity() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        store.update(&key(), &east(100.0, 0), 90.0, 250.0, &config);
        store.update(&key(), &east(100.0, 10), 90.0, 250.0, &config);
        let velocity = store.get(&key()).unwrap().velocity;

        assert_eq!(store.update(&key(), &east(100.0, 600), 90.0, 250.0, &config), None);
        let state = store.get(&key()).unwrap();
        assert_eq!(state.velocity, velocity);
        assert_eq!(state.last_timestamp, t(600));
    }

    #[test]
    fn test_sub_second_update_is_ignored() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        store.update(&key(), &east(100.0, 0), 90.0, 250.0, &config);
        assert_eq!(store.update(&key(), &east(100.0, 0), 90.0, 250.0, &config), None);
    }

    #[test]
    fn test_implausible_jump_is_gated_but_advances() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        store.update(&key(), &east(100.0, 0), 90.0, 250.0, &config);
        // 2 km in 10 s
        assert_eq!(store.update(&key(), &east(720.0, 10), 90.0, 250.0, &config), None);
        assert_eq!(store.get(&key()).unwrap().last_timestamp, t(10));
        assert_eq!(store.get(&key()).unwrap().velocity, 0.0);
    }

    #[test]
    fn test_output_is_capped() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        let mut last = None;
        for i in 0..20 {
            last = store.update(&key(), &east(200.0, i * 10), 90.0, 120.0, &config);
        }
        assert_eq!(last, Some(120.0));
    }

    #[test]
    fn test_gain_buckets() {
        let config = AlphaBetaConfig::default();
        assert_eq!(gains_for(10.0, &config), config.low_gains);
        assert_eq!(gains_for(60.0, &config), config.medium_gains);
        assert_eq!(gains_for(160.0, &config), config.high_gains);
    }

    #[test]
    fn test_evict_and_clear() {
        let mut store = FilterStore::new();
        let config = AlphaBetaConfig::default();
        store.update(&key(), &east(100.0, 0), 90.0, 250.0, &config);
        assert!(store.contains(&key()));
        store.evict(&key());
        assert!(store.is_empty());
    }
}
