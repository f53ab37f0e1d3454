//! Core data types flowing through the normalization pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// A single raw position report as received from upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub train_number: String,
    pub departure_date: Option<String>,
    pub product: Option<String>,
    pub destination: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Degrees clockwise from north.
    pub bearing: Option<f64>,
    /// km/h as reported upstream.
    pub reported_speed: Option<f64>,
    /// `None` when the upstream value was missing or unparseable.
    pub timestamp: Option<DateTime<Utc>>,
    pub canceled: bool,
    pub active: bool,
}

impl Observation {
    pub fn key(&self) -> TrainKey {
        TrainKey::new(
            self.departure_date.as_deref().unwrap_or_default(),
            &self.train_number,
        )
    }

    /// Position sample for this report, if both position and time are usable.
    pub fn sample(&self) -> Option<Sample> {
        let timestamp = self.timestamp?;
        if !crate::geo::is_valid_position(self.latitude, self.longitude) {
            return None;
        }
        Some(Sample {
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp,
        })
    }
}

/// Identity of one physical train run: service day plus train number.
///
/// The train number alone repeats every day, so the departure date is part of
/// the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrainKey {
    pub departure_date: String,
    pub train_number: String,
}

impl TrainKey {
    pub fn new(departure_date: &str, train_number: &str) -> Self {
        Self {
            departure_date: departure_date.trim().to_string(),
            train_number: train_number.trim().to_string(),
        }
    }
}

impl fmt::Display for TrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.departure_date.is_empty() {
            write!(f, "{}", self.train_number)
        } else {
            write!(f, "{}_{}", self.departure_date, self.train_number)
        }
    }
}

impl Serialize for TrainKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Which stage of the pipeline produced a record's speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SpeedSource {
    Reported,
    AlongTrack,
    SegmentMedian,
    Cached,
    None,
}

impl SpeedSource {
    /// Whether the speed came from an estimator or a reused estimate.
    pub fn is_estimate(self) -> bool {
        matches!(
            self,
            SpeedSource::AlongTrack | SpeedSource::SegmentMedian | SpeedSource::Cached
        )
    }
}

/// Display-ready train record, rebuilt on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTrain {
    pub key: TrainKey,
    pub train_number: String,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
    pub product: Option<String>,
    pub destination: Option<String>,
    /// km/h, never above the configured global maximum.
    pub speed: Option<f64>,
    pub is_estimated: bool,
    pub speed_source: SpeedSource,
    pub timestamp: Option<DateTime<Utc>>,
    pub canceled: bool,
    pub active: bool,
}

/// Seconds between two instants, negative when `later` precedes `earlier`.
pub fn elapsed_secs(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_with_date() {
        let key = TrainKey::new("2024-06-01", "501");
        assert_eq!(key.to_string(), "2024-06-01_501");
    }

    #[test]
    fn test_key_display_without_date() {
        let key = TrainKey::new("", " 501 ");
        assert_eq!(key.to_string(), "501");
    }

    #[test]
    fn test_key_is_stable_across_observations() {
        let a = Observation {
            train_number: "501".into(),
            departure_date: Some("2024-06-01".into()),
            latitude: 59.0,
            ..Default::default()
        };
        let b = Observation {
            latitude: 60.0,
            reported_speed: Some(80.0),
            ..a.clone()
        };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_same_number_different_day_differs() {
        assert_ne!(
            TrainKey::new("2024-06-01", "501"),
            TrainKey::new("2024-06-02", "501")
        );
    }

    #[test]
    fn test_sample_requires_timestamp() {
        let obs = Observation {
            train_number: "1".into(),
            latitude: 59.0,
            longitude: 18.0,
            ..Default::default()
        };
        assert!(obs.sample().is_none());
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key = TrainKey::new("2024-06-01", "501");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"2024-06-01_501\"");
    }
}
