use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{NormalizedTrain, SpeedSource};
use crate::normalizer::NormalizeOutcome;
use crate::registry::BatchDelta;

/// Counters for one refresh cycle, written as a CSV row.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,

    // batch shape
    pub observations: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub without_sample: usize,

    // registry delta
    pub trains: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,

    // speed provenance
    pub reported_speed: usize,
    pub along_track: usize,
    pub segment_median: usize,
    pub cached_speed: usize,
    pub without_speed: usize,

    // metadata backfill
    pub backfilled_product: usize,
    pub backfilled_destination: usize,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl CycleStats {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        CycleStats {
            timestamp,
            ..Default::default()
        }
    }

    /// Counts one normalized record.
    pub fn record_train(&mut self, record: &NormalizedTrain, outcome: NormalizeOutcome) {
        match record.speed_source {
            SpeedSource::Reported => self.reported_speed += 1,
            SpeedSource::AlongTrack => self.along_track += 1,
            SpeedSource::SegmentMedian => self.segment_median += 1,
            SpeedSource::Cached => self.cached_speed += 1,
            SpeedSource::None => self.without_speed += 1,
        }

        if !outcome.recorded_sample {
            self.without_sample += 1;
        }

        if outcome.backfilled.product {
            self.backfilled_product += 1;
        }

        if outcome.backfilled.destination {
            self.backfilled_destination += 1;
        }
    }

    pub fn record_delta(&mut self, delta: &BatchDelta, trains: usize) {
        self.trains = trains;
        self.added = delta.added.len();
        self.updated = delta.updated.len();
        self.removed = delta.removed.len();
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of trains whose speed had to be estimated or reused.
    pub fn estimated_pct(&self) -> f64 {
        Self::pct(
            self.along_track + self.segment_median + self.cached_speed,
            self.trains,
        )
    }

    /// Create an error record with timestamp and error information
    pub fn from_error(timestamp: DateTime<Utc>, error_type: &str, error_message: &str) -> Self {
        CycleStats {
            timestamp,
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }

    /// Set the source the batch was read from
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }
}
