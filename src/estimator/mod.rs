//! Speed estimation for trains that do not report a usable speed.
//!
//! Strategies are tried in configured order; the first one that produces a
//! value wins and is remembered so it can stand in for a short while when
//! every strategy comes up empty.

pub mod alpha_beta;
pub mod median;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use crate::config::{AlphaBetaConfig, MedianConfig};
use crate::model::{Sample, SpeedSource, TrainKey, elapsed_secs};
use alpha_beta::FilterStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    AlongTrack,
    SegmentMedian,
}

impl StrategyKind {
    pub fn source(self) -> SpeedSource {
        match self {
            StrategyKind::AlongTrack => SpeedSource::AlongTrack,
            StrategyKind::SegmentMedian => SpeedSource::SegmentMedian,
        }
    }
}

/// What the estimators get to see for one observation.
#[derive(Debug, Clone, Copy)]
pub struct EstimateInput<'a> {
    /// The current sample, `None` when the observation had no usable time or
    /// position.
    pub sample: Option<&'a Sample>,
    /// Retained history for the key, including `sample`.
    pub history: &'a [Sample],
    pub bearing: Option<f64>,
    pub cap_kmh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CachedEstimate {
    kmh: f64,
    at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SpeedEstimator {
    strategies: Vec<StrategyKind>,
    filters: FilterStore,
    recent: HashMap<TrainKey, CachedEstimate>,
    median: MedianConfig,
    alpha_beta: AlphaBetaConfig,
    reuse_ttl_secs: f64,
}

impl SpeedEstimator {
    pub fn new(
        strategies: Vec<StrategyKind>,
        median: MedianConfig,
        alpha_beta: AlphaBetaConfig,
        reuse_ttl_secs: f64,
    ) -> Self {
        Self {
            strategies,
            filters: FilterStore::new(),
            recent: HashMap::new(),
            median,
            alpha_beta,
            reuse_ttl_secs,
        }
    }

    /// Runs the strategy chain for `key`, falling back to a recent estimate.
    pub fn estimate(
        &mut self,
        key: &TrainKey,
        input: EstimateInput<'_>,
        now: DateTime<Utc>,
    ) -> Option<(f64, SpeedSource)> {
        if let Some(sample) = input.sample {
            for &kind in &self.strategies {
                let kmh = match kind {
                    StrategyKind::AlongTrack => input.bearing.filter(|b| b.is_finite()).and_then(|bearing| {
                        self.filters
                            .update(key, sample, bearing, input.cap_kmh, &self.alpha_beta)
                    }),
                    StrategyKind::SegmentMedian => {
                        median::estimate(input.history, sample, input.cap_kmh, &self.median)
                    }
                };

                if let Some(kmh) = kmh {
                    let kmh = kmh.clamp(0.0, input.cap_kmh);
                    tracing::trace!(key = %key, strategy = ?kind, kmh, "speed estimated");
                    self.recent.insert(key.clone(), CachedEstimate { kmh, at: now });
                    return Some((kmh, kind.source()));
                }
            }
        }

        self.reuse(key, now, input.cap_kmh)
            .map(|kmh| (kmh, SpeedSource::Cached))
    }

    fn reuse(&self, key: &TrainKey, now: DateTime<Utc>, cap_kmh: f64) -> Option<f64> {
        self.recent
            .get(key)
            .filter(|c| (0.0..self.reuse_ttl_secs).contains(&elapsed_secs(c.at, now)))
            .map(|c| c.kmh.min(cap_kmh))
    }

    pub fn filters(&self) -> &FilterStore {
        &self.filters
    }

    /// Whether any per-key state is held for `key`.
    pub fn tracks(&self, key: &TrainKey) -> bool {
        self.filters.contains(key) || self.recent.contains_key(key)
    }

    pub fn evict(&mut self, key: &TrainKey) {
        self.filters.evict(key);
        self.recent.remove(key);
    }

    pub fn clear(&mut self) {
        self.filters.clear();
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_200_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn east(kmh: f64, secs: i64) -> Sample {
        let per_deg = crate::geo::EARTH_RADIUS_M * 59f64.to_radians().cos() * std::f64::consts::PI / 180.0;
        Sample {
            latitude: 59.0,
            longitude: 18.0 + kmh / 3.6 * secs as f64 / per_deg,
            timestamp: t(secs),
        }
    }

    fn estimator(strategies: Vec<StrategyKind>) -> SpeedEstimator {
        SpeedEstimator::new(
            strategies,
            MedianConfig::default(),
            AlphaBetaConfig::default(),
            90.0,
        )
    }

    fn key() -> TrainKey {
        TrainKey::new("2024-06-01", "501")
    }

    #[test]
    fn test_median_fallback_without_bearing() {
        let mut est = estimator(vec![StrategyKind::AlongTrack, StrategyKind::SegmentMedian]);
        let history: Vec<Sample> = (0..3).map(|i| east(70.0, i * 10)).collect();
        let input = EstimateInput {
            sample: history.last(),
            history: &history,
            bearing: None,
            cap_kmh: 250.0,
        };
        let (kmh, source) = est.estimate(&key(), input, t(20)).unwrap();
        assert_eq!(source, SpeedSource::SegmentMedian);
        assert!((kmh - 70.0).abs() < 1.0);
        assert!(est.filters().is_empty());
    }

    #[test]
    fn test_along_track_preferred_when_it_answers() {
        let mut est = estimator(vec![StrategyKind::AlongTrack, StrategyKind::SegmentMedian]);
        let mut history = Vec::new();
        let mut result = None;
        for i in 0..3 {
            history.push(east(70.0, i * 10));
            let input = EstimateInput {
                sample: history.last(),
                history: &history,
                bearing: Some(90.0),
                cap_kmh: 250.0,
            };
            result = est.estimate(&key(), input, t(i * 10));
        }
        assert_eq!(result.unwrap().1, SpeedSource::AlongTrack);
    }

    #[test]
    fn test_cached_estimate_reused_within_ttl() {
        let mut est = estimator(vec![StrategyKind::SegmentMedian]);
        let history: Vec<Sample> = (0..3).map(|i| east(70.0, i * 10)).collect();
        let input = EstimateInput {
            sample: history.last(),
            history: &history,
            bearing: None,
            cap_kmh: 250.0,
        };
        let (kmh, _) = est.estimate(&key(), input, t(20)).unwrap();

        let empty = EstimateInput {
            sample: None,
            history: &[],
            bearing: None,
            cap_kmh: 250.0,
        };
        assert_eq!(est.estimate(&key(), empty, t(100)), Some((kmh, SpeedSource::Cached)));
        assert_eq!(est.estimate(&key(), empty, t(111)), None);
    }

    #[test]
    fn test_evict_forgets_everything() {
        let mut est = estimator(vec![StrategyKind::AlongTrack]);
        let s = east(70.0, 0);
        let input = EstimateInput {
            sample: Some(&s),
            history: std::slice::from_ref(&s),
            bearing: Some(90.0),
            cap_kmh: 250.0,
        };
        est.estimate(&key(), input, t(0));
        assert!(est.tracks(&key()));
        est.evict(&key());
        assert!(!est.tracks(&key()));
    }
}
