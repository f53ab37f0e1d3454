//! Turns raw observations into display-ready train records.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::config::{SpeedConfig, TrackerConfig};
use crate::estimator::{EstimateInput, SpeedEstimator};
use crate::metadata::{Backfilled, MetadataCache, TrainMetadata};
use crate::model::{NormalizedTrain, Observation, Sample, SpeedSource, TrainKey};
use crate::quirks::QuirkTable;
use crate::samples::SampleStore;

/// Owns the per-train caches that survive across refresh cycles.
#[derive(Debug)]
pub struct Normalizer {
    quirks: QuirkTable,
    speed: SpeedConfig,
    samples: SampleStore,
    metadata: MetadataCache,
    estimator: SpeedEstimator,
}

/// Side information about one normalization, used for cycle statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    pub backfilled: Backfilled,
    pub recorded_sample: bool,
}

impl Normalizer {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            quirks: config.quirks.clone(),
            speed: config.speed.clone(),
            samples: SampleStore::new(config.samples.clone()),
            metadata: MetadataCache::new(config.metadata.ttl_secs),
            estimator: SpeedEstimator::new(
                config.speed.strategies.clone(),
                config.median.clone(),
                config.alpha_beta.clone(),
                config.speed.reuse_ttl_secs,
            ),
        }
    }

    pub fn normalize(&mut self, observation: &Observation, now: DateTime<Utc>) -> NormalizedTrain {
        self.normalize_with_outcome(observation, now).0
    }

    pub fn normalize_with_outcome(
        &mut self,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> (NormalizedTrain, NormalizeOutcome) {
        let mut obs = observation.clone();
        self.quirks.apply(&mut obs);

        let key = obs.key();
        let (metadata, backfilled) = self.metadata.resolve(
            &obs.train_number,
            TrainMetadata {
                product: obs.product.take(),
                destination: obs.destination.take(),
            },
            now,
        );

        let cap_kmh = self.speed.cap_for(metadata.product.as_deref());
        let reported_sample = obs.sample();
        let recorded = match reported_sample {
            Some(s) => self.samples.record(&key, s).map(|history| (s, history)),
            None => None,
        };
        if reported_sample.is_some() && recorded.is_none() {
            debug!(key = %key, "sample older than history ignored");
        }
        // out-of-order samples never reach the estimators
        let (sample, history): (Option<Sample>, &[Sample]) = match recorded {
            Some((s, history)) => (Some(s), history),
            None => (None, &[]),
        };

        let (speed, source) = match obs.reported_speed.filter(|s| s.is_finite()) {
            Some(reported) => (
                Some(reported.clamp(0.0, self.speed.global_max_kmh)),
                SpeedSource::Reported,
            ),
            None => {
                let input = EstimateInput {
                    sample: sample.as_ref(),
                    history,
                    bearing: obs.bearing,
                    cap_kmh,
                };
                match self.estimator.estimate(&key, input, now) {
                    Some((kmh, source)) => (Some(kmh), source),
                    None => (None, SpeedSource::None),
                }
            }
        };

        let record = NormalizedTrain {
            train_number: obs.train_number.clone(),
            key,
            latitude: obs.latitude,
            longitude: obs.longitude,
            bearing: obs.bearing.filter(|b| b.is_finite()),
            product: metadata.product,
            destination: metadata.destination,
            speed: speed.map(|s| s.min(self.speed.global_max_kmh)),
            is_estimated: source.is_estimate(),
            speed_source: source,
            timestamp: obs.timestamp,
            canceled: obs.canceled,
            active: obs.active,
        };

        (
            record,
            NormalizeOutcome {
                backfilled,
                recorded_sample: sample.is_some(),
            },
        )
    }

    /// Drops every per-key cache for a train that is no longer reported.
    pub fn evict(&mut self, key: &TrainKey) {
        self.samples.evict(key);
        self.estimator.evict(key);
    }

    /// Purges metadata for train numbers absent from the latest batch.
    pub fn sweep_metadata(&mut self, active_numbers: &HashSet<String>, now: DateTime<Utc>) {
        self.metadata.sweep(active_numbers, now);
    }

    /// Forgets all estimation state, keeping cached metadata.
    pub fn reset_estimation(&mut self) {
        self.samples.clear();
        self.estimator.clear();
    }

    /// Whether any per-key estimation state is held for `key`.
    pub fn tracks(&self, key: &TrainKey) -> bool {
        self.samples.contains(key) || self.estimator.tracks(key)
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn estimator(&self) -> &SpeedEstimator {
        &self.estimator
    }
}
