//! Current world state: the latest record for every reported train.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::{RegistryConfig, TrackerConfig};
use crate::geo::is_valid_position;
use crate::model::{NormalizedTrain, Observation, TrainKey, elapsed_secs};
use crate::normalizer::Normalizer;
use crate::stats::CycleStats;

/// Keys that changed during one cycle, for the rendering side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchDelta {
    pub added: Vec<TrainKey>,
    pub updated: Vec<TrainKey>,
    pub removed: Vec<TrainKey>,
}

impl BatchDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
struct Entry {
    record: NormalizedTrain,
    last_seen: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Registry {
    entries: HashMap<TrainKey, Entry>,
    normalizer: Normalizer,
    config: RegistryConfig,
    last_now: Option<DateTime<Utc>>,
}

impl Registry {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            entries: HashMap::new(),
            normalizer: Normalizer::new(config),
            config: config.registry.clone(),
            last_now: None,
        }
    }

    /// Applies a full snapshot: every train not in `observations` is evicted.
    pub fn apply_batch(&mut self, observations: &[Observation], now: DateTime<Utc>) -> BatchDelta {
        self.apply_batch_with_stats(observations, now).0
    }

    pub fn apply_batch_with_stats(
        &mut self,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> (BatchDelta, CycleStats) {
        self.check_clock(now);

        let mut stats = CycleStats::new(now);
        stats.observations = observations.len();

        let batch = dedupe(observations, &mut stats);

        let mut delta = BatchDelta::default();
        let mut seen = HashSet::with_capacity(batch.len());
        let mut active_numbers = HashSet::with_capacity(batch.len());

        for obs in batch {
            let key = obs.key();
            active_numbers.insert(key.train_number.clone());
            seen.insert(key.clone());
            self.upsert(obs, now, &mut delta, &mut stats);
        }

        let gone: Vec<TrainKey> = self
            .entries
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for key in gone {
            self.evict(&key);
            delta.removed.push(key);
        }

        self.normalizer.sweep_metadata(&active_numbers, now);

        delta.added.sort();
        delta.updated.sort();
        delta.removed.sort();
        stats.record_delta(&delta, self.entries.len());

        debug!(
            added = delta.added.len(),
            updated = delta.updated.len(),
            removed = delta.removed.len(),
            trains = self.entries.len(),
            "batch applied"
        );

        (delta, stats)
    }

    /// Upserts a single streamed observation without evicting anything.
    /// Returns `None` when the observation is malformed.
    pub fn apply_one(&mut self, observation: &Observation, now: DateTime<Utc>) -> Option<BatchDelta> {
        self.apply_one_with_stats(observation, now, &mut CycleStats::new(now))
    }

    /// Like [`Registry::apply_one`], counting the record into `stats`.
    pub fn apply_one_with_stats(
        &mut self,
        observation: &Observation,
        now: DateTime<Utc>,
        stats: &mut CycleStats,
    ) -> Option<BatchDelta> {
        stats.observations += 1;
        if !is_well_formed(observation) {
            stats.malformed += 1;
            return None;
        }
        self.check_clock(now);

        let mut delta = BatchDelta::default();
        self.upsert(observation, now, &mut delta, stats);
        Some(delta)
    }

    /// Evicts trains whose last report is older than the configured
    /// staleness limit. Returns the removed keys.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> Vec<TrainKey> {
        let limit = self.config.stale_after_secs;
        let mut stale: Vec<TrainKey> = self
            .entries
            .iter()
            .filter(|(_, e)| elapsed_secs(e.last_seen, now) > limit)
            .map(|(k, _)| k.clone())
            .collect();
        stale.sort();

        for key in &stale {
            self.evict(key);
        }

        if !stale.is_empty() {
            let active_numbers: HashSet<String> = self
                .entries
                .keys()
                .map(|k| k.train_number.clone())
                .collect();
            self.normalizer.sweep_metadata(&active_numbers, now);
            info!(removed = stale.len(), trains = self.entries.len(), "stale trains evicted");
        }

        stale
    }

    pub fn get(&self, key: &TrainKey) -> Option<&NormalizedTrain> {
        self.entries.get(key).map(|e| &e.record)
    }

    pub fn contains(&self, key: &TrainKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Current records, ordered by key.
    pub fn records(&self) -> Vec<&NormalizedTrain> {
        let mut records: Vec<_> = self.entries.values().map(|e| &e.record).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    fn upsert(
        &mut self,
        observation: &Observation,
        now: DateTime<Utc>,
        delta: &mut BatchDelta,
        stats: &mut CycleStats,
    ) {
        let (record, outcome) = self.normalizer.normalize_with_outcome(observation, now);
        stats.record_train(&record, outcome);

        let key = record.key.clone();
        match self.entries.insert(
            key.clone(),
            Entry {
                record,
                last_seen: now,
            },
        ) {
            Some(_) => delta.updated.push(key),
            None => delta.added.push(key),
        }
    }

    fn evict(&mut self, key: &TrainKey) {
        self.entries.remove(key);
        self.normalizer.evict(key);
        debug!(key = %key, "train evicted");
    }

    /// Resets estimation state when the clock moves backwards noticeably;
    /// elapsed-time filters cannot make sense of negative intervals.
    fn check_clock(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_now {
            let drift = elapsed_secs(last, now);
            if drift < -self.config.clock_skew_tolerance_secs {
                warn!(
                    drift_secs = drift,
                    "clock moved backwards, resetting estimation state"
                );
                self.normalizer.reset_estimation();
            }
        }
        self.last_now = Some(now);
    }
}

/// A record needs an identity and a usable position to be tracked at all.
pub fn is_well_formed(observation: &Observation) -> bool {
    !observation.train_number.trim().is_empty()
        && is_valid_position(observation.latitude, observation.longitude)
}

/// Drops malformed observations and keeps only the last one per key, in the
/// order each key first appeared.
fn dedupe<'a>(observations: &'a [Observation], stats: &mut CycleStats) -> Vec<&'a Observation> {
    let mut index: HashMap<TrainKey, usize> = HashMap::new();
    let mut batch: Vec<&Observation> = Vec::with_capacity(observations.len());

    for obs in observations {
        if !is_well_formed(obs) {
            stats.malformed += 1;
            continue;
        }
        match index.get(&obs.key()) {
            Some(&i) => {
                stats.duplicates += 1;
                batch[i] = obs;
            }
            None => {
                index.insert(obs.key(), batch.len());
                batch.push(obs);
            }
        }
    }

    batch
}
