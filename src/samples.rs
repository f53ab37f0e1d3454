//! Bounded per-train position history.

use std::collections::{HashMap, VecDeque};

use crate::config::SampleConfig;
use crate::model::{Sample, TrainKey, elapsed_secs};

/// Recent samples for every tracked train, trimmed by count and age on insert.
#[derive(Debug, Default)]
pub struct SampleStore {
    histories: HashMap<TrainKey, VecDeque<Sample>>,
    config: SampleConfig,
}

impl SampleStore {
    pub fn new(config: SampleConfig) -> Self {
        Self {
            histories: HashMap::new(),
            config,
        }
    }

    /// Appends `sample` to the key's history and returns the retained samples,
    /// oldest first.
    ///
    /// A sample carrying the same timestamp as the newest one replaces it. A
    /// sample older than the newest one is ignored and `None` is returned.
    pub fn record(&mut self, key: &TrainKey, sample: Sample) -> Option<&[Sample]> {
        let history = self.histories.entry(key.clone()).or_default();

        match history.back() {
            Some(last) if sample.timestamp == last.timestamp => {
                history.pop_back();
                history.push_back(sample);
            }
            Some(last) if sample.timestamp < last.timestamp => return None,
            _ => history.push_back(sample),
        }

        let newest = history.back().map(|s| s.timestamp).unwrap_or(sample.timestamp);
        let max_age = self.config.window_secs + self.config.slack_secs;
        while history
            .front()
            .map(|s| elapsed_secs(s.timestamp, newest) > max_age)
            .unwrap_or(false)
        {
            history.pop_front();
        }

        while history.len() > self.config.max_count.max(1) {
            history.pop_front();
        }

        Some(history.make_contiguous())
    }

    pub fn history(&self, key: &TrainKey) -> Option<&VecDeque<Sample>> {
        self.histories.get(key)
    }

    pub fn contains(&self, key: &TrainKey) -> bool {
        self.histories.contains_key(key)
    }

    pub fn evict(&mut self, key: &TrainKey) {
        self.histories.remove(key);
    }

    pub fn clear(&mut self) {
        self.histories.clear();
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}
