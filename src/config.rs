//! Tunable constants for the tracker, loadable from a JSON file.
//!
//! Every field has a default, so a config file only needs to list the values
//! it changes:
//! ```json
//! {
//!   "speed": { "globalMaxKmh": 220, "reuseTtlSecs": 60 },
//!   "metadata": { "ttlSecs": 900 }
//! }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

use crate::estimator::StrategyKind;
use crate::quirks::QuirkTable;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    pub samples: SampleConfig,
    pub metadata: MetadataConfig,
    pub median: MedianConfig,
    pub alpha_beta: AlphaBetaConfig,
    pub speed: SpeedConfig,
    pub quirks: QuirkTable,
    pub registry: RegistryConfig,
}

impl TrackerConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        Self::from_json(&content).with_context(|| format!("parsing config {path}"))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Bounds applied to each per-train sample history.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SampleConfig {
    pub max_count: usize,
    pub window_secs: f64,
    pub slack_secs: f64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            max_count: 8,
            window_secs: 90.0,
            slack_secs: 90.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetadataConfig {
    pub ttl_secs: f64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self { ttl_secs: 30.0 * 60.0 }
    }
}

/// Segment-median estimator parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MedianConfig {
    pub window_secs: f64,
    pub min_samples: usize,
    pub min_segment_secs: f64,
    pub min_segment_meters: f64,
    /// Segment speeds below this are treated as standing still.
    pub floor_kmh: f64,
    /// Segment speeds above this are discarded outright.
    pub hard_gate_kmh: f64,
    /// Minimum number of segment speeds before the fastest decile is dropped.
    pub trim_min_count: usize,
    pub min_values: usize,
}

impl Default for MedianConfig {
    fn default() -> Self {
        Self {
            window_secs: 90.0,
            min_samples: 3,
            min_segment_secs: 3.0,
            min_segment_meters: 5.0,
            floor_kmh: 2.0,
            hard_gate_kmh: 400.0,
            trim_min_count: 5,
            min_values: 2,
        }
    }
}

/// Correction gains for one speed bucket.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Gains {
    pub alpha: f64,
    pub beta: f64,
}

/// Along-track alpha-beta filter parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlphaBetaConfig {
    pub min_dt_secs: f64,
    pub max_dt_secs: f64,
    pub min_displacement_meters: f64,
    pub max_speed_kmh: f64,
    /// Predicted speeds below this use `low_gains`.
    pub low_speed_kmh: f64,
    /// Predicted speeds at or above this use `high_gains`.
    pub high_speed_kmh: f64,
    pub low_gains: Gains,
    pub medium_gains: Gains,
    pub high_gains: Gains,
}

impl Default for AlphaBetaConfig {
    fn default() -> Self {
        Self {
            min_dt_secs: 1.0,
            max_dt_secs: 120.0,
            min_displacement_meters: 3.0,
            max_speed_kmh: 350.0,
            low_speed_kmh: 40.0,
            high_speed_kmh: 90.0,
            low_gains: Gains {
                alpha: 0.5,
                beta: 0.1,
            },
            medium_gains: Gains {
                alpha: 0.6,
                beta: 0.12,
            },
            high_gains: Gains {
                alpha: 0.7,
                beta: 0.15,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpeedConfig {
    pub global_max_kmh: f64,
    /// Per-product caps, matched against the resolved product name.
    pub product_caps_kmh: HashMap<String, f64>,
    /// How long a previous estimate may stand in when every strategy fails.
    pub reuse_ttl_secs: f64,
    /// Estimators tried in order when no speed is reported.
    pub strategies: Vec<StrategyKind>,
}

impl SpeedConfig {
    /// Cap for a product, never above the global maximum.
    pub fn cap_for(&self, product: Option<&str>) -> f64 {
        product
            .and_then(|p| self.product_caps_kmh.get(p))
            .map(|cap| cap.min(self.global_max_kmh))
            .unwrap_or(self.global_max_kmh)
    }
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            global_max_kmh: 250.0,
            product_caps_kmh: HashMap::from([
                ("Pendeltåg".to_string(), 160.0),
                ("Regionaltåg".to_string(), 200.0),
                ("Godståg".to_string(), 120.0),
            ]),
            reuse_ttl_secs: 90.0,
            strategies: vec![StrategyKind::AlongTrack, StrategyKind::SegmentMedian],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Streaming mode drops trains not heard from within this long.
    pub stale_after_secs: f64,
    /// Backward clock jumps larger than this reset estimation state.
    pub clock_skew_tolerance_secs: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 120.0,
            clock_skew_tolerance_secs: 5.0,
        }
    }
}
