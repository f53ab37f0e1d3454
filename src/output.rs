//! Where normalized state goes after each cycle.
//!
//! Supports structured log lines, a JSON snapshot of the current records,
//! and CSV append of cycle statistics.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::registry::{BatchDelta, Registry};
use crate::stats::CycleStats;
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Receives the registry state after each completed cycle.
pub trait RecordSink: Send {
    fn publish(&mut self, registry: &Registry, delta: &BatchDelta, stats: &CycleStats) -> Result<()>;

    /// Called instead of `publish` when a cycle could not fetch or parse.
    fn cycle_failed(&mut self, _stats: &CycleStats) -> Result<()> {
        Ok(())
    }
}

/// Logs a one-line cycle summary, plus each removed key at debug level.
#[derive(Debug, Default)]
pub struct LogSink;

impl RecordSink for LogSink {
    fn publish(&mut self, registry: &Registry, delta: &BatchDelta, stats: &CycleStats) -> Result<()> {
        for key in &delta.removed {
            debug!(key = %key, "train removed");
        }
        info!(
            trains = registry.len(),
            added = delta.added.len(),
            updated = delta.updated.len(),
            removed = delta.removed.len(),
            malformed = stats.malformed,
            estimated_pct = stats.estimated_pct(),
            "cycle complete"
        );
        Ok(())
    }
}

/// Rewrites a JSON file with every current record after each cycle.
#[derive(Debug)]
pub struct SnapshotSink {
    path: PathBuf,
}

impl SnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Serialize)]
struct Snapshot<'a, R: Serialize> {
    generated_at: chrono::DateTime<chrono::Utc>,
    delta: &'a BatchDelta,
    trains: R,
}

impl RecordSink for SnapshotSink {
    fn publish(&mut self, registry: &Registry, delta: &BatchDelta, stats: &CycleStats) -> Result<()> {
        let snapshot = Snapshot {
            generated_at: stats.timestamp,
            delta,
            trains: registry.records(),
        };
        write_json_atomic(&self.path, &snapshot)
    }
}

/// Appends each cycle's [`CycleStats`] to a CSV file.
#[derive(Debug)]
pub struct StatsCsvSink {
    path: String,
}

impl StatsCsvSink {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

impl RecordSink for StatsCsvSink {
    fn publish(&mut self, _registry: &Registry, _delta: &BatchDelta, stats: &CycleStats) -> Result<()> {
        append_record(&self.path, stats)
    }

    fn cycle_failed(&mut self, stats: &CycleStats) -> Result<()> {
        append_record(&self.path, stats)
    }
}

/// Writes `value` as JSON next to `path` and renames it into place, so
/// readers never see a half-written file.
pub fn write_json_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(value)?)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "snapshot written");
    Ok(())
}

/// Appends a serializable record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, record: &impl Serialize) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::model::Observation;
    use chrono::Utc;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    fn registry_with_one_train() -> (Registry, BatchDelta, CycleStats) {
        let mut registry = Registry::new(&TrackerConfig::default());
        let obs = Observation {
            train_number: "501".into(),
            departure_date: Some("2024-06-01".into()),
            latitude: 59.0,
            longitude: 18.0,
            reported_speed: Some(90.0),
            timestamp: Some(Utc::now()),
            active: true,
            ..Default::default()
        };
        let (delta, stats) = registry.apply_batch_with_stats(&[obs], Utc::now());
        (registry, delta, stats)
    }

    #[test]
    fn test_log_sink_does_not_panic() {
        let (registry, delta, stats) = registry_with_one_train();
        LogSink.publish(&registry, &delta, &stats).unwrap();
    }

    #[test]
    fn test_snapshot_sink_writes_records() {
        let path = temp_path("train_tracker_test_snapshot.json");
        let _ = fs::remove_file(&path);

        let (registry, delta, stats) = registry_with_one_train();
        SnapshotSink::new(&path).publish(&registry, &delta, &stats).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["trains"][0]["key"], "2024-06-01_501");
        assert_eq!(value["trains"][0]["speedSource"], "reported");
        assert_eq!(value["delta"]["added"][0], "2024-06-01_501");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_creates_file() {
        let path = temp_path("train_tracker_test_create.csv");
        let _ = fs::remove_file(&path); // clean up any prior run

        let stats = CycleStats::default();
        append_record(&path, &stats).unwrap();

        assert!(Path::new(&path).exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.is_empty());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_stats_sink_writes_header_once() {
        let path = temp_path("train_tracker_test_header.csv");
        let _ = fs::remove_file(&path);

        let (registry, delta, stats) = registry_with_one_train();
        let mut sink = StatsCsvSink::new(&path);
        sink.publish(&registry, &delta, &stats).unwrap();
        sink.publish(&registry, &delta, &stats).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);
        // 1 header + 2 data rows
        assert_eq!(content.lines().count(), 3);

        fs::remove_file(&path).unwrap();
    }
}
