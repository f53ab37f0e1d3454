//! Drives refresh cycles: fixed-interval polling or a line-delimited stream.
//!
//! Exactly one cycle runs at a time. A slow fetch delays the next tick rather
//! than overlapping with it, and a failed cycle leaves the registry as it was.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

use crate::clock::Clock;
use crate::fetch::BatchSource;
use crate::output::RecordSink;
use crate::parser::{parse_batch, parse_line};
use crate::registry::{BatchDelta, Registry};
use crate::stats::CycleStats;

pub struct Poller {
    source: Box<dyn BatchSource>,
    registry: Registry,
    sinks: Vec<Box<dyn RecordSink>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        source: Box<dyn BatchSource>,
        registry: Registry,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            sinks: Vec::new(),
            clock,
            interval,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn into_registry(self) -> Registry {
        self.registry
    }

    /// Fetches, parses and applies one batch, then hands the result to every
    /// sink. On a fetch or parse error the registry is not touched.
    pub async fn run_cycle(&mut self) -> Result<CycleStats> {
        let source = self.source.describe();
        let span = tracing::info_span!("cycle", source = %source);

        let fetched = self.source.fetch().instrument(span.clone()).await;

        let _entered = span.enter();
        let now = self.clock.now();

        let parsed = match fetched {
            Ok(bytes) => {
                debug!(bytes = bytes.len(), "batch received, parsing");
                parse_batch(&bytes).map_err(|e| ("parse_error", e))
            }
            Err(e) => Err(("fetch_error", e)),
        };

        let observations = match parsed {
            Ok(observations) => observations,
            Err((kind, e)) => {
                error!(error = %e, kind, "cycle failed, keeping previous state");
                let stats = CycleStats::from_error(now, kind, &format!("{e:#}")).with_source(&source);
                for sink in &mut self.sinks {
                    if let Err(e) = sink.cycle_failed(&stats) {
                        warn!(error = %e, "sink failed to record cycle error");
                    }
                }
                return Err(e);
            }
        };

        let (delta, stats) = self.registry.apply_batch_with_stats(&observations, now);
        let stats = stats.with_source(&source);
        self.publish(&delta, &stats);
        Ok(stats)
    }

    /// Polls until `cycles` cycles have run (0 = forever) or `shutdown`
    /// resolves. Failed cycles are logged and skipped.
    pub async fn run(&mut self, cycles: usize, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut count = 0;
        loop {
            if cycles > 0 && count >= cycles {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            count += 1;
            // a failed cycle is already logged; the next tick proceeds normally
            let _ = self.run_cycle().await;
        }

        info!(cycles = count, trains = self.registry.len(), "polling stopped");
        Ok(())
    }

    fn publish(&mut self, delta: &BatchDelta, stats: &CycleStats) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.publish(&self.registry, delta, stats) {
                warn!(error = %e, "sink failed");
            }
        }
    }
}

/// Applies observations from an NDJSON stream as they arrive, evicting trains
/// that fall silent.
pub struct Streamer {
    registry: Registry,
    sinks: Vec<Box<dyn RecordSink>>,
    clock: Arc<dyn Clock>,
    sweep_every: Duration,
    pending: BatchDelta,
    stats: CycleStats,
}

impl Streamer {
    pub fn new(registry: Registry, clock: Arc<dyn Clock>, sweep_every: Duration) -> Self {
        let now = clock.now();
        Self {
            registry,
            sinks: Vec::new(),
            clock,
            sweep_every,
            pending: BatchDelta::default(),
            stats: CycleStats::new(now),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handles one stream line. Unparseable lines are logged and dropped.
    pub fn ingest_line(&mut self, line: &str) {
        let observations = match parse_line(line) {
            Ok(observations) => observations,
            Err(e) => {
                debug!(error = %e, "unreadable stream line dropped");
                return;
            }
        };

        let now = self.clock.now();
        for obs in &observations {
            if let Some(delta) = self.registry.apply_one_with_stats(obs, now, &mut self.stats) {
                for key in delta.added {
                    if !self.pending.added.contains(&key) {
                        self.pending.added.push(key);
                    }
                }
                for key in delta.updated {
                    if !self.pending.added.contains(&key) && !self.pending.updated.contains(&key) {
                        self.pending.updated.push(key);
                    }
                }
            }
        }
    }

    /// Evicts stale trains and publishes everything accumulated since the
    /// previous sweep.
    pub fn sweep(&mut self) {
        let now = self.clock.now();
        let removed = self.registry.evict_stale(now);

        let mut delta = std::mem::take(&mut self.pending);
        delta.added.retain(|k| !removed.contains(k));
        delta.updated.retain(|k| !removed.contains(k));
        delta.removed = removed;

        let mut stats = std::mem::replace(&mut self.stats, CycleStats::new(now));
        stats.timestamp = now;
        stats.record_delta(&delta, self.registry.len());

        for sink in &mut self.sinks {
            if let Err(e) = sink.publish(&self.registry, &delta, &stats) {
                warn!(error = %e, "sink failed");
            }
        }
    }

    /// Reads lines until the stream ends or `shutdown` resolves, sweeping on a
    /// fixed interval.
    pub async fn run<R>(&mut self, reader: R, shutdown: impl Future<Output = ()>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut ticker = tokio::time::interval(self.sweep_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => self.sweep(),
                line = lines.next_line() => match line? {
                    Some(line) => self.ingest_line(&line),
                    None => {
                        info!("stream ended");
                        break;
                    }
                },
            }
        }

        self.sweep();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TrackerConfig;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Serves queued payloads in order; an empty queue is a fetch error.
    struct ScriptedSource(Mutex<Vec<Result<Vec<u8>>>>);

    impl ScriptedSource {
        fn new(mut script: Vec<Result<Vec<u8>>>) -> Self {
            script.reverse();
            Self(Mutex::new(script))
        }
    }

    #[async_trait]
    impl BatchSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn fetch(&self) -> Result<Vec<u8>> {
            self.0
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    /// Records how many times each hook fired.
    #[derive(Default, Clone)]
    struct CountingSink(Arc<Mutex<(usize, usize)>>);

    impl RecordSink for CountingSink {
        fn publish(&mut self, _: &Registry, _: &BatchDelta, _: &CycleStats) -> Result<()> {
            self.0.lock().unwrap().0 += 1;
            Ok(())
        }

        fn cycle_failed(&mut self, _: &CycleStats) -> Result<()> {
            self.0.lock().unwrap().1 += 1;
            Ok(())
        }
    }

    /// Keeps the statistics of the most recent publish.
    #[derive(Default, Clone)]
    struct LastStats(Arc<Mutex<Option<CycleStats>>>);

    impl RecordSink for LastStats {
        fn publish(&mut self, _: &Registry, _: &BatchDelta, stats: &CycleStats) -> Result<()> {
            *self.0.lock().unwrap() = Some(stats.clone());
            Ok(())
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()))
    }

    fn batch(numbers: &[&str]) -> Vec<u8> {
        let items: Vec<String> = numbers
            .iter()
            .map(|n| {
                format!(
                    r#"{{"trainNumber": "{n}", "departureDate": "2024-06-01", "latitude": 59.0, "longitude": 18.0, "speed": 50}}"#
                )
            })
            .collect();
        format!("[{}]", items.join(",")).into_bytes()
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_previous_state() {
        let source = ScriptedSource::new(vec![Ok(batch(&["501", "502"])), Err(anyhow!("timeout"))]);
        let sink = CountingSink::default();
        let mut poller = Poller::new(
            Box::new(source),
            Registry::new(&TrackerConfig::default()),
            clock(),
            Duration::from_millis(1),
        )
        .with_sink(Box::new(sink.clone()));

        let stats = poller.run_cycle().await.unwrap();
        assert_eq!(stats.added, 2);
        assert!(poller.run_cycle().await.is_err());
        assert_eq!(poller.registry().len(), 2);
        assert_eq!(*sink.0.lock().unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_unparseable_payload_fails_cycle() {
        let source = ScriptedSource::new(vec![Ok(b"<html>".to_vec())]);
        let mut poller = Poller::new(
            Box::new(source),
            Registry::new(&TrackerConfig::default()),
            clock(),
            Duration::from_millis(1),
        );
        assert!(poller.run_cycle().await.is_err());
        assert!(poller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_after_cycle_limit() {
        let source = ScriptedSource::new(vec![Ok(batch(&["501", "502"])), Ok(batch(&["501"]))]);
        let clock = clock();
        let mut poller = Poller::new(
            Box::new(source),
            Registry::new(&TrackerConfig::default()),
            clock,
            Duration::from_millis(1),
        );
        poller.run(2, std::future::pending()).await.unwrap();
        assert_eq!(poller.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_run_survives_failures() {
        let source = ScriptedSource::new(vec![Err(anyhow!("down")), Ok(batch(&["501"]))]);
        let mut poller = Poller::new(
            Box::new(source),
            Registry::new(&TrackerConfig::default()),
            clock(),
            Duration::from_millis(1),
        );
        poller.run(2, std::future::pending()).await.unwrap();
        assert_eq!(poller.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_evicts_silent_trains() {
        let clock = clock();
        let sink = CountingSink::default();
        let mut streamer = Streamer::new(
            Registry::new(&TrackerConfig::default()),
            clock.clone(),
            Duration::from_secs(30),
        )
        .with_sink(Box::new(sink.clone()));

        streamer.ingest_line(r#"{"trainNumber": "501", "latitude": 59.0, "longitude": 18.0}"#);
        clock.advance(chrono::Duration::seconds(100));
        streamer.ingest_line(r#"{"trainNumber": "502", "latitude": 59.1, "longitude": 18.1}"#);
        streamer.ingest_line("not json");
        streamer.sweep();
        assert_eq!(streamer.registry().len(), 2);

        clock.advance(chrono::Duration::seconds(30));
        streamer.sweep();
        assert_eq!(streamer.registry().len(), 1);
        assert_eq!(sink.0.lock().unwrap().0, 2);
    }

    #[tokio::test]
    async fn test_stream_sweep_reports_speed_sources() {
        let sink = LastStats::default();
        let mut streamer = Streamer::new(
            Registry::new(&TrackerConfig::default()),
            clock(),
            Duration::from_secs(30),
        )
        .with_sink(Box::new(sink.clone()));

        streamer.ingest_line(r#"{"trainNumber": "501", "latitude": 59.0, "longitude": 18.0, "speed": 80}"#);
        streamer.ingest_line(r#"{"trainNumber": "502", "latitude": 59.1, "longitude": 18.1, "speed": 90}"#);
        streamer.ingest_line(r#"{"trainNumber": "503", "latitude": 59.2, "longitude": 18.2}"#);
        streamer.ingest_line(r#"{"trainNumber": "", "latitude": 59.2, "longitude": 18.2}"#);
        streamer.sweep();

        let stats = sink.0.lock().unwrap().clone().unwrap();
        assert_eq!(stats.observations, 4);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.trains, 3);
        assert_eq!(stats.added, 3);
        assert_eq!(stats.reported_speed, 2);
        assert_eq!(stats.without_speed, 1);

        // counters start over after each sweep
        streamer.sweep();
        let stats = sink.0.lock().unwrap().clone().unwrap();
        assert_eq!((stats.observations, stats.reported_speed), (0, 0));
    }

    #[tokio::test]
    async fn test_stream_run_reads_until_eof() {
        let input = concat!(
            r#"{"trainNumber": "501", "latitude": 59.0, "longitude": 18.0}"#,
            "\n",
            r#"[{"trainNumber": "502", "latitude": 59.0, "longitude": 18.0}, {"trainNumber": ""}]"#,
            "\n"
        );
        let mut streamer = Streamer::new(
            Registry::new(&TrackerConfig::default()),
            clock(),
            Duration::from_secs(30),
        );
        streamer
            .run(tokio::io::BufReader::new(input.as_bytes()), std::future::pending())
            .await
            .unwrap();
        assert_eq!(streamer.registry().len(), 2);
    }
}
