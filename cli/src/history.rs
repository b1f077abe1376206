//! Sample history for offline commands
//!
//! Buffers live in memory, so `export` and `replay` first load history into
//! a local engine: either a CSV recording (any file with `timestamp_ms`,
//! `channel` and `value` columns, including plantctl's own exports) or a
//! seeded simulation of the configured plant.

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Deserialize;

use plantwatch_engine::ingestion::{SimulatedSource, Source};
use plantwatch_engine::model::now_millis;
use plantwatch_engine::{Sample, TelemetryEngine};

use crate::error::{CliError, Result};

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    /// CSV recording to load (columns: timestamp_ms, channel, value)
    #[arg(short, long, conflicts_with = "simulate")]
    pub input: Option<PathBuf>,

    /// Simulate this many sampling ticks ending now
    #[arg(long)]
    pub simulate: Option<usize>,

    /// Seed for the simulation (defaults to the settings seed)
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RecordedSample {
    timestamp_ms: i64,
    channel: String,
    value: f64,
}

/// Summary of what was loaded
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LoadReport {
    pub accepted: usize,
    pub rejected: usize,
}

pub async fn load(engine: &TelemetryEngine, args: &HistoryArgs, default_seed: u64) -> Result<LoadReport> {
    let report = match (&args.input, args.simulate) {
        (Some(path), _) => load_recording(engine, path)?,
        (None, Some(ticks)) => simulate(engine, ticks, args.seed.unwrap_or(default_seed)).await,
        (None, None) => return Err(CliError::NoHistory),
    };

    if report.accepted == 0 {
        return Err(CliError::NoHistory);
    }
    tracing::info!(accepted = report.accepted, rejected = report.rejected, "History loaded");
    Ok(report)
}

/// Ingest a CSV recording; rows are sorted by timestamp first
pub fn load_recording(engine: &TelemetryEngine, path: &Path) -> Result<LoadReport> {
    if !path.exists() {
        return Err(CliError::FileNotFound {
            path: path.to_string_lossy().to_string(),
        });
    }

    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        let row: RecordedSample = row?;
        rows.push(row);
    }
    rows.sort_by_key(|row| row.timestamp_ms);

    let mut report = LoadReport::default();
    for row in rows {
        if engine.ingest(Sample::new(row.channel, row.timestamp_ms, row.value)).is_accepted() {
            report.accepted += 1;
        } else {
            report.rejected += 1;
        }
    }
    Ok(report)
}

/// Generate `ticks` sampling intervals of simulated readings ending now
pub async fn simulate(engine: &TelemetryEngine, ticks: usize, seed: u64) -> LoadReport {
    let interval = engine.sampling_interval_ms() as i64;
    let start = now_millis() - interval * ticks as i64;
    let channels: Vec<_> = engine.registry().iter().cloned().collect();
    let mut source = SimulatedSource::new(seed);

    let mut report = LoadReport::default();
    for tick in 0..ticks as i64 {
        let at = start + tick * interval;
        for channel in &channels {
            if let Some(sample) = source.next_sample(channel, at).await {
                if engine.ingest(sample).is_accepted() {
                    report.accepted += 1;
                } else {
                    report.rejected += 1;
                }
            }
        }
    }
    report
}

/// Parse epoch milliseconds or an RFC 3339 timestamp
pub fn parse_time(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|at| at.timestamp_millis())
        .map_err(|_| CliError::InvalidTimeRange(format!("cannot parse '{}'", raw)))
}

/// Resolve an optional `[from, to]` pair against the buffered span
pub fn resolve_window(engine: &TelemetryEngine, from: Option<&str>, to: Option<&str>) -> Result<(i64, i64)> {
    let span = engine.time_span();
    let from = match from {
        Some(raw) => parse_time(raw)?,
        None => span.map(|(start, _)| start).ok_or(CliError::NoHistory)?,
    };
    let to = match to {
        Some(raw) => parse_time(raw)?,
        None => span.map(|(_, end)| end).ok_or(CliError::NoHistory)?,
    };
    if from > to {
        return Err(CliError::InvalidTimeRange(format!("{} is after {}", from, to)));
    }
    Ok((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plantwatch_engine::EngineConfig;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> TelemetryEngine {
        let mut config = EngineConfig::default();
        config.persistence.state_dir = dir.path().to_path_buf();
        config.metrics.enabled = false;
        TelemetryEngine::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_load_recording_sorts_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recording.csv");
        std::fs::write(
            &path,
            "timestamp_ms,channel,value\n3000,oxygen_level,3.1\n1000,oxygen_level,3.4\n2000,humidity,40\n",
        )
        .unwrap();

        let engine = engine(&dir);
        let report = load_recording(&engine, &path).unwrap();
        assert_eq!(report, LoadReport { accepted: 2, rejected: 1 });
        assert_eq!(engine.get_latest("oxygen_level").unwrap().unwrap().timestamp_ms, 3000);
    }

    #[tokio::test]
    async fn test_simulation_fills_every_channel() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let report = simulate(&engine, 10, 3).await;
        assert_eq!(report.accepted, 50);
        for channel in engine.registry().ids() {
            assert_eq!(engine.get_window(&channel, i64::MIN, i64::MAX).unwrap().len(), 10);
        }
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1500").unwrap(), 1500);
        assert_eq!(parse_time("1970-01-01T00:00:02Z").unwrap(), 2000);
        assert!(matches!(parse_time("yesterday"), Err(CliError::InvalidTimeRange(_))));
    }

    #[tokio::test]
    async fn test_resolve_window_defaults_to_buffered_span() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.ingest(Sample::new("oxygen_level", 1_000, 3.0));
        engine.ingest(Sample::new("kiln_temperature", 4_000, 1450.0));

        assert_eq!(resolve_window(&engine, None, None).unwrap(), (1_000, 4_000));
        assert_eq!(resolve_window(&engine, Some("2000"), None).unwrap(), (2_000, 4_000));
        assert!(resolve_window(&engine, Some("5000"), Some("10")).is_err());
    }

    #[tokio::test]
    async fn test_nothing_requested() {
        let dir = TempDir::new().unwrap();
        let args = HistoryArgs {
            input: None,
            simulate: None,
            seed: None,
        };
        assert!(matches!(load(&engine(&dir), &args, 7).await, Err(CliError::NoHistory)));
    }
}
