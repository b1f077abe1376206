//! Window export
//!
//! Pure read/transform of buffered samples into CSV or JSON bytes. Rows are
//! grouped by channel in the requested order, time-ascending within each
//! channel.

use std::fmt;
use std::str::FromStr;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferStore;
use crate::error::{ExportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(ExportError::UnsupportedFormat { format: s.to_string() }),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Csv => f.write_str("csv"),
            ExportFormat::Json => f.write_str("json"),
        }
    }
}

/// One exported reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub timestamp_ms: i64,
    pub timestamp: String,
    pub channel: String,
    pub value: f64,
    pub unit: String,
    pub flagged: bool,
}

/// Collect the rows for `[from_ms, to_ms]` across `channel_ids`
pub fn collect_rows(buffers: &BufferStore, channel_ids: &[String], from_ms: i64, to_ms: i64) -> Result<Vec<ExportRow>> {
    if from_ms > to_ms {
        return Err(ExportError::InvalidWindow { from_ms, to_ms }.into());
    }

    let mut rows = Vec::new();
    for channel_id in channel_ids {
        let unit = buffers
            .registry()
            .get(channel_id)
            .map(|channel| channel.display_unit.clone())
            .unwrap_or_default();

        for stored in buffers.window_stored(channel_id, from_ms, to_ms)? {
            rows.push(ExportRow {
                timestamp_ms: stored.sample.timestamp_ms,
                timestamp: stored.sample.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true),
                channel: stored.sample.channel_id,
                value: stored.sample.value,
                unit: unit.clone(),
                flagged: stored.out_of_range,
            });
        }
    }
    Ok(rows)
}

/// Encode a buffered window as CSV or JSON
pub fn export_window(
    buffers: &BufferStore,
    channel_ids: &[String],
    from_ms: i64,
    to_ms: i64,
    format: ExportFormat,
) -> Result<Vec<u8>> {
    let rows = collect_rows(buffers, channel_ids, from_ms, to_ms)?;
    tracing::debug!(rows = rows.len(), format = %format, "Exporting window");

    let bytes = match format {
        ExportFormat::Csv => encode_csv(&rows)?,
        ExportFormat::Json => serde_json::to_vec_pretty(&rows).map_err(ExportError::from)?,
    };
    Ok(bytes)
}

fn encode_csv(rows: &[ExportRow]) -> std::result::Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(["timestamp_ms", "timestamp", "channel", "value", "unit", "flagged"])?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| ExportError::Csv(csv::Error::from(e.into_error())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::channel::ChannelRegistry;
    use crate::error::EngineError;
    use crate::model::Sample;

    fn store() -> BufferStore {
        let store = BufferStore::new(Arc::new(ChannelRegistry::kiln_plant()), 10, &HashMap::new(), None).unwrap();
        store.append(Sample::new("kiln_temperature", 1_000, 1450.5)).unwrap();
        store.append(Sample::new("kiln_temperature", 2_000, 1451.0)).unwrap();
        store.append(Sample::new("oxygen_level", 1_500, 30.0)).unwrap();
        store.append(Sample::new("oxygen_level", 9_000, 3.0)).unwrap();
        store
    }

    #[test]
    fn test_csv_export() {
        let store = store();
        let channels = vec!["oxygen_level".to_string(), "kiln_temperature".to_string()];
        let bytes = export_window(&store, &channels, 0, 5_000, ExportFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "timestamp_ms,timestamp,channel,value,unit,flagged");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "1500,1970-01-01T00:00:01.500Z,oxygen_level,30.0,%,true");
        assert!(lines[2].starts_with("1000,"));
        assert!(lines[3].ends_with("kiln_temperature,1451.0,°C,false"));
    }

    #[test]
    fn test_json_export() {
        let store = store();
        let bytes = export_window(&store, &["kiln_temperature".to_string()], 1_500, 2_000, ExportFormat::Json).unwrap();
        let rows: Vec<ExportRow> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp_ms, 2_000);
        assert_eq!(rows[0].unit, "°C");
    }

    #[test]
    fn test_export_errors() {
        let store = store();
        assert!("parquet".parse::<ExportFormat>().is_err());
        assert!(matches!(
            export_window(&store, &[], 10, 0, ExportFormat::Csv),
            Err(EngineError::Export(ExportError::InvalidWindow { .. }))
        ));
        assert!(matches!(
            export_window(&store, &["humidity".to_string()], 0, 10, ExportFormat::Json),
            Err(EngineError::Buffer(_))
        ));
    }
}
