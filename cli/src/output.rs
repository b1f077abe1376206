use console::{style, Style};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use plantwatch_engine::replay::Frame;
use plantwatch_engine::{AnomalyEvent, CalibrationRecord, CalibrationStatus, Severity, ThresholdRule};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Raw,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "table" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            "raw" => Ok(OutputFormat::Raw),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

pub struct OutputManager {
    format: OutputFormat,
    colored: bool,
}

impl OutputManager {
    pub fn new(format: OutputFormat, colored: bool) -> Self {
        Self { format, colored }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn print_rules(&self, rules: &[ThresholdRule]) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(&rules)?,
            OutputFormat::Table => {
                if rules.is_empty() {
                    println!("No rules defined");
                    return Ok(());
                }
                self.header(&format!(
                    "{:<8} {:<20} {:<36} {:<9} {}",
                    "ID", "CHANNEL", "CONDITION", "SEVERITY", "ENABLED"
                ));
                for rule in rules {
                    println!(
                        "{:<8} {:<20} {:<36} {:<9} {}",
                        rule.id.to_string(),
                        rule.channel_id,
                        rule.summary(),
                        self.severity(rule.severity),
                        if rule.enabled { "yes" } else { "no" }
                    );
                }
            }
            OutputFormat::Csv => {
                let mut writer = csv::Writer::from_writer(std::io::stdout());
                writer.write_record(["id", "channel", "condition", "value", "max_value", "severity", "enabled"])?;
                for rule in rules {
                    writer.write_record([
                        rule.id.to_string(),
                        rule.channel_id.clone(),
                        format!("{:?}", rule.condition).to_lowercase(),
                        rule.value.to_string(),
                        rule.max_value.map(|v| v.to_string()).unwrap_or_default(),
                        rule.severity.to_string(),
                        rule.enabled.to_string(),
                    ])?;
                }
                writer.flush()?;
            }
            OutputFormat::Raw => {
                for rule in rules {
                    println!("{} {} {}", rule.id, rule.channel_id, rule.summary());
                }
            }
        }
        Ok(())
    }

    pub fn print_calibrations(&self, records: &[CalibrationRecord]) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(&records)?,
            OutputFormat::Table => {
                self.header(&format!(
                    "{:<20} {:<8} {:>9} {:>8}  {}",
                    "SENSOR", "STATUS", "ACCURACY", "DRIFT", "LAST CALIBRATED"
                ));
                for record in records {
                    println!(
                        "{:<20} {:<8} {:>8.2}% {:>7.2}%  {}",
                        record.sensor_id,
                        self.calibration_status(record.status),
                        record.accuracy_percent,
                        record.drift_percent,
                        record
                            .last_calibrated_at
                            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                            .unwrap_or_else(|| "never".to_string())
                    );
                }
            }
            OutputFormat::Csv => {
                let mut writer = csv::Writer::from_writer(std::io::stdout());
                writer.write_record(["sensor", "status", "accuracy_percent", "drift_percent", "last_calibrated_at"])?;
                for record in records {
                    writer.write_record([
                        record.sensor_id.clone(),
                        record.status.as_str().to_string(),
                        record.accuracy_percent.to_string(),
                        record.drift_percent.to_string(),
                        record.last_calibrated_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
                    ])?;
                }
                writer.flush()?;
            }
            OutputFormat::Raw => {
                for record in records {
                    println!(
                        "{} {} drift={:.2}% accuracy={:.2}%",
                        record.sensor_id,
                        record.status.as_str(),
                        record.drift_percent,
                        record.accuracy_percent
                    );
                }
            }
        }
        Ok(())
    }

    pub fn print_alerts(&self, alerts: &[AnomalyEvent]) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(&alerts)?,
            _ => {
                for alert in alerts {
                    println!(
                        "{} [{}] {} {}",
                        alert.timestamp().format("%Y-%m-%d %H:%M:%S%.3f"),
                        self.severity(alert.severity),
                        alert.channel_id,
                        alert.description
                    );
                }
            }
        }
        Ok(())
    }

    pub fn print_frame(&self, frame: &Frame) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(frame)?),
            _ => {
                let values: Vec<String> = frame
                    .samples
                    .iter()
                    .map(|sample| format!("{}={:.2}", sample.channel_id, sample.value))
                    .collect();
                let at = plantwatch_engine::model::millis_to_datetime(frame.timestamp_ms);
                if self.colored {
                    println!(
                        "{} {}",
                        style(at.format("%H:%M:%S%.3f")).dim(),
                        values.join(" ")
                    );
                } else {
                    println!("{} {}", at.format("%H:%M:%S%.3f"), values.join(" "));
                }
            }
        }
        Ok(())
    }

    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn print_success(&self, message: &str) -> Result<()> {
        if self.colored {
            println!("{} {}", style("✓").green().bold(), message);
        } else {
            println!("✓ {}", message);
        }
        Ok(())
    }

    pub fn print_warning(&self, message: &str) -> Result<()> {
        if self.colored {
            println!("{} {}", style("⚠").yellow().bold(), message);
        } else {
            println!("⚠ {}", message);
        }
        Ok(())
    }

    pub fn print_info(&self, message: &str) -> Result<()> {
        if self.format == OutputFormat::Json {
            return Ok(());
        }
        if self.colored {
            println!("{} {}", style("ℹ").blue().bold(), message);
        } else {
            println!("ℹ {}", message);
        }
        Ok(())
    }

    pub fn create_progress_bar(&self, total: u64, message: &str) -> ProgressBar {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}/{len:3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        pb.set_message(message.to_string());
        pb
    }

    fn header(&self, line: &str) {
        if self.colored {
            println!("{}", style(line).bold().underlined());
        } else {
            println!("{}", line);
        }
    }

    fn severity(&self, severity: Severity) -> String {
        if !self.colored {
            return severity.to_string();
        }
        let color = match severity {
            Severity::Low => Style::new().cyan(),
            Severity::Medium => Style::new().yellow(),
            Severity::High => Style::new().red(),
            Severity::Critical => Style::new().red().bold(),
        };
        color.apply_to(severity.to_string()).to_string()
    }

    fn calibration_status(&self, status: CalibrationStatus) -> String {
        if !self.colored {
            return status.as_str().to_string();
        }
        let color = match status {
            CalibrationStatus::Good => Style::new().green(),
            CalibrationStatus::Warning => Style::new().yellow(),
            CalibrationStatus::Error => Style::new().red(),
        };
        color.apply_to(status.as_str()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("table".parse::<OutputFormat>().unwrap(), OutputFormat::Table);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
