use std::path::PathBuf;

use clap::Args;

use plantwatch_engine::{ExportFormat, TelemetryEngine};

use crate::error::Result;
use crate::history::{self, HistoryArgs};
use crate::output::OutputManager;
use crate::settings::CliSettings;

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub history: HistoryArgs,

    /// Comma-separated channel ids (default: every channel)
    #[arg(short, long, value_delimiter = ',')]
    pub channels: Vec<String>,

    /// Window start, epoch ms or RFC 3339 (default: oldest buffered sample)
    #[arg(long)]
    pub from: Option<String>,

    /// Window end, epoch ms or RFC 3339 (default: newest buffered sample)
    #[arg(long)]
    pub to: Option<String>,

    /// csv or json
    #[arg(short, long, default_value = "csv")]
    pub format: ExportFormat,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn run(args: ExportArgs, engine: TelemetryEngine, settings: &CliSettings, output: OutputManager) -> Result<()> {
    let report = history::load(&engine, &args.history, settings.seed).await?;
    if report.rejected > 0 {
        output.print_warning(&format!("{} samples were rejected while loading", report.rejected))?;
    }

    let channels = if args.channels.is_empty() {
        engine.registry().ids()
    } else {
        args.channels
    };
    let (from, to) = history::resolve_window(&engine, args.from.as_deref(), args.to.as_deref())?;

    let bytes = engine.export_window(&channels, from, to, args.format)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, &bytes)?;
            output.print_success(&format!(
                "Exported {} channel(s) as {} to {}",
                channels.len(),
                args.format,
                path.display()
            ))?;
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&bytes)?;
        }
    }
    Ok(())
}
