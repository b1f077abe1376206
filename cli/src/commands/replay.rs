use clap::Args;
use tokio::time::MissedTickBehavior;

use plantwatch_engine::replay::{MAX_SPEED, MIN_SPEED};
use plantwatch_engine::{PlaybackState, TelemetryEngine};

use crate::error::{CliError, Result};
use crate::history::{self, HistoryArgs};
use crate::output::OutputManager;
use crate::settings::CliSettings;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub history: HistoryArgs,

    /// Window start, epoch ms or RFC 3339 (default: oldest buffered sample)
    #[arg(long)]
    pub from: Option<String>,

    /// Window end, epoch ms or RFC 3339 (default: newest buffered sample)
    #[arg(long)]
    pub to: Option<String>,

    /// Playback speed multiplier (0.5 to 4.0)
    #[arg(long, default_value = "1.0")]
    pub speed: f64,

    /// Start this many milliseconds into the window
    #[arg(long, default_value = "0")]
    pub seek: i64,

    /// Print every Nth frame
    #[arg(long, default_value = "10")]
    pub every: usize,

    /// Run ticks back to back instead of on the scheduler period
    #[arg(long)]
    pub no_wait: bool,
}

pub async fn run(args: ReplayArgs, engine: TelemetryEngine, settings: &CliSettings, output: OutputManager) -> Result<()> {
    if !(MIN_SPEED..=MAX_SPEED).contains(&args.speed) {
        output.print_warning(&format!(
            "Speed {} is outside [{}, {}] and will be clamped",
            args.speed, MIN_SPEED, MAX_SPEED
        ))?;
    }
    if args.every == 0 {
        return Err(CliError::InvalidArgument("--every must be at least 1".to_string()));
    }

    history::load(&engine, &args.history, settings.seed).await?;
    let (from, to) = history::resolve_window(&engine, args.from.as_deref(), args.to.as_deref())?;

    engine.open_replay(from, to)?;
    engine.set_speed(args.speed)?;
    engine.play()?;
    if args.seek > 0 {
        engine.seek(args.seek)?;
    }

    let position = engine.current_position()?;
    output.print_info(&format!(
        "Replaying {} ms of history at {}x",
        to - from,
        position.speed
    ))?;

    let replay = engine.replay();
    let mut ticker = tokio::time::interval(replay.settings().tick_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut frames = 0usize;
    loop {
        if !args.no_wait {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    engine.pause()?;
                    output.print_warning("Replay interrupted")?;
                    return Err(CliError::Cancelled);
                }
                _ = ticker.tick() => {}
            }
        }

        let Some(frame) = replay.tick()? else {
            break;
        };
        let finished = engine.current_position()?.state == PlaybackState::Stopped;
        if frames % args.every == 0 || finished {
            output.print_frame(&frame)?;
        }
        frames += 1;
        if finished {
            break;
        }
    }

    output.print_success(&format!("Replay finished after {} frames", frames))
}
