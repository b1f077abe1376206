//! Replay controller
//!
//! Maps a virtual timeline position onto buffered samples. The controller has
//! its own fixed-period ticker, independent of live ingestion, and only ever
//! reads from the ring buffers.
//!
//! State machine: `Stopped <-> Playing <-> Paused`, with `Seeking` as a
//! transient state reported while a seek is applied.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferStore;
use crate::error::{BufferResult, ReplayError, ReplayResult};
use crate::event_bus::{EventBus, TelemetryEvent};
use crate::locks;
use crate::model::Sample;

pub const MIN_SPEED: f64 = 0.5;
pub const MAX_SPEED: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Seeking,
}

/// How a cursor timestamp is resolved to a sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupMode {
    /// Newest buffered sample at or before the cursor
    #[default]
    NearestBefore,
    /// Interpolate between the samples bracketing the cursor
    Linear,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplaySettings {
    pub tick_period: Duration,
    pub skip_step_ms: i64,
    pub lookup: LookupMode,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(100),
            skip_step_ms: 60_000,
            lookup: LookupMode::NearestBefore,
        }
    }
}

/// An open playback window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySession {
    pub start_ms: i64,
    pub end_ms: i64,
    pub cursor_offset_ms: i64,
    pub state: PlaybackState,
    pub speed: f64,
}

impl ReplaySession {
    fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    fn position(&self) -> Position {
        Position {
            cursor_ms: self.cursor_offset_ms,
            timestamp_ms: self.start_ms + self.cursor_offset_ms,
            playing: self.state == PlaybackState::Playing,
            speed: self.speed,
            state: self.state,
        }
    }
}

/// Snapshot of the playback position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Offset from the session start
    pub cursor_ms: i64,
    /// Absolute timestamp under the cursor
    pub timestamp_ms: i64,
    pub playing: bool,
    pub speed: f64,
    pub state: PlaybackState,
}

/// Samples under the cursor, one per channel that has data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp_ms: i64,
    pub cursor_ms: i64,
    pub samples: Vec<Sample>,
}

pub struct ReplayController {
    buffers: Arc<BufferStore>,
    session: Mutex<Option<ReplaySession>>,
    settings: ReplaySettings,
    bus: EventBus,
}

impl ReplayController {
    pub fn new(buffers: Arc<BufferStore>, settings: ReplaySettings, bus: EventBus) -> Self {
        Self {
            buffers,
            session: Mutex::new(None),
            settings,
            bus,
        }
    }

    pub fn settings(&self) -> &ReplaySettings {
        &self.settings
    }

    /// Open a session over `[start_ms, end_ms]`, replacing any open one
    pub fn open_session(&self, start_ms: i64, end_ms: i64) -> ReplayResult<Position> {
        // the window length must fit an i64 offset
        let representable = end_ms.checked_sub(start_ms).is_some_and(|duration| duration > 0);
        if !representable {
            return Err(ReplayError::InvalidWindow { start_ms, end_ms });
        }

        let session = ReplaySession {
            start_ms,
            end_ms,
            cursor_offset_ms: 0,
            state: PlaybackState::Stopped,
            speed: 1.0,
        };
        let position = session.position();
        *locks::lock(&self.session) = Some(session);

        tracing::info!(start_ms, end_ms, "Replay session opened");
        self.bus.publish(TelemetryEvent::ReplayPosition(position.clone()));
        Ok(position)
    }

    /// Open a session spanning everything currently buffered
    pub fn open_buffered_session(&self) -> ReplayResult<Position> {
        let (start_ms, end_ms) = self.buffers.time_span().ok_or(ReplayError::NothingBuffered)?;
        if end_ms <= start_ms {
            return Err(ReplayError::NothingBuffered);
        }
        self.open_session(start_ms, end_ms)
    }

    pub fn close_session(&self) -> ReplayResult<()> {
        locks::lock(&self.session).take().ok_or(ReplayError::NoSession)?;
        tracing::info!("Replay session closed");
        Ok(())
    }

    pub fn session(&self) -> Option<ReplaySession> {
        locks::lock(&self.session).clone()
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut ReplaySession) -> T) -> ReplayResult<T> {
        let mut guard = locks::lock(&self.session);
        let session = guard.as_mut().ok_or(ReplayError::NoSession)?;
        Ok(f(session))
    }

    fn update(&self, f: impl FnOnce(&mut ReplaySession)) -> ReplayResult<Position> {
        let position = self.with_session(|session| {
            f(session);
            session.position()
        })?;
        self.bus.publish(TelemetryEvent::ReplayPosition(position.clone()));
        Ok(position)
    }

    /// Start playback; from `Stopped` the cursor rewinds to the session start
    pub fn play(&self) -> ReplayResult<Position> {
        self.update(|session| {
            if session.state == PlaybackState::Stopped {
                session.cursor_offset_ms = 0;
            }
            session.state = PlaybackState::Playing;
        })
    }

    pub fn pause(&self) -> ReplayResult<Position> {
        self.update(|session| {
            if session.state == PlaybackState::Playing {
                session.state = PlaybackState::Paused;
            }
        })
    }

    pub fn resume(&self) -> ReplayResult<Position> {
        self.update(|session| {
            if session.state == PlaybackState::Paused {
                session.state = PlaybackState::Playing;
            }
        })
    }

    /// Move the cursor to `offset_ms`, clamped into the session window
    ///
    /// Usable from any state; the play/pause state is left unchanged.
    pub fn seek(&self, offset_ms: i64) -> ReplayResult<Position> {
        let (seeking, resumed) = self.with_session(|session| {
            let prior = session.state;
            session.state = PlaybackState::Seeking;
            let seeking = session.position();

            session.cursor_offset_ms = offset_ms.clamp(0, session.duration_ms());
            session.state = prior;
            (seeking, session.position())
        })?;

        tracing::debug!(offset_ms, cursor = resumed.cursor_ms, "Replay seek");
        self.bus.publish(TelemetryEvent::ReplayPosition(seeking));
        self.bus.publish(TelemetryEvent::ReplayPosition(resumed.clone()));
        Ok(resumed)
    }

    pub fn skip_forward(&self) -> ReplayResult<Position> {
        let cursor = self.current_position()?.cursor_ms;
        self.seek(cursor.saturating_add(self.settings.skip_step_ms))
    }

    pub fn skip_back(&self) -> ReplayResult<Position> {
        let cursor = self.current_position()?.cursor_ms;
        self.seek(cursor.saturating_sub(self.settings.skip_step_ms))
    }

    /// Rewind to the session start and stop
    pub fn reset(&self) -> ReplayResult<Position> {
        self.update(|session| {
            session.cursor_offset_ms = 0;
            session.state = PlaybackState::Stopped;
        })
    }

    /// Set the speed multiplier, clamped into `[0.5, 4.0]`
    pub fn set_speed(&self, multiplier: f64) -> ReplayResult<Position> {
        let speed = if multiplier.is_nan() {
            1.0
        } else {
            multiplier.clamp(MIN_SPEED, MAX_SPEED)
        };
        self.update(|session| session.speed = speed)
    }

    pub fn current_position(&self) -> ReplayResult<Position> {
        self.with_session(|session| session.position())
    }

    pub fn progress_percent(&self) -> ReplayResult<f64> {
        self.with_session(|session| session.cursor_offset_ms as f64 / session.duration_ms() as f64 * 100.0)
    }

    /// Advance one scheduler tick
    ///
    /// While playing the cursor moves by `tick_period * speed`; reaching the
    /// end clamps the cursor and stops playback. Returns the frame under the
    /// new cursor, or `None` when not playing.
    pub fn tick(&self) -> ReplayResult<Option<Frame>> {
        let tick_ms = self.settings.tick_period.as_millis() as f64;
        let advanced = self.with_session(|session| {
            if session.state != PlaybackState::Playing {
                return None;
            }

            let step = (tick_ms * session.speed).round() as i64;
            let duration = session.duration_ms();
            session.cursor_offset_ms = session.cursor_offset_ms.saturating_add(step).min(duration);
            let finished = session.cursor_offset_ms >= duration;
            if finished {
                session.state = PlaybackState::Stopped;
            }
            Some((session.position(), finished))
        })?;

        let Some((position, finished)) = advanced else {
            return Ok(None);
        };

        let frame = self.frame_at(position.timestamp_ms, position.cursor_ms);
        self.bus.publish(TelemetryEvent::ReplayFrame(frame.clone()));
        if finished {
            tracing::info!(cursor = position.cursor_ms, "Replay reached end of session");
            self.bus.publish(TelemetryEvent::ReplayPosition(position));
        }
        Ok(Some(frame))
    }

    /// Sample for one channel at an absolute timestamp
    pub fn sample_at(&self, channel: &str, timestamp_ms: i64) -> BufferResult<Option<Sample>> {
        match self.settings.lookup {
            LookupMode::NearestBefore => self.buffers.at_or_before(channel, timestamp_ms),
            LookupMode::Linear => {
                let (before, after) = self.buffers.bracket(channel, timestamp_ms)?;
                Ok(match (before, after) {
                    (Some(before), Some(after)) if before.timestamp_ms < timestamp_ms => {
                        Some(interpolate(&before, &after, timestamp_ms))
                    }
                    (before, _) => before,
                })
            }
        }
    }

    /// Frame under the current cursor
    pub fn current_frame(&self) -> ReplayResult<Frame> {
        let position = self.current_position()?;
        Ok(self.frame_at(position.timestamp_ms, position.cursor_ms))
    }

    fn frame_at(&self, timestamp_ms: i64, cursor_ms: i64) -> Frame {
        let samples = self
            .buffers
            .registry()
            .iter()
            .filter_map(|channel| match self.sample_at(&channel.id, timestamp_ms) {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::warn!(channel = %channel.id, error = %e, "Replay lookup failed");
                    None
                }
            })
            .collect();

        Frame {
            timestamp_ms,
            cursor_ms,
            samples,
        }
    }

    /// Drive `tick` on the configured period until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Replay loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(ReplayError::NoSession) = self.tick() {
                        tracing::trace!("Replay tick without session");
                    }
                }
            }
        }
    }
}

fn interpolate(before: &Sample, after: &Sample, timestamp_ms: i64) -> Sample {
    let span = (after.timestamp_ms - before.timestamp_ms) as f64;
    let fraction = (timestamp_ms - before.timestamp_ms) as f64 / span;
    Sample::new(
        before.channel_id.clone(),
        timestamp_ms,
        before.value + (after.value - before.value) * fraction,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::channel::ChannelRegistry;

    fn controller(lookup: LookupMode) -> (Arc<BufferStore>, ReplayController) {
        let registry = Arc::new(ChannelRegistry::kiln_plant());
        let buffers = Arc::new(BufferStore::new(registry, 100, &HashMap::new(), None).unwrap());
        let settings = ReplaySettings {
            lookup,
            ..ReplaySettings::default()
        };
        let controller = ReplayController::new(Arc::clone(&buffers), settings, EventBus::new(64));
        (buffers, controller)
    }

    #[test]
    fn test_ticks_advance_cursor_and_clamp() {
        let (_buffers, replay) = controller(LookupMode::NearestBefore);
        replay.open_session(0, 1_000).unwrap();
        replay.set_speed(1.5).unwrap();
        replay.play().unwrap();

        for k in 1..=10i64 {
            replay.tick().unwrap();
            let position = replay.current_position().unwrap();
            assert_eq!(position.cursor_ms, (k * 150).min(1_000));
        }
        let position = replay.current_position().unwrap();
        assert_eq!(position.state, PlaybackState::Stopped);
        assert!(!position.playing);
        assert_eq!(replay.progress_percent().unwrap(), 100.0);
        assert!(replay.tick().unwrap().is_none());
    }

    #[test]
    fn test_pause_keeps_cursor() {
        let (_buffers, replay) = controller(LookupMode::NearestBefore);
        replay.open_session(0, 10_000).unwrap();
        replay.play().unwrap();
        replay.tick().unwrap();
        replay.tick().unwrap();

        let paused = replay.pause().unwrap();
        assert_eq!(paused.state, PlaybackState::Paused);
        replay.tick().unwrap();
        assert_eq!(replay.current_position().unwrap().cursor_ms, 200);

        // play from Paused resumes rather than rewinding
        let resumed = replay.play().unwrap();
        assert_eq!(resumed.cursor_ms, 200);
        assert!(resumed.playing);
    }

    #[test]
    fn test_seek_clamps_and_preserves_state() {
        let (_buffers, replay) = controller(LookupMode::NearestBefore);
        replay.open_session(1_000, 5_000).unwrap();

        assert_eq!(replay.seek(10_000).unwrap().cursor_ms, 4_000);
        assert_eq!(replay.seek(-5).unwrap().cursor_ms, 0);

        replay.play().unwrap();
        replay.pause().unwrap();
        let position = replay.seek(2_500).unwrap();
        assert_eq!(position.state, PlaybackState::Paused);
        assert_eq!(position.timestamp_ms, 3_500);

        assert_eq!(replay.skip_back().unwrap().cursor_ms, 0);
        assert_eq!(replay.skip_forward().unwrap().cursor_ms, 4_000);

        let reset = replay.reset().unwrap();
        assert_eq!(reset.cursor_ms, 0);
        assert_eq!(reset.state, PlaybackState::Stopped);
    }

    #[test]
    fn test_speed_is_clamped() {
        let (_buffers, replay) = controller(LookupMode::NearestBefore);
        replay.open_session(0, 1_000).unwrap();
        assert_eq!(replay.set_speed(10.0).unwrap().speed, MAX_SPEED);
        assert_eq!(replay.set_speed(0.1).unwrap().speed, MIN_SPEED);
        assert_eq!(replay.set_speed(2.0).unwrap().speed, 2.0);
    }

    #[test]
    fn test_session_required() {
        let (_buffers, replay) = controller(LookupMode::NearestBefore);
        assert_eq!(replay.play(), Err(ReplayError::NoSession));
        assert_eq!(
            replay.open_session(10, 10),
            Err(ReplayError::InvalidWindow { start_ms: 10, end_ms: 10 })
        );
        assert_eq!(replay.open_buffered_session(), Err(ReplayError::NothingBuffered));

        // a window whose length overflows an i64 offset is refused
        assert_eq!(
            replay.open_session(i64::MIN, i64::MAX),
            Err(ReplayError::InvalidWindow {
                start_ms: i64::MIN,
                end_ms: i64::MAX
            })
        );
        assert_eq!(replay.current_position(), Err(ReplayError::NoSession));

        let position = replay.open_session(i64::MIN / 2, i64::MAX / 2).unwrap();
        assert_eq!(position.timestamp_ms, i64::MIN / 2);
        assert_eq!(replay.seek(i64::MAX).unwrap().timestamp_ms, i64::MAX / 2);

        replay.open_session(0, 10).unwrap();
        replay.close_session().unwrap();
        assert_eq!(replay.close_session(), Err(ReplayError::NoSession));
    }

    #[test]
    fn test_lookup_modes() {
        let (buffers, replay) = controller(LookupMode::NearestBefore);
        buffers.append(Sample::new("oxygen_level", 1_000, 3.0)).unwrap();
        buffers.append(Sample::new("oxygen_level", 2_000, 5.0)).unwrap();

        assert!(replay.sample_at("oxygen_level", 999).unwrap().is_none());
        assert_eq!(replay.sample_at("oxygen_level", 1_500).unwrap().unwrap().value, 3.0);

        let (buffers, linear) = controller(LookupMode::Linear);
        buffers.append(Sample::new("oxygen_level", 1_000, 3.0)).unwrap();
        buffers.append(Sample::new("oxygen_level", 2_000, 5.0)).unwrap();
        let sample = linear.sample_at("oxygen_level", 1_500).unwrap().unwrap();
        assert_eq!(sample.value, 4.0);
        assert_eq!(sample.timestamp_ms, 1_500);
        assert_eq!(linear.sample_at("oxygen_level", 2_500).unwrap().unwrap().value, 5.0);
    }

    #[test]
    fn test_frames_follow_cursor() {
        let (buffers, replay) = controller(LookupMode::NearestBefore);
        buffers.append(Sample::new("kiln_temperature", 0, 1400.0)).unwrap();
        buffers.append(Sample::new("kiln_temperature", 150, 1410.0)).unwrap();
        buffers.append(Sample::new("oxygen_level", 100, 3.2)).unwrap();

        replay.open_buffered_session().unwrap();
        replay.play().unwrap();
        let frame = replay.tick().unwrap().unwrap();
        assert_eq!(frame.cursor_ms, 100);
        assert_eq!(frame.samples.len(), 2);
        let kiln = frame.samples.iter().find(|s| s.channel_id == "kiln_temperature").unwrap();
        assert_eq!(kiln.value, 1400.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_publishes_frames() {
        let (_buffers, replay) = controller(LookupMode::NearestBefore);
        let replay = Arc::new(replay);
        let mut rx = replay.bus.subscribe();
        replay.open_session(0, 300).unwrap();
        replay.play().unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&replay).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut frames = 0;
        while let Ok(event) = rx.try_recv() {
            if let TelemetryEvent::ReplayFrame(_) = event {
                frames += 1;
            }
        }
        assert_eq!(frames, 3);
        assert_eq!(replay.current_position().unwrap().state, PlaybackState::Stopped);
    }
}
