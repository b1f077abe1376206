//! Ring buffer store
//!
//! One fixed-capacity, time-ordered ring buffer per registered channel.
//! Writers hold a channel's lock only for the insert-and-evict step; readers
//! of other channels are never blocked because every channel has its own lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelRegistry, ValueRange};
use crate::error::{BufferError, BufferResult};
use crate::locks;
use crate::model::{ChannelId, Sample, StoredSample};

/// Per-channel data-quality counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub accepted: u64,
    pub replaced: u64,
    pub out_of_order: u64,
    pub out_of_range: u64,
    pub evicted: u64,
}

/// What happened to an accepted sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Value was outside the valid range; stored but flagged
    pub flagged: bool,

    /// Sample carried the same timestamp as the newest one and replaced it
    pub replaced: bool,

    /// Samples evicted by capacity or retention
    pub evicted: usize,
}

/// Fixed-capacity FIFO of samples with non-decreasing timestamps
#[derive(Debug, Clone)]
pub struct RingBuffer {
    slots: VecDeque<StoredSample>,
    capacity: usize,
    retention_ms: Option<i64>,
    stats: BufferStats,
}

impl RingBuffer {
    pub fn new(capacity: usize, retention_ms: Option<i64>) -> BufferResult<Self> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity { capacity });
        }

        Ok(Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
            retention_ms,
            stats: BufferStats::default(),
        })
    }

    /// Insert a sample, evicting the oldest entries once full
    ///
    /// A sample older than the newest stored one is rejected without touching
    /// the buffer. A sample with the same timestamp as the newest one replaces
    /// it, so a channel never holds duplicate timestamps.
    pub fn push(&mut self, sample: Sample, range: &ValueRange) -> BufferResult<AppendOutcome> {
        if let Some(last) = self.slots.back() {
            if sample.timestamp_ms < last.sample.timestamp_ms {
                self.stats.out_of_order += 1;
                return Err(BufferError::OutOfOrder {
                    channel: sample.channel_id,
                    timestamp_ms: sample.timestamp_ms,
                    last_ms: last.sample.timestamp_ms,
                });
            }
        }

        let mut outcome = AppendOutcome {
            flagged: !range.contains(sample.value),
            ..AppendOutcome::default()
        };
        if outcome.flagged {
            self.stats.out_of_range += 1;
        }

        let newest_ms = sample.timestamp_ms;
        let stored = StoredSample {
            sample,
            out_of_range: outcome.flagged,
        };

        match self.slots.back_mut() {
            Some(last) if last.sample.timestamp_ms == newest_ms => {
                *last = stored;
                outcome.replaced = true;
                self.stats.replaced += 1;
            }
            _ => {
                self.slots.push_back(stored);
            }
        }
        self.stats.accepted += 1;

        while self.slots.len() > self.capacity {
            self.slots.pop_front();
            outcome.evicted += 1;
        }

        if let Some(retention) = self.retention_ms {
            let horizon = newest_ms.saturating_sub(retention);
            while self
                .slots
                .front()
                .is_some_and(|oldest| oldest.sample.timestamp_ms < horizon)
            {
                self.slots.pop_front();
                outcome.evicted += 1;
            }
        }

        self.stats.evicted += outcome.evicted as u64;
        Ok(outcome)
    }

    /// Samples with `from_ms <= timestamp <= to_ms`, ascending
    pub fn window(&self, from_ms: i64, to_ms: i64) -> Vec<StoredSample> {
        if from_ms > to_ms {
            return Vec::new();
        }
        let start = self.slots.partition_point(|s| s.sample.timestamp_ms < from_ms);
        let end = self.slots.partition_point(|s| s.sample.timestamp_ms <= to_ms);
        self.slots.range(start..end).cloned().collect()
    }

    pub fn latest(&self) -> Option<&StoredSample> {
        self.slots.back()
    }

    pub fn oldest(&self) -> Option<&StoredSample> {
        self.slots.front()
    }

    /// Newest sample with `timestamp <= at_ms`
    pub fn at_or_before(&self, at_ms: i64) -> Option<&StoredSample> {
        let idx = self.slots.partition_point(|s| s.sample.timestamp_ms <= at_ms);
        idx.checked_sub(1).and_then(|i| self.slots.get(i))
    }

    /// Oldest sample with `timestamp > at_ms`
    pub fn after(&self, at_ms: i64) -> Option<&StoredSample> {
        let idx = self.slots.partition_point(|s| s.sample.timestamp_ms <= at_ms);
        self.slots.get(idx)
    }

    /// Change capacity, evicting the oldest samples when shrinking
    pub fn set_capacity(&mut self, capacity: usize) -> BufferResult<usize> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity { capacity });
        }
        self.capacity = capacity;

        let mut evicted = 0;
        while self.slots.len() > capacity {
            self.slots.pop_front();
            evicted += 1;
        }
        self.stats.evicted += evicted as u64;
        Ok(evicted)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}

/// Ring buffers for every registered channel
pub struct BufferStore {
    registry: Arc<ChannelRegistry>,
    buffers: HashMap<ChannelId, RwLock<RingBuffer>>,
}

impl BufferStore {
    /// Create one buffer per channel
    ///
    /// `capacity_overrides` maps channel ids to a capacity other than
    /// `default_capacity`.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        default_capacity: usize,
        capacity_overrides: &HashMap<ChannelId, usize>,
        retention_ms: Option<i64>,
    ) -> BufferResult<Self> {
        let mut buffers = HashMap::with_capacity(registry.len());
        for channel in registry.iter() {
            let capacity = capacity_overrides
                .get(&channel.id)
                .copied()
                .unwrap_or(default_capacity);
            buffers.insert(channel.id.clone(), RwLock::new(RingBuffer::new(capacity, retention_ms)?));
        }

        Ok(Self { registry, buffers })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    fn buffer(&self, channel: &str) -> BufferResult<&RwLock<RingBuffer>> {
        self.buffers.get(channel).ok_or_else(|| BufferError::UnknownChannel {
            channel: channel.to_string(),
        })
    }

    /// Append a sample to its channel's buffer
    ///
    /// Out-of-range values are stored and reported through
    /// [`AppendOutcome::flagged`] rather than as an error.
    pub fn append(&self, sample: Sample) -> BufferResult<AppendOutcome> {
        let channel = self
            .registry
            .get(&sample.channel_id)
            .ok_or_else(|| BufferError::UnknownChannel {
                channel: sample.channel_id.clone(),
            })?;
        let range = channel.valid_range;
        let lock = self.buffer(&sample.channel_id)?;

        let mut buffer = locks::write(lock);
        buffer.push(sample, &range)
    }

    /// Samples in `[from_ms, to_ms]`, ascending
    pub fn window(&self, channel: &str, from_ms: i64, to_ms: i64) -> BufferResult<Vec<Sample>> {
        Ok(self
            .window_stored(channel, from_ms, to_ms)?
            .into_iter()
            .map(|stored| stored.sample)
            .collect())
    }

    /// Like [`BufferStore::window`] but keeps the out-of-range flag
    pub fn window_stored(&self, channel: &str, from_ms: i64, to_ms: i64) -> BufferResult<Vec<StoredSample>> {
        let buffer = locks::read(self.buffer(channel)?);
        Ok(buffer.window(from_ms, to_ms))
    }

    pub fn latest(&self, channel: &str) -> BufferResult<Option<Sample>> {
        let buffer = locks::read(self.buffer(channel)?);
        Ok(buffer.latest().map(|stored| stored.sample.clone()))
    }

    pub fn at_or_before(&self, channel: &str, at_ms: i64) -> BufferResult<Option<Sample>> {
        let buffer = locks::read(self.buffer(channel)?);
        Ok(buffer.at_or_before(at_ms).map(|stored| stored.sample.clone()))
    }

    /// Samples bracketing `at_ms`: newest at-or-before and oldest after
    pub fn bracket(&self, channel: &str, at_ms: i64) -> BufferResult<(Option<Sample>, Option<Sample>)> {
        let buffer = locks::read(self.buffer(channel)?);
        Ok((
            buffer.at_or_before(at_ms).map(|stored| stored.sample.clone()),
            buffer.after(at_ms).map(|stored| stored.sample.clone()),
        ))
    }

    /// Oldest and newest buffered timestamps across all channels
    pub fn time_span(&self) -> Option<(i64, i64)> {
        self.buffers.values().fold(None, |span, lock| {
            let buffer = locks::read(lock);
            match (buffer.oldest(), buffer.latest()) {
                (Some(first), Some(last)) => {
                    let (lo, hi) = (first.sample.timestamp_ms, last.sample.timestamp_ms);
                    Some(span.map_or((lo, hi), |(a, b): (i64, i64)| (a.min(lo), b.max(hi))))
                }
                _ => span,
            }
        })
    }

    pub fn set_capacity(&self, channel: &str, capacity: usize) -> BufferResult<usize> {
        let mut buffer = locks::write(self.buffer(channel)?);
        buffer.set_capacity(capacity)
    }

    pub fn capacity(&self, channel: &str) -> BufferResult<usize> {
        Ok(locks::read(self.buffer(channel)?).capacity())
    }

    pub fn len(&self, channel: &str) -> BufferResult<usize> {
        Ok(locks::read(self.buffer(channel)?).len())
    }

    pub fn stats(&self, channel: &str) -> BufferResult<BufferStats> {
        Ok(locks::read(self.buffer(channel)?).stats())
    }

    /// Drop every sample of one channel
    pub fn reset(&self, channel: &str) -> BufferResult<()> {
        locks::write(self.buffer(channel)?).clear();
        Ok(())
    }

    pub fn reset_all(&self) {
        for lock in self.buffers.values() {
            locks::write(lock).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use proptest::prelude::*;

    fn pressure_store(capacity: usize) -> BufferStore {
        let registry = ChannelRegistry::new(vec![Channel::new("pressure", "bar", 0.0, 10.0)]).unwrap();
        BufferStore::new(Arc::new(registry), capacity, &HashMap::new(), None).unwrap()
    }

    #[test]
    fn test_fifo_eviction() {
        let store = pressure_store(3);
        for ts in 0..5 {
            store.append(Sample::new("pressure", ts, 1.0)).unwrap();
        }

        let window = store.window("pressure", i64::MIN, i64::MAX).unwrap();
        let timestamps: Vec<i64> = window.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
        assert_eq!(store.stats("pressure").unwrap().evicted, 2);
    }

    #[test]
    fn test_out_of_order_rejection_leaves_buffer_untouched() {
        let store = pressure_store(10);
        store.append(Sample::new("pressure", 100, 3.0)).unwrap();
        store.append(Sample::new("pressure", 200, 4.0)).unwrap();
        let before = store.window("pressure", 0, 1000).unwrap();

        let result = store.append(Sample::new("pressure", 150, 5.0));
        assert!(matches!(result, Err(BufferError::OutOfOrder { last_ms: 200, .. })));

        let after = store.window("pressure", 0, 1000).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.stats("pressure").unwrap().out_of_order, 1);
    }

    #[test]
    fn test_out_of_range_is_stored_and_flagged() {
        let store = pressure_store(10);
        let outcome = store.append(Sample::new("pressure", 1, 12.5)).unwrap();
        assert!(outcome.flagged);

        let stored = store.window_stored("pressure", 0, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].out_of_range);
        assert_eq!(store.latest("pressure").unwrap().unwrap().value, 12.5);
    }

    #[test]
    fn test_equal_timestamp_replaces_newest() {
        let store = pressure_store(10);
        store.append(Sample::new("pressure", 5, 1.0)).unwrap();
        let outcome = store.append(Sample::new("pressure", 5, 2.0)).unwrap();
        assert!(outcome.replaced);

        let window = store.window("pressure", 0, 10).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].value, 2.0);
    }

    #[test]
    fn test_unknown_channel() {
        let store = pressure_store(10);
        let result = store.append(Sample::new("humidity", 1, 1.0));
        assert!(matches!(result, Err(BufferError::UnknownChannel { .. })));
        assert!(store.latest("humidity").is_err());
    }

    #[test]
    fn test_retention_prunes_old_samples() {
        let registry = ChannelRegistry::new(vec![Channel::new("pressure", "bar", 0.0, 10.0)]).unwrap();
        let store = BufferStore::new(Arc::new(registry), 100, &HashMap::new(), Some(1_000)).unwrap();
        for ts in [0, 500, 1_000, 1_600] {
            store.append(Sample::new("pressure", ts, 1.0)).unwrap();
        }

        let window = store.window("pressure", i64::MIN, i64::MAX).unwrap();
        let timestamps: Vec<i64> = window.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1_000, 1_600]);
    }

    #[test]
    fn test_shrinking_capacity_evicts_oldest() {
        let store = pressure_store(10);
        for ts in 0..6 {
            store.append(Sample::new("pressure", ts, 1.0)).unwrap();
        }
        assert_eq!(store.set_capacity("pressure", 2).unwrap(), 4);
        assert_eq!(store.len("pressure").unwrap(), 2);
        assert_eq!(store.window("pressure", 0, 10).unwrap()[0].timestamp_ms, 4);
        assert!(store.set_capacity("pressure", 0).is_err());
    }

    #[test]
    fn test_at_or_before_and_bracket() {
        let store = pressure_store(10);
        for ts in [100, 200, 300] {
            store.append(Sample::new("pressure", ts, ts as f64 / 100.0)).unwrap();
        }
        assert_eq!(store.at_or_before("pressure", 250).unwrap().unwrap().timestamp_ms, 200);
        assert_eq!(store.at_or_before("pressure", 200).unwrap().unwrap().timestamp_ms, 200);
        assert!(store.at_or_before("pressure", 50).unwrap().is_none());

        let (before, after) = store.bracket("pressure", 250).unwrap();
        assert_eq!(before.unwrap().timestamp_ms, 200);
        assert_eq!(after.unwrap().timestamp_ms, 300);
        assert_eq!(store.time_span(), Some((100, 300)));
    }

    #[test]
    fn test_readers_see_consistent_windows_during_appends() {
        const CAPACITY: usize = 100;
        const WRITES: i64 = 5_000;

        let registry = ChannelRegistry::new(vec![
            Channel::new("pressure", "bar", 0.0, 10.0),
            Channel::new("temperature", "°C", 0.0, 2000.0),
        ])
        .unwrap();
        let store = BufferStore::new(Arc::new(registry), CAPACITY, &HashMap::new(), None).unwrap();
        for ts in 0..CAPACITY as i64 {
            store.append(Sample::new("temperature", ts, 1400.0)).unwrap();
        }

        let check_window = |channel: &str| {
            let window = store.window(channel, i64::MIN, i64::MAX).unwrap();
            assert!(window.len() <= CAPACITY);
            for pair in window.windows(2) {
                assert!(pair[0].timestamp_ms < pair[1].timestamp_ms);
            }
            window
        };

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for ts in 0..WRITES {
                    store.append(Sample::new("pressure", ts, 2.5)).unwrap();
                }
            });

            for _ in 0..2 {
                scope.spawn(|| {
                    let mut last_seen = -1;
                    while last_seen < WRITES - 1 {
                        check_window("pressure");
                        if let Some(latest) = store.latest("pressure").unwrap() {
                            assert!(latest.timestamp_ms >= last_seen);
                            last_seen = latest.timestamp_ms;
                        }
                    }
                });
            }

            scope.spawn(|| {
                for _ in 0..1_000 {
                    assert_eq!(check_window("temperature").len(), CAPACITY);
                }
            });
        });

        assert_eq!(store.len("pressure").unwrap(), CAPACITY);
        assert_eq!(store.latest("pressure").unwrap().unwrap().timestamp_ms, WRITES - 1);
    }

    proptest! {
        #[test]
        fn prop_capacity_and_ordering_hold(
            capacity in 1usize..64,
            steps in proptest::collection::vec((-5i64..20, 0.0f64..12.0), 0..200),
        ) {
            let store = pressure_store(capacity);
            let mut ts = 0i64;
            for (delta, value) in steps {
                ts += delta;
                let _ = store.append(Sample::new("pressure", ts, value));
                prop_assert!(store.len("pressure").unwrap() <= capacity);
            }

            let window = store.window("pressure", i64::MIN, i64::MAX).unwrap();
            for pair in window.windows(2) {
                prop_assert!(pair[0].timestamp_ms < pair[1].timestamp_ms);
            }
        }
    }
}
