//! Rolling waveform buffer
//!
//! Holds the last [`DEFAULT_WINDOW_SECONDS`] of (time, pressure, volume,
//! flow) samples for the waveform display. During warm-up the buffer grows;
//! once a sample's session time exceeds the window, each push evicts exactly
//! one sample from the front, so the steady-state length is set by the
//! sampling rate rather than by elapsed time.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default display window in seconds
pub const DEFAULT_WINDOW_SECONDS: f64 = 10.0;

/// One point of the three waveforms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveformSample {
    /// Seconds since the session started
    pub elapsed_seconds: f64,
    /// Airway pressure in cm H2O
    pub pressure: f64,
    /// Volume in mL
    pub volume: f64,
    /// Flow in L/min
    pub flow: f64,
}

impl WaveformSample {
    pub fn new(elapsed_seconds: f64, pressure: f64, volume: f64, flow: f64) -> Self {
        Self {
            elapsed_seconds,
            pressure,
            volume,
            flow,
        }
    }
}

/// Column-wise copy of the buffer for a renderer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub times: Vec<f64>,
    pub pressures: Vec<f64>,
    pub volumes: Vec<f64>,
    pub flows: Vec<f64>,
}

impl BufferSnapshot {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Pressure series as plot points
    pub fn pressure_points(&self) -> Vec<[f64; 2]> {
        zip_points(&self.times, &self.pressures)
    }

    /// Volume series as plot points
    pub fn volume_points(&self) -> Vec<[f64; 2]> {
        zip_points(&self.times, &self.volumes)
    }

    /// Flow series as plot points
    pub fn flow_points(&self) -> Vec<[f64; 2]> {
        zip_points(&self.times, &self.flows)
    }
}

fn zip_points(times: &[f64], values: &[f64]) -> Vec<[f64; 2]> {
    times.iter().zip(values).map(|(&t, &v)| [t, v]).collect()
}

/// Fixed time-window sample buffer
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: VecDeque<WaveformSample>,
    window_seconds: f64,
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECONDS)
    }
}

impl RollingBuffer {
    /// Create an empty buffer with the given window
    pub fn new(window_seconds: f64) -> Self {
        Self {
            samples: VecDeque::new(),
            window_seconds,
        }
    }

    /// Window length in seconds
    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    /// Append a sample, evicting the oldest once past the window
    ///
    /// A sample older than the newest one is dropped and `false` returned.
    pub fn push(&mut self, sample: WaveformSample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.elapsed_seconds < last.elapsed_seconds {
                tracing::warn!(
                    "Dropping out-of-order waveform sample at {:.3}s (newest {:.3}s)",
                    sample.elapsed_seconds,
                    last.elapsed_seconds
                );
                return false;
            }
        }

        if sample.elapsed_seconds > self.window_seconds {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    /// Remove every sample
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time between the oldest and newest sample
    pub fn span(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => last.elapsed_seconds - first.elapsed_seconds,
            _ => 0.0,
        }
    }

    /// Copy out the four series
    pub fn snapshot(&self) -> BufferSnapshot {
        let mut snapshot = BufferSnapshot {
            times: Vec::with_capacity(self.samples.len()),
            pressures: Vec::with_capacity(self.samples.len()),
            volumes: Vec::with_capacity(self.samples.len()),
            flows: Vec::with_capacity(self.samples.len()),
        };
        for sample in &self.samples {
            snapshot.times.push(sample.elapsed_seconds);
            snapshot.pressures.push(sample.pressure);
            snapshot.volumes.push(sample.volume);
            snapshot.flows.push(sample.flow);
        }
        snapshot
    }
}

/// Buffer shared between the poll thread (writer) and the UI (readers)
///
/// A snapshot is copied under a single read lock, so the four series always
/// describe the same instant.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<RwLock<RollingBuffer>>,
}

impl SharedBuffer {
    pub fn new(window_seconds: f64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RollingBuffer::new(window_seconds))),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RollingBuffer> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RollingBuffer> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, sample: WaveformSample) -> bool {
        self.write().push(sample)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        self.read().snapshot()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CADENCE: f64 = 0.06;

    fn sample(t: f64) -> WaveformSample {
        WaveformSample::new(t, t * 2.0, t * 3.0, t * 4.0)
    }

    #[test]
    fn test_grows_during_warm_up() {
        let mut buffer = RollingBuffer::default();
        for i in 0..100 {
            buffer.push(sample(i as f64 * CADENCE));
        }
        assert_eq!(buffer.len(), 100);
    }

    #[test]
    fn test_window_bounds_span_and_length() {
        let mut buffer = RollingBuffer::default();
        let mut lengths = Vec::new();

        let steps = (15.0 / CADENCE) as usize;
        for i in 0..=steps {
            buffer.push(sample(i as f64 * CADENCE));
            assert!(
                buffer.span() <= DEFAULT_WINDOW_SECONDS,
                "span {} exceeds window",
                buffer.span()
            );
            if i as f64 * CADENCE > DEFAULT_WINDOW_SECONDS {
                lengths.push(buffer.len());
            }
        }

        // Past the warm-up every push is paired with one eviction
        assert!(!lengths.is_empty());
        assert!(lengths.iter().all(|&len| len == lengths[0]));
        let expected = (DEFAULT_WINDOW_SECONDS / CADENCE).round() as usize;
        assert!(lengths[0].abs_diff(expected) <= 1);
    }

    #[test]
    fn test_rejects_out_of_order_sample() {
        let mut buffer = RollingBuffer::default();
        assert!(buffer.push(sample(1.0)));
        assert!(!buffer.push(sample(0.5)));
        assert_eq!(buffer.len(), 1);
        assert!(buffer.push(sample(1.0)));
    }

    #[test]
    fn test_snapshot_is_column_wise() {
        let mut buffer = RollingBuffer::default();
        buffer.push(sample(0.0));
        buffer.push(sample(0.5));

        let snap = buffer.snapshot();
        assert_eq!(snap.times, vec![0.0, 0.5]);
        assert_eq!(snap.pressures, vec![0.0, 1.0]);
        assert_eq!(snap.volumes, vec![0.0, 1.5]);
        assert_eq!(snap.flows, vec![0.0, 2.0]);
        assert_eq!(snap.pressure_points(), vec![[0.0, 0.0], [0.5, 1.0]]);
    }

    #[test]
    fn test_clear() {
        let shared = SharedBuffer::new(DEFAULT_WINDOW_SECONDS);
        shared.push(sample(0.0));
        shared.push(sample(0.1));
        assert_eq!(shared.len(), 2);

        shared.clear();
        assert!(shared.is_empty());
        assert!(shared.snapshot().is_empty());
    }

    #[test]
    fn test_shared_handles_see_same_buffer() {
        let writer = SharedBuffer::new(DEFAULT_WINDOW_SECONDS);
        let reader = writer.clone();
        writer.push(sample(0.2));
        assert_eq!(reader.snapshot().times, vec![0.2]);
    }
}
