//! Byte-stream link to the ventilator controller
//!
//! [`SerialLink`] is the seam between the session logic and the transport.
//! The real implementation wraps a serial port; tests and the `--simulate`
//! mode plug in scripted or simulated links through [`LinkConnector`].

use crate::config::SerialConfig;
use crate::error::Result;
use std::collections::VecDeque;

/// Size of the rolling window for recent read times
const RECENT_WINDOW_SIZE: usize = 100;

/// One open connection to the controller
pub trait SerialLink: Send {
    /// Write every byte and flush
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read up to and including the next `\n`
    ///
    /// Blocks for at most the configured read timeout. A timeout surfaces as
    /// an IO error of kind `TimedOut`. The terminator is kept in the
    /// returned text; undecodable bytes are replaced, not rejected.
    fn read_line(&mut self) -> Result<String>;

    /// Drop anything received but not yet read
    fn discard_input(&mut self) -> Result<()>;

    /// Release the link; further calls are undefined
    fn close(&mut self);

    /// Human-readable name for logs
    fn description(&self) -> String;
}

/// Opens links from the serial configuration
pub trait LinkConnector: Send + Sync {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>>;
}

/// Timing statistics for line reads on a link
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// Lines read successfully
    pub successful_reads: u64,
    /// Reads that failed at the link level
    pub failed_reads: u64,
    /// Total read time in microseconds
    pub total_read_time_us: u64,
    /// Last read time in microseconds
    pub last_read_time_us: u64,
    /// Bytes received
    pub total_bytes_read: u64,
    /// Bytes sent
    pub total_bytes_written: u64,
    /// Minimum read time observed (microseconds)
    pub min_read_time_us: u64,
    /// Maximum read time observed (microseconds)
    pub max_read_time_us: u64,
    /// Rolling window of recent read times for jitter calculation
    pub recent_read_times: VecDeque<u64>,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            successful_reads: 0,
            failed_reads: 0,
            total_read_time_us: 0,
            last_read_time_us: 0,
            total_bytes_read: 0,
            total_bytes_written: 0,
            min_read_time_us: u64::MAX,
            max_read_time_us: 0,
            recent_read_times: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl LinkStats {
    /// Average read time in microseconds
    pub fn avg_read_time_us(&self) -> f64 {
        if self.successful_reads == 0 {
            0.0
        } else {
            self.total_read_time_us as f64 / self.successful_reads as f64
        }
    }

    /// Success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_reads + self.failed_reads;
        if total == 0 {
            100.0
        } else {
            (self.successful_reads as f64 / total as f64) * 100.0
        }
    }

    pub fn record_success(&mut self, time_us: u64, bytes: u64) {
        self.successful_reads += 1;
        self.total_read_time_us += time_us;
        self.last_read_time_us = time_us;
        self.total_bytes_read += bytes;
        self.min_read_time_us = self.min_read_time_us.min(time_us);
        self.max_read_time_us = self.max_read_time_us.max(time_us);

        self.recent_read_times.push_back(time_us);
        if self.recent_read_times.len() > RECENT_WINDOW_SIZE {
            self.recent_read_times.pop_front();
        }
    }

    pub fn record_failure(&mut self) {
        self.failed_reads += 1;
    }

    pub fn record_write(&mut self, bytes: u64) {
        self.total_bytes_written += bytes;
    }

    /// Max minus min over the recent window, in microseconds
    pub fn jitter_us(&self) -> u64 {
        let min = self.recent_read_times.iter().min().copied().unwrap_or(0);
        let max = self.recent_read_times.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
