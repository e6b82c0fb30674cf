//! Background poll loop
//!
//! Runs on its own thread for the lifetime of one session. Each iteration:
//!
//! 1. sleeps the poll interval,
//! 2. applies pending settings updates,
//! 3. performs one exchange (warm-up or telemetry),
//! 4. derives metrics, evaluates alarms and appends to the waveform buffer,
//! 5. checks for cancellation.
//!
//! Cancellation is checked on every iteration including warm-up and failed
//! ones. On exit the buffer is cleared and the device stopped before a
//! [`ConsoleMessage::Completed`] is published.

use super::session::{DeviceSession, PollReply};
use super::ConsoleMessage;
use crate::config::PollConfig;
use crate::error::{DecodeError, SessionError};
use crate::monitoring::{evaluate, AlarmLatch, AlarmThresholds, SharedBuffer, WaveformSample};
use crate::types::{DerivedSample, SessionStats, Settings, TelemetryEvent, TelemetryRecord};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// How a loop ended, returned when its thread is joined
#[derive(Debug)]
pub struct LoopOutcome {
    pub reason: StopReason,
    pub stats: SessionStats,
    /// Set when the loop gave up on the device
    pub device_lost: Option<SessionError>,
}

/// Requests from the console to a running loop
#[derive(Debug, Clone, PartialEq)]
pub enum PollCommand {
    Update(Settings),
}

/// Why a poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The operator stopped the session
    Cancelled,
    /// The link failed too many times in a row
    DeviceLost,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::DeviceLost => write!(f, "device lost"),
        }
    }
}

/// Cooperative stop flag shared between the console and one poll loop
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The loop itself; consumed by [`PollLoop::run`]
pub struct PollLoop {
    session: DeviceSession,
    config: PollConfig,
    thresholds: AlarmThresholds,
    buffer: SharedBuffer,
    alarm: AlarmLatch,
    command_rx: Receiver<PollCommand>,
    message_tx: Sender<ConsoleMessage>,
    cancel: CancellationToken,
    stats: SessionStats,
    last_stats_time: Instant,
    last_link_error: String,
    applied: Arc<Mutex<Settings>>,
}

impl PollLoop {
    /// Wrap an already started session
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: DeviceSession,
        config: PollConfig,
        thresholds: AlarmThresholds,
        buffer: SharedBuffer,
        alarm: AlarmLatch,
        command_rx: Receiver<PollCommand>,
        message_tx: Sender<ConsoleMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let applied = Arc::new(Mutex::new(session.settings().unwrap_or_default()));
        Self {
            session,
            config,
            thresholds,
            buffer,
            alarm,
            command_rx,
            message_tx,
            cancel,
            stats: SessionStats::default(),
            last_stats_time: Instant::now(),
            last_link_error: String::new(),
            applied,
        }
    }

    /// Settings the device has acknowledged, updated as commands succeed
    pub fn applied_settings(&self) -> Arc<Mutex<Settings>> {
        Arc::clone(&self.applied)
    }

    /// Poll until cancelled or the device is lost, then complete the session
    pub fn run(mut self) -> LoopOutcome {
        tracing::info!(
            "Poll loop started on {}",
            self.session.link_description().unwrap_or_default()
        );

        let reason = loop {
            std::thread::sleep(self.config.interval());

            self.process_commands();

            if self.poll_iteration() {
                break StopReason::DeviceLost;
            }

            if self.last_stats_time.elapsed() >= self.config.stats_interval() {
                self.send_stats();
                self.last_stats_time = Instant::now();
            }

            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
        };

        self.complete(reason)
    }

    /// Apply queued updates between polls
    fn process_commands(&mut self) {
        loop {
            match self.command_rx.try_recv() {
                Ok(PollCommand::Update(settings)) => match self.session.update(&settings) {
                    Ok(()) => {
                        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = settings;
                        self.try_send_message(ConsoleMessage::SettingsApplied(settings));
                    }
                    Err(e) => {
                        tracing::error!("Settings update failed: {}", e);
                        self.try_send_message(ConsoleMessage::CommandFailed(e.to_string()));
                    }
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Console dropped without stopping
                    self.cancel.cancel();
                    break;
                }
            }
        }
    }

    /// One exchange; returns `true` once the failure cap is reached
    fn poll_iteration(&mut self) -> bool {
        match self.session.poll_once() {
            Ok(PollReply::Primed) => {
                self.stats.warmup_discarded += 1;
            }
            Ok(PollReply::Record(record)) => {
                self.stats.consecutive_io_failures = 0;
                self.handle_record(record);
            }
            Err(SessionError::Decode(e)) => {
                // A line arrived, so the link itself is healthy
                self.stats.consecutive_io_failures = 0;
                match e {
                    DecodeError::NumericParse { .. } => self.stats.numeric_errors += 1,
                    _ => self.stats.malformed_records += 1,
                }
                tracing::debug!("Dropped telemetry line: {}", e);
            }
            Err(e) => {
                self.stats.io_errors += 1;
                self.stats.consecutive_io_failures += 1;
                self.last_link_error = e.to_string();
                tracing::warn!(
                    "Link failure {} in a row: {}",
                    self.stats.consecutive_io_failures,
                    e
                );

                let cap = self.config.max_consecutive_failures;
                if cap > 0 && self.stats.consecutive_io_failures >= cap {
                    return true;
                }
            }
        }
        false
    }

    fn handle_record(&mut self, record: TelemetryRecord) {
        let Some(settings) = self.session.settings() else {
            return;
        };
        let elapsed_seconds = self.session.elapsed().as_secs_f64();

        let derived = DerivedSample::from_record(&record);
        let alarm = evaluate(&record, &settings, &self.thresholds);
        let raised = self.alarm.raise(&alarm);
        if raised.newly_latched {
            self.stats.alarm_activations += 1;
        }
        if let Some(e) = raised.output_error {
            tracing::error!("Failed to drive alarm output: {}", e);
        }

        self.buffer.push(WaveformSample::new(
            elapsed_seconds,
            record.pressure_cm_h2o,
            record.volume_ml,
            record.flow_lpm,
        ));

        let event = TelemetryEvent {
            elapsed_seconds,
            record,
            derived,
            alarm,
            alarm_latched: self.alarm.is_latched(),
        };
        if self.try_send_message(ConsoleMessage::Telemetry(event)) {
            self.stats.samples_delivered += 1;
        }
    }

    fn current_stats(&self) -> SessionStats {
        let mut stats = self.stats.clone();
        let link = self.session.link_stats();
        stats.avg_read_time_us = link.avg_read_time_us();
        stats.read_jitter_us = link.jitter_us();
        stats.link_success_rate = link.success_rate();
        stats
    }

    /// Send statistics to the console (using try_send for backpressure)
    fn send_stats(&mut self) {
        let stats = self.current_stats();
        self.try_send_message(ConsoleMessage::Stats(stats));
    }

    /// Try to send a message, counting it as dropped if the queue is full
    fn try_send_message(&mut self, msg: ConsoleMessage) -> bool {
        if self.message_tx.try_send(msg).is_err() {
            self.stats.dropped_notifications += 1;
            false
        } else {
            true
        }
    }

    fn complete(mut self, reason: StopReason) -> LoopOutcome {
        let device_lost = (reason == StopReason::DeviceLost).then(|| SessionError::DeviceLost {
            failures: self.stats.consecutive_io_failures,
            last_error: self.last_link_error.clone(),
        });
        if let Some(lost) = &device_lost {
            tracing::error!("{}", lost);
            self.try_send_message(ConsoleMessage::DeviceLost {
                failures: self.stats.consecutive_io_failures,
                last_error: self.last_link_error.clone(),
            });
        }

        self.buffer.clear();
        self.session.stop();

        let stats = self.current_stats();
        tracing::info!(
            "Poll loop finished ({}): {} samples, {} rejected lines, {} dropped",
            reason,
            stats.samples_delivered,
            stats.rejected_lines(),
            stats.dropped_notifications
        );
        if self
            .message_tx
            .try_send(ConsoleMessage::Completed {
                reason,
                stats: stats.clone(),
            })
            .is_err()
        {
            tracing::warn!("Completion notice dropped, receiver full or gone");
        }
        LoopOutcome {
            reason,
            stats,
            device_lost,
        }
    }
}
