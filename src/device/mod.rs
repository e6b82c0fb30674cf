//! Device communication for the ventilator controller
//!
//! All serial traffic happens on a background poll thread so the operator
//! interface never blocks on the link. The pieces:
//!
//! - [`VentilatorConsole`] - operator-facing facade: start, update, stop,
//!   alarm reset and waveform snapshots
//! - [`MonitorReceiver`] - UI-side handle receiving [`ConsoleMessage`]s
//! - [`DeviceSession`] - connection state machine and wire exchanges
//! - [`PollLoop`] - the background loop driving one session
//! - [`SerialLink`] / [`LinkConnector`] - transport seam, implemented by
//!   [`SerialPortLink`], [`ScriptedLink`] and [`SimulatedVentilator`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ventilator_console::config::ConsoleConfig;
//! use ventilator_console::device::{ConsoleMessage, SerialPortConnector, VentilatorConsole};
//! use ventilator_console::monitoring::NullActuator;
//! use ventilator_console::types::{Settings, VentilationMode};
//!
//! let (mut console, monitor) = VentilatorConsole::new(
//!     ConsoleConfig::default(),
//!     Arc::new(SerialPortConnector),
//!     Box::new(NullActuator::new()),
//! );
//! console.start(Settings::new(VentilationMode::ContinuousMandatory))?;
//!
//! for msg in monitor.drain() {
//!     if let ConsoleMessage::Telemetry(event) = msg {
//!         println!("{:.1} cmH2O", event.record.pressure_cm_h2o);
//!     }
//! }
//! console.stop();
//! # Ok::<(), ventilator_console::error::SessionError>(())
//! ```

pub mod link_trait;
pub mod mock_link;
pub mod serial;
pub mod session;
pub mod worker;

pub use link_trait::{LinkConnector, LinkStats, SerialLink};
pub use mock_link::{
    ScriptedConnector, ScriptedLink, ScriptedReply, SimulatedConnector, SimulatedVentilator,
};
pub use serial::{list_ports, PortInfo, SerialPortConnector, SerialPortLink};
pub use session::{DeviceSession, PollReply};
pub use worker::{CancellationToken, LoopOutcome, PollCommand, PollLoop, StopReason};

use crate::config::ConsoleConfig;
use crate::error::{Result, SessionError};
use crate::monitoring::{AlarmActuator, AlarmLatch, BufferSnapshot, SharedBuffer};
use crate::types::{SessionStats, Settings, TelemetryEvent};
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Capacity of the per-session command channel
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Message sent from the console to the UI
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConsoleMessage {
    /// A session was started
    SessionStarted {
        settings: Settings,
        started_at: DateTime<Local>,
    },
    /// A decoded sample with derived metrics and alarm verdict
    Telemetry(TelemetryEvent),
    /// The device accepted new settings
    SettingsApplied(Settings),
    /// A queued command could not be sent
    CommandFailed(String),
    /// Periodic statistics
    Stats(SessionStats),
    /// The link failed past the consecutive-failure cap
    DeviceLost { failures: u32, last_error: String },
    /// The poll loop exited and the device was stopped
    Completed {
        reason: StopReason,
        stats: SessionStats,
    },
}

/// UI-side receiver for console messages
pub struct MonitorReceiver {
    pub receiver: Receiver<ConsoleMessage>,
}

impl MonitorReceiver {
    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Option<ConsoleMessage> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for a message
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ConsoleMessage> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Receive all pending messages
    pub fn drain(&self) -> Vec<ConsoleMessage> {
        self.receiver.try_iter().collect()
    }
}

struct ActiveSession {
    applied: Arc<Mutex<Settings>>,
    cancel: CancellationToken,
    command_tx: Sender<PollCommand>,
    handle: JoinHandle<LoopOutcome>,
}

/// Operator-facing entry point
///
/// At most one session runs at a time. Dropping the console stops it.
pub struct VentilatorConsole {
    config: ConsoleConfig,
    connector: Arc<dyn LinkConnector>,
    alarm: AlarmLatch,
    buffer: SharedBuffer,
    message_tx: Sender<ConsoleMessage>,
    active: Option<ActiveSession>,
    /// Failure count and last link error of a session that ended by device loss
    lost: Option<(u32, String)>,
}

impl VentilatorConsole {
    /// Create a console and its message receiver
    pub fn new(
        config: ConsoleConfig,
        connector: Arc<dyn LinkConnector>,
        actuator: Box<dyn AlarmActuator>,
    ) -> (Self, MonitorReceiver) {
        // Bounded so a stalled UI cannot grow memory; the poll loop drops instead
        let (message_tx, receiver) = bounded(config.poll.channel_capacity.max(1));
        let buffer = SharedBuffer::new(config.buffer.window_seconds);

        let console = Self {
            config,
            connector,
            alarm: AlarmLatch::new(actuator),
            buffer,
            message_tx,
            active: None,
            lost: None,
        };
        (console, MonitorReceiver { receiver })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Start a session with the given settings
    ///
    /// Blocks for the settle delay while the link opens. Fails with
    /// [`SessionError::AlreadyActive`] if a session is still running.
    pub fn start(&mut self, settings: Settings) -> Result<()> {
        self.reap_finished();
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let mut session = DeviceSession::new(
            Arc::clone(&self.connector),
            self.config.serial.clone(),
            self.config.poll.warmup_replies,
        );
        session.start(&settings)?;
        self.buffer.clear();

        let (command_tx, command_rx) = bounded(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let poll_loop = PollLoop::new(
            session,
            self.config.poll.clone(),
            self.config.alarm.thresholds(),
            self.buffer.clone(),
            self.alarm.clone(),
            command_rx,
            self.message_tx.clone(),
            cancel.clone(),
        );

        let applied = poll_loop.applied_settings();
        self.lost = None;

        if self
            .message_tx
            .try_send(ConsoleMessage::SessionStarted {
                settings,
                started_at: Local::now(),
            })
            .is_err()
        {
            tracing::warn!("Session start notice dropped, receiver full or gone");
        }

        let handle = std::thread::Builder::new()
            .name("poll-loop".to_string())
            .spawn(move || poll_loop.run())
            .map_err(|e| SessionError::Io(e).with_context("Failed to spawn poll thread"))?;

        self.active = Some(ActiveSession {
            applied,
            cancel,
            command_tx,
            handle,
        });
        Ok(())
    }

    /// Send new settings to the running session
    ///
    /// The update is written between two polls; the outcome arrives as
    /// [`ConsoleMessage::SettingsApplied`] or [`ConsoleMessage::CommandFailed`].
    pub fn update(&mut self, settings: Settings) -> Result<()> {
        self.check_active()?;
        let active = self.active.as_ref().ok_or(SessionError::NotActive)?;
        active
            .command_tx
            .send(PollCommand::Update(settings))
            .map_err(|e| SessionError::Channel(format!("poll loop gone: {}", e)))
    }

    /// Fail unless a session is running
    ///
    /// A session that ended because the device stopped answering reports
    /// [`SessionError::DeviceLost`] until the next start.
    pub fn check_active(&mut self) -> Result<()> {
        self.reap_finished();
        if self.active.is_some() {
            return Ok(());
        }
        match &self.lost {
            Some((failures, last_error)) => Err(SessionError::DeviceLost {
                failures: *failures,
                last_error: last_error.clone(),
            }),
            None => Err(SessionError::NotActive),
        }
    }

    /// Stop the running session and wait for the device to be halted
    ///
    /// Does nothing when no session is running.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        match active.handle.join() {
            Ok(outcome) => {
                tracing::info!(
                    "Session stopped ({}) after {} samples",
                    outcome.reason,
                    outcome.stats.samples_delivered
                );
                if let Some(SessionError::DeviceLost {
                    failures,
                    last_error,
                }) = outcome.device_lost
                {
                    self.lost = Some((failures, last_error));
                }
            }
            Err(_) => tracing::error!("Poll thread panicked"),
        }
        self.buffer.clear();
    }

    /// Silence the alarm output
    pub fn reset_alarm(&self) -> Result<()> {
        self.alarm.reset()
    }

    pub fn alarm_latched(&self) -> bool {
        self.alarm.is_latched()
    }

    pub fn alarm(&self) -> &AlarmLatch {
        &self.alarm
    }

    /// Waveform buffer contents for rendering
    pub fn snapshot(&self) -> BufferSnapshot {
        self.buffer.snapshot()
    }

    /// Whether a poll loop is still running
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    /// Settings the device has acknowledged for the running session
    pub fn current_settings(&self) -> Option<Settings> {
        self.active
            .as_ref()
            .filter(|active| !active.handle.is_finished())
            .map(|active| *active.applied.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Join a loop that ended on its own (device lost)
    fn reap_finished(&mut self) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.handle.is_finished())
        {
            self.stop();
        }
    }
}

impl Drop for VentilatorConsole {
    fn drop(&mut self) {
        self.stop();
    }
}
