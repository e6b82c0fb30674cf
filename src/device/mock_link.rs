//! Links that need no hardware
//!
//! - [`ScriptedLink`] replays queued replies and records every write, for
//!   tests that assert on the exact bytes the console sends.
//! - [`SimulatedVentilator`] answers poll requests with generated breaths,
//!   for the `--simulate` mode and benchmarks.

use super::link_trait::{LinkConnector, SerialLink};
use crate::config::SerialConfig;
use crate::error::{Result, SessionError};
use crate::protocol::{encode_telemetry, parse_command, DeviceCommand};
use crate::types::{FaultCode, Settings, TelemetryRecord};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

// ===== Scripted link =====

/// What the next `read_line` returns
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Line(String),
    Timeout,
    Error(io::ErrorKind),
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<ScriptedReply>,
    written: Vec<Vec<u8>>,
    discards: u32,
    closed: bool,
    fail_writes: bool,
}

/// Link that replays a script and records writes
///
/// Clones share state, so a test keeps one handle while the session owns
/// another. An exhausted script reads as a timeout.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLink {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply line; a missing `\n` is added
    pub fn push_line(&self, line: impl Into<String>) -> &Self {
        let mut line = line.into();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.lock().replies.push_back(ScriptedReply::Line(line));
        self
    }

    /// Queue a reply exactly as given
    pub fn push_reply(&self, reply: ScriptedReply) -> &Self {
        self.lock().replies.push_back(reply);
        self
    }

    /// Queue the same line `count` times
    pub fn push_repeated(&self, line: &str, count: usize) -> &Self {
        for _ in 0..count {
            self.push_line(line);
        }
        self
    }

    /// Make subsequent writes fail with a broken pipe
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Replies not yet consumed
    pub fn pending_replies(&self) -> usize {
        self.lock().replies.len()
    }

    /// Every write, one entry per `write_all` call
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// All writes concatenated as text
    pub fn written_text(&self) -> String {
        let state = self.lock();
        state
            .written
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }

    /// Writes decoded back into commands; undecodable chunks are skipped
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.written()
            .iter()
            .filter_map(|chunk| parse_command(chunk).ok())
            .collect()
    }

    pub fn discards(&self) -> u32 {
        self.lock().discards
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl SerialLink for ScriptedLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure").into());
        }
        state.written.push(bytes.to_vec());
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        match self.lock().replies.pop_front() {
            Some(ScriptedReply::Line(line)) => Ok(line),
            Some(ScriptedReply::Error(kind)) => {
                Err(io::Error::new(kind, "scripted read failure").into())
            }
            Some(ScriptedReply::Timeout) | None => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "scripted read timeout").into())
            }
        }
    }

    fn discard_input(&mut self) -> Result<()> {
        self.lock().discards += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }

    fn description(&self) -> String {
        "scripted".to_string()
    }
}

/// Connector handing out clones of one [`ScriptedLink`]
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    link: ScriptedLink,
    refuse: bool,
    opens: Arc<AtomicU32>,
}

impl ScriptedConnector {
    pub fn new(link: ScriptedLink) -> Self {
        Self {
            link,
            refuse: false,
            opens: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Connector whose every open fails as if the device were absent
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Successful opens so far
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl LinkConnector for ScriptedConnector {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>> {
        if self.refuse {
            return Err(SessionError::Connection(format!(
                "No such device: {}",
                config.port
            )));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.link.clone()))
    }
}

// ===== Simulated ventilator =====

/// PEEP the simulator holds during expiration
const SIMULATED_PEEP: f64 = 5.0;

/// Amplitude of the noise added to waveforms
const NOISE_AMPLITUDE: f64 = 0.3;

/// Software stand-in for the controller firmware
///
/// Parses the commands the console writes and answers each poll request
/// with a telemetry line for the current phase of a square-flow breath.
pub struct SimulatedVentilator {
    settings: Option<Settings>,
    started: Instant,
    pending: VecDeque<String>,
    fault_code: FaultCode,
    seed: u64,
}

impl Default for SimulatedVentilator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedVentilator {
    pub fn new() -> Self {
        Self {
            settings: None,
            started: Instant::now(),
            pending: VecDeque::new(),
            fault_code: FaultCode::default(),
            seed: 12345,
        }
    }

    /// Report a fixed fault code in every record
    pub fn with_fault_code(mut self, code: FaultCode) -> Self {
        self.fault_code = code;
        self
    }

    /// Settings last received, if ventilating
    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    fn noise(&mut self) -> f64 {
        let mut s = self.seed;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.seed = s;
        ((s as f64) / (u64::MAX as f64) - 0.5) * 2.0 * NOISE_AMPLITUDE
    }

    /// Record for the breath phase `elapsed` seconds into ventilation
    pub fn record_at(&mut self, settings: &Settings, elapsed: f64) -> TelemetryRecord {
        let frequency = settings.frequency.max(1) as f64;
        let ie = if settings.mode.uses_trigger() {
            2.0
        } else {
            settings.ie_ratio_denominator.max(1) as f64
        };
        let period = 60.0 / frequency;
        let inspiration = period / (1.0 + ie);
        let phase = elapsed % period;
        let tidal = settings.tidal_volume as f64;
        let pip = settings.pip_target as f64;

        let (pressure, flow, volume) = if phase < inspiration {
            let progress = phase / inspiration;
            let flow = tidal / inspiration * 60.0 / 1000.0;
            (
                SIMULATED_PEEP + (pip - SIMULATED_PEEP) * progress,
                flow,
                tidal * progress,
            )
        } else {
            let decay = (-(phase - inspiration) / (0.2 * period)).exp();
            (
                SIMULATED_PEEP,
                -tidal * decay / (0.2 * period) * 60.0 / 1000.0,
                tidal * decay,
            )
        };

        TelemetryRecord {
            pressure_cm_h2o: pressure + self.noise(),
            flow_lpm: flow + self.noise(),
            volume_ml: volume,
            frequency_bpm: frequency,
            ie_ratio: ie,
            peak_inspiratory_pressure: pip - 1.0,
            plateau_pressure: pip - 4.0,
            peep: SIMULATED_PEEP,
            fault_code: self.fault_code.clone(),
        }
    }

    fn handle(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Start(settings) => {
                tracing::debug!("Simulator starting {}", settings.mode);
                self.settings = Some(settings);
                self.started = Instant::now();
            }
            DeviceCommand::Update(settings) => {
                tracing::debug!("Simulator updating {}", settings.mode);
                self.settings = Some(settings);
            }
            DeviceCommand::PollRequest => {
                if let Some(settings) = self.settings {
                    let elapsed = self.started.elapsed().as_secs_f64();
                    let record = self.record_at(&settings, elapsed);
                    self.pending.push_back(encode_telemetry(&record));
                }
            }
            DeviceCommand::Stop => {
                self.settings = None;
                self.pending.clear();
            }
        }
    }
}

impl SerialLink for SimulatedVentilator {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match parse_command(bytes) {
            Ok(command) => self.handle(command),
            Err(e) => tracing::warn!(
                "Simulator ignored {:?}: {}",
                String::from_utf8_lossy(bytes),
                e
            ),
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        self.pending
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "simulator idle").into())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.settings = None;
    }

    fn description(&self) -> String {
        "simulated ventilator".to_string()
    }
}

/// Connector opening a fresh [`SimulatedVentilator`] per session
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    fault_code: FaultCode,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault_code(mut self, code: FaultCode) -> Self {
        self.fault_code = code;
        self
    }
}

impl LinkConnector for SimulatedConnector {
    fn open(&self, _config: &SerialConfig) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(
            SimulatedVentilator::new().with_fault_code(self.fault_code.clone()),
        ))
    }
}
