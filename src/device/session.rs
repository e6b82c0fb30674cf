//! Device session state machine
//!
//! `Disconnected -> Connected -> Active -> Disconnected`. A session owns
//! the link while it is open and tracks how many warm-up replies are still
//! owed before telemetry is trusted.

use super::link_trait::{LinkConnector, LinkStats, SerialLink};
use crate::config::SerialConfig;
use crate::error::{Result, ResultExt, SessionError};
use crate::protocol::{decode_telemetry, encode_poll_request, encode_start_or_update, encode_stop};
use crate::types::{SessionState, Settings, TelemetryRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one poll exchange
#[derive(Debug, Clone, PartialEq)]
pub enum PollReply {
    /// A warm-up reply was read and discarded
    Primed,
    /// A decoded telemetry record
    Record(TelemetryRecord),
}

/// One connection to the controller, from open to close
pub struct DeviceSession {
    connector: Arc<dyn LinkConnector>,
    serial: SerialConfig,
    warmup_replies: u32,
    link: Option<Box<dyn SerialLink>>,
    state: SessionState,
    settings: Option<Settings>,
    warmup_remaining: u32,
    started_at: Option<Instant>,
    stats: LinkStats,
}

impl DeviceSession {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        serial: SerialConfig,
        warmup_replies: u32,
    ) -> Self {
        Self {
            connector,
            serial,
            warmup_replies,
            link: None,
            state: SessionState::Disconnected,
            settings: None,
            warmup_remaining: 0,
            started_at: None,
            stats: LinkStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Settings last written to the device
    pub fn settings(&self) -> Option<Settings> {
        self.settings
    }

    /// Warm-up replies still to be discarded
    pub fn warmup_remaining(&self) -> u32 {
        self.warmup_remaining
    }

    /// Time since the start command was written
    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn link_stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn link_description(&self) -> Option<String> {
        self.link.as_ref().map(|link| link.description())
    }

    /// Open the link, wait for the controller to settle, send the start command
    ///
    /// On failure the link is released and the session stays disconnected.
    pub fn start(&mut self, settings: &Settings) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::AlreadyActive);
        }

        let mut link = self.connector.open(&self.serial)?;
        self.state = SessionState::Connected;
        tracing::info!("Connected to {}", link.description());

        // The controller resets when the port opens and ignores early bytes
        std::thread::sleep(self.serial.settle_delay());

        let command = encode_start_or_update(settings, false);
        if let Err(e) = link.write_all(&command) {
            link.close();
            self.state = SessionState::Disconnected;
            return Err(e.with_context("Failed to send start command"));
        }
        self.stats.reset();
        self.stats.record_write(command.len() as u64);

        if let Err(e) = link.discard_input() {
            tracing::warn!("Failed to flush input after start: {}", e);
        }

        tracing::info!(
            "Started {} at {} bpm, {} mL",
            settings.mode,
            settings.frequency,
            settings.tidal_volume
        );

        self.link = Some(link);
        self.settings = Some(*settings);
        self.warmup_remaining = self.warmup_replies;
        self.started_at = Some(Instant::now());
        self.state = SessionState::Active;
        Ok(())
    }

    /// Send new settings to the running device
    pub fn update(&mut self, settings: &Settings) -> Result<()> {
        let link = match (&self.state, self.link.as_mut()) {
            (SessionState::Active, Some(link)) => link,
            _ => return Err(SessionError::NotActive),
        };

        let command = encode_start_or_update(settings, true);
        link.write_all(&command)
            .context("Failed to send settings update")?;
        self.stats.record_write(command.len() as u64);
        self.settings = Some(*settings);

        tracing::info!("Applied {} update: {:?}", settings.mode, settings);
        Ok(())
    }

    /// One request/reply exchange
    ///
    /// While warm-up replies are owed this reads and discards one and
    /// returns [`PollReply::Primed`]; a failed warm-up read still counts.
    pub fn poll_once(&mut self) -> Result<PollReply> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        let link = self.link.as_mut().ok_or(SessionError::NotActive)?;

        let request = encode_poll_request();
        link.write_all(&request)?;
        self.stats.record_write(request.len() as u64);

        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            match link.read_line() {
                Ok(line) => tracing::trace!("Discarded warm-up reply {:?}", line),
                Err(e) => tracing::debug!("Warm-up read failed: {}", e),
            }
            return Ok(PollReply::Primed);
        }

        let read_start = Instant::now();
        let line = match link.read_line() {
            Ok(line) => line,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };
        self.stats
            .record_success(read_start.elapsed().as_micros() as u64, line.len() as u64);

        Ok(PollReply::Record(decode_telemetry(&line)?))
    }

    /// Halt the device and release the link
    ///
    /// Flushes input, sends the stop command and closes. Failures are logged
    /// and the session always ends disconnected. Safe to call again.
    pub fn stop(&mut self) {
        let Some(mut link) = self.link.take() else {
            self.state = SessionState::Disconnected;
            return;
        };

        if let Err(e) = link.discard_input() {
            tracing::warn!("Failed to flush input before stop: {}", e);
        }
        let command = encode_stop();
        match link.write_all(&command) {
            Ok(()) => self.stats.record_write(command.len() as u64),
            Err(e) => tracing::error!("Failed to send stop command: {}", e),
        }
        link.close();

        tracing::info!("Session on {} stopped", link.description());
        self.state = SessionState::Disconnected;
        self.settings = None;
        self.warmup_remaining = 0;
        self.started_at = None;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock_link::{ScriptedConnector, ScriptedLink, ScriptedReply};
    use crate::error::DecodeError;
    use crate::protocol::DeviceCommand;
    use crate::types::VentilationMode;
    use std::io;

    const GOOD_LINE: &str = "12.5,30.1,450,20,2,19,18,5,000";

    fn session_with(link: &ScriptedLink) -> DeviceSession {
        let serial = SerialConfig {
            settle_delay_ms: 0,
            ..Default::default()
        };
        DeviceSession::new(Arc::new(ScriptedConnector::new(link.clone())), serial, 2)
    }

    #[test]
    fn test_start_sends_command_and_activates() {
        let link = ScriptedLink::new();
        let mut session = session_with(&link);
        let settings = Settings::new(VentilationMode::ContinuousMandatory);

        session.start(&settings).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.warmup_remaining(), 2);
        assert_eq!(link.written_text(), "C,20,450,0.5,2,20\n");
        assert_eq!(link.discards(), 1);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let link = ScriptedLink::new();
        let mut session = session_with(&link);
        let settings = Settings::default();
        session.start(&settings).unwrap();
        assert!(matches!(
            session.start(&settings),
            Err(SessionError::AlreadyActive)
        ));
    }

    #[test]
    fn test_start_with_absent_device() {
        let mut session = DeviceSession::new(
            Arc::new(ScriptedConnector::refusing()),
            SerialConfig::default(),
            2,
        );
        let result = session.start(&Settings::default());
        assert!(matches!(result, Err(SessionError::Connection(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_start_write_failure_releases_link() {
        let link = ScriptedLink::new();
        link.set_fail_writes(true);
        let mut session = session_with(&link);
        assert!(session.start(&Settings::default()).is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(link.is_closed());
    }

    #[test]
    fn test_update_requires_active() {
        let link = ScriptedLink::new();
        let mut session = session_with(&link);
        assert!(matches!(
            session.update(&Settings::default()),
            Err(SessionError::NotActive)
        ));
        assert!(link.written().is_empty());
    }

    #[test]
    fn test_update_uses_prefix() {
        let link = ScriptedLink::new();
        let mut session = session_with(&link);
        session.start(&Settings::default()).unwrap();
        let new = Settings::default().with_frequency(18);
        session.update(&new).unwrap();

        assert_eq!(link.commands().last(), Some(&DeviceCommand::Update(new)));
        assert_eq!(session.settings(), Some(new));
    }

    #[test]
    fn test_warm_up_replies_are_discarded() {
        let link = ScriptedLink::new();
        link.push_line("garbage")
            .push_reply(ScriptedReply::Timeout)
            .push_line(GOOD_LINE);
        let mut session = session_with(&link);
        session.start(&Settings::default()).unwrap();

        assert_eq!(session.poll_once().unwrap(), PollReply::Primed);
        assert_eq!(session.poll_once().unwrap(), PollReply::Primed);
        match session.poll_once().unwrap() {
            PollReply::Record(record) => assert_eq!(record.volume_ml, 450.0),
            other => panic!("expected record, got {:?}", other),
        }
        let polls = link
            .commands()
            .iter()
            .filter(|c| **c == DeviceCommand::PollRequest)
            .count();
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_poll_errors() {
        let link = ScriptedLink::new();
        link.push_line("1,2,3")
            .push_reply(ScriptedReply::Error(io::ErrorKind::BrokenPipe));
        let serial = SerialConfig {
            settle_delay_ms: 0,
            ..Default::default()
        };
        let mut session =
            DeviceSession::new(Arc::new(ScriptedConnector::new(link.clone())), serial, 0);
        session.start(&Settings::default()).unwrap();

        match session.poll_once() {
            Err(SessionError::Decode(DecodeError::MalformedRecord { found, .. })) => {
                assert_eq!(found, 3)
            }
            other => panic!("expected malformed record, got {:?}", other),
        }
        assert!(session.poll_once().unwrap_err().is_link_failure());
        assert_eq!(session.link_stats().failed_reads, 1);
        assert_eq!(session.link_stats().successful_reads, 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let link = ScriptedLink::new();
        let mut session = session_with(&link);
        session.start(&Settings::default()).unwrap();

        session.stop();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(link.is_closed());
        assert!(link.written_text().ends_with("22\n"));
        let writes = link.written().len();

        session.stop();
        assert_eq!(link.written().len(), writes);
        assert!(matches!(session.poll_once(), Err(SessionError::NotActive)));
    }

    #[test]
    fn test_drop_stops_device() {
        let link = ScriptedLink::new();
        {
            let mut session = session_with(&link);
            session.start(&Settings::default()).unwrap();
        }
        assert_eq!(link.commands().last(), Some(&DeviceCommand::Stop));
    }
}
