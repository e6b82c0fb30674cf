//! Mock construction helpers

use std::sync::Arc;
use ventilator_console::config::ConsoleConfig;
use ventilator_console::device::{ScriptedConnector, ScriptedLink};
use ventilator_console::monitoring::NullActuator;
use ventilator_console::{MonitorReceiver, VentilatorConsole};

/// Config with no settle delay and a fast poll cadence
pub fn fast_config() -> ConsoleConfig {
    let mut config = ConsoleConfig::default();
    config.serial.settle_delay_ms = 0;
    config.poll.interval_ms = 2;
    config.poll.stats_interval_ms = 20;
    config.poll.max_consecutive_failures = 0;
    config
}

/// Console wired to a scripted link, with the link handle for assertions
pub fn scripted_console(
    config: ConsoleConfig,
) -> (VentilatorConsole, MonitorReceiver, ScriptedConnector, ScriptedLink) {
    let link = ScriptedLink::new();
    let connector = ScriptedConnector::new(link.clone());
    let (console, monitor) = VentilatorConsole::new(
        config,
        Arc::new(connector.clone()),
        Box::new(NullActuator::new()),
    );
    (console, monitor, connector, link)
}
