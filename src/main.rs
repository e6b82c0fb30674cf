//! Ventilator Console - Main Entry Point
//!
//! Headless operator console: runs a ventilation session against the
//! controller (or a simulated one) and prints telemetry, plus the bedside
//! calculators and a serial port listing.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{select, Receiver};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ventilator_console::{
    clinical::{self, Sex},
    config::{ConsoleConfig, LoggingConfig},
    device::{list_ports, LinkConnector},
    monitoring::{AlarmActuator, NullActuator},
    ConsoleMessage, SerialPortConnector, Settings, SimulatedConnector, TelemetryEvent,
    VentilationMode, VentilatorConsole,
};

#[derive(Parser, Debug)]
#[command(name = "ventilator-console", version)]
#[command(about = "Operator console for a serial-attached mechanical ventilator")]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, overrides RUST_LOG and the config file
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a ventilation session and monitor it
    Run(RunArgs),
    /// Bedside calculators
    #[command(subcommand)]
    Calc(CalcCommand),
    /// List serial ports
    Ports {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to this path
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Ventilation mode
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Serial device path
    #[arg(short, long)]
    port: Option<String>,

    /// Breaths per minute
    #[arg(long)]
    frequency: Option<u32>,

    /// Tidal volume in mL
    #[arg(long)]
    tidal_volume: Option<u32>,

    /// Inspiratory pause fraction
    #[arg(long)]
    pause: Option<f64>,

    /// I:E ratio denominator (1:N)
    #[arg(long)]
    ie: Option<u32>,

    /// PIP target in cm H2O
    #[arg(long)]
    pip: Option<u32>,

    /// Trigger threshold for the assisted modes
    #[arg(long, allow_hyphen_values = true)]
    trigger: Option<f64>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Print notifications as JSON lines
    #[arg(long)]
    json: bool,

    /// Talk to a simulated controller instead of the serial port
    #[arg(long)]
    simulate: bool,

    /// Do not drive the alarm output
    #[arg(long)]
    no_alarm_output: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    /// Continuous mandatory ventilation
    Cmv,
    /// Assisted, pressure trigger
    Pressure,
    /// Assisted, flow trigger
    Flow,
}

impl From<ModeArg> for VentilationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Cmv => VentilationMode::ContinuousMandatory,
            ModeArg::Pressure => VentilationMode::AssistedPressure,
            ModeArg::Flow => VentilationMode::AssistedFlow,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SexArg {
    Male,
    Female,
}

impl From<SexArg> for Sex {
    fn from(sex: SexArg) -> Self {
        match sex {
            SexArg::Male => Sex::Male,
            SexArg::Female => Sex::Female,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CalcCommand {
    /// Tidal volume from predicted body weight
    TidalVolume {
        /// Height in cm
        #[arg(long)]
        height: f64,
        #[arg(long, value_enum)]
        sex: SexArg,
        /// Prescription in mL per kg of predicted body weight
        #[arg(long, default_value = "6")]
        ml_per_kg: f64,
    },
    /// Air and oxygen flows for a target FiO2
    Blender {
        /// Total flow in L/min
        #[arg(long)]
        flow: f64,
        /// Target FiO2 in percent
        #[arg(long)]
        fio2: f64,
    },
}

impl RunArgs {
    /// Flags over the configured defaults
    fn settings(&self, defaults: &Settings) -> Settings {
        let mut settings = *defaults;
        if let Some(mode) = self.mode {
            settings = settings.with_mode(mode.into());
        }
        if let Some(frequency) = self.frequency {
            settings = settings.with_frequency(frequency);
        }
        if let Some(tidal_volume) = self.tidal_volume {
            settings = settings.with_tidal_volume(tidal_volume);
        }
        if let Some(pause) = self.pause {
            settings = settings.with_inspiratory_pause(pause);
        }
        if let Some(ie) = self.ie {
            settings = settings.with_ie_ratio_denominator(ie);
        }
        if let Some(pip) = self.pip {
            settings = settings.with_pip_target(pip);
        }
        if let Some(trigger) = self.trigger {
            settings = settings.with_trigger_threshold(trigger);
        }
        settings
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConsoleConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging, cli.log_filter.as_deref());

    match cli.command {
        Command::Run(args) => run_session(config, args),
        Command::Calc(calc) => run_calc(calc),
        Command::Ports { json } => print_ports(json),
        Command::Config { save } => print_config(&config, save),
    }
}

/// Install the stderr layer and, if configured, a daily rolling file layer
fn init_logging(logging: &LoggingConfig, filter_override: Option<&str>) -> Option<WorkerGuard> {
    let filter = match filter_override {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&logging.filter)),
    };

    let (file_layer, guard) = match &logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ventilator-console.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

// ===== run =====

/// Operator input read from stdin while a session runs
#[derive(Debug)]
enum OperatorCommand {
    Reset,
    Stop,
    Status,
    Update(Vec<String>),
}

impl OperatorCommand {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        match words.next()? {
            "reset" => Some(OperatorCommand::Reset),
            "stop" | "quit" => Some(OperatorCommand::Stop),
            "status" => Some(OperatorCommand::Status),
            "update" => Some(OperatorCommand::Update(words.map(str::to_string).collect())),
            other => {
                eprintln!(
                    "Unknown command {:?} (reset | stop | status | update key=value ...)",
                    other
                );
                None
            }
        }
    }
}

/// Forward parsed stdin lines; the channel closes at end of input
fn spawn_operator_input() -> Receiver<OperatorCommand> {
    let (tx, rx) = crossbeam_channel::bounded(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if let Some(cmd) = OperatorCommand::parse(&line) {
                if tx.send(cmd).is_err() {
                    break;
                }
            }
        }
    });
    rx
}

fn run_session(mut config: ConsoleConfig, args: RunArgs) -> Result<()> {
    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }
    let settings = args.settings(&config.defaults);

    let connector: Arc<dyn LinkConnector> = if args.simulate {
        config.serial.settle_delay_ms = 0;
        Arc::new(SimulatedConnector::new())
    } else {
        Arc::new(SerialPortConnector)
    };
    let actuator: Box<dyn AlarmActuator> = if args.simulate || args.no_alarm_output {
        Box::new(NullActuator::new())
    } else {
        config
            .alarm
            .open_actuator()
            .context("Failed to open alarm output (use --no-alarm-output to skip)")?
    };

    tracing::info!("Starting ventilator console on {}", config.serial.port);
    let (mut console, monitor) = VentilatorConsole::new(config, connector, actuator);
    console.start(settings).context("Failed to start ventilation")?;

    let operator = spawn_operator_input();
    let no_input = crossbeam_channel::never();
    let mut input_open = true;
    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let ticker = crossbeam_channel::tick(Duration::from_millis(200));
    let mut out = std::io::stdout().lock();

    loop {
        select! {
            recv(monitor.receiver) -> msg => {
                let Ok(msg) = msg else { break };
                print_message(&mut out, &msg, args.json)?;
                if matches!(msg, ConsoleMessage::Completed { .. }) {
                    break;
                }
            }
            recv(if input_open { &operator } else { &no_input }) -> cmd => match cmd {
                Ok(OperatorCommand::Reset) => match console.reset_alarm() {
                    Ok(()) => writeln!(out, "Alarm reset")?,
                    Err(e) => tracing::error!("Alarm reset failed: {}", e),
                },
                Ok(OperatorCommand::Stop) => console.stop(),
                Ok(OperatorCommand::Status) => {
                    let snapshot = console.snapshot();
                    writeln!(
                        out,
                        "active={} alarm={} buffered={} settings={:?}",
                        console.is_active(),
                        console.alarm_latched(),
                        snapshot.len(),
                        console.current_settings()
                    )?;
                }
                Ok(OperatorCommand::Update(assignments)) => {
                    if let Err(e) = apply_update(&mut console, &assignments) {
                        writeln!(out, "Update rejected: {}", e)?;
                    }
                }
                // End of input; keep monitoring
                Err(_) => input_open = false,
            },
            recv(ticker) -> _ => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::info!("Requested duration elapsed");
                    console.stop();
                }
                if !console.is_active() && monitor.receiver.is_empty() {
                    break;
                }
            }
        }
    }

    console.stop();
    for msg in monitor.drain() {
        print_message(&mut out, &msg, args.json)?;
    }
    Ok(())
}

fn apply_update(console: &mut VentilatorConsole, assignments: &[String]) -> Result<()> {
    console.check_active()?;
    let mut settings = console
        .current_settings()
        .context("No active ventilation session")?;
    for assignment in assignments {
        settings = settings.with_assignment(assignment)?;
    }
    console.update(settings)?;
    Ok(())
}

fn print_message(out: &mut impl Write, msg: &ConsoleMessage, json: bool) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string(msg)?)?;
        return Ok(());
    }

    match msg {
        ConsoleMessage::SessionStarted {
            settings,
            started_at,
        } => writeln!(
            out,
            "Started {} at {}: {} bpm, {} mL, PIP {}",
            settings.mode,
            started_at.format("%H:%M:%S"),
            settings.frequency,
            settings.tidal_volume,
            settings.pip_target
        )?,
        ConsoleMessage::Telemetry(event) => writeln!(out, "{}", format_event(event))?,
        ConsoleMessage::SettingsApplied(settings) => writeln!(out, "Applied {:?}", settings)?,
        ConsoleMessage::CommandFailed(error) => writeln!(out, "Command failed: {}", error)?,
        ConsoleMessage::Stats(stats) => tracing::debug!(
            "samples={} rejected={} dropped={} avg_read={:.0}us link_ok={:.1}%",
            stats.samples_delivered,
            stats.rejected_lines(),
            stats.dropped_notifications,
            stats.avg_read_time_us,
            stats.link_success_rate
        ),
        ConsoleMessage::DeviceLost {
            failures,
            last_error,
        } => writeln!(
            out,
            "DEVICE LOST after {} failures: {}",
            failures, last_error
        )?,
        ConsoleMessage::Completed { reason, stats } => writeln!(
            out,
            "Session ended ({}): {} samples, {} rejected lines, {} alarm activations",
            reason,
            stats.samples_delivered,
            stats.rejected_lines(),
            stats.alarm_activations
        )?,
    }
    Ok(())
}

fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

fn format_event(event: &TelemetryEvent) -> String {
    let record = &event.record;
    let mut line = format!(
        concat!(
            "{:7.2}s P {:6.1} F {:6.1} V {:6.0} | PIP {:.0} Plat {:.0} PEEP {:.0} ",
            "| Pmean {} C {} MV {:.2}"
        ),
        event.elapsed_seconds,
        record.pressure_cm_h2o,
        record.flow_lpm,
        record.volume_ml,
        record.peak_inspiratory_pressure,
        record.plateau_pressure,
        record.peep,
        format_metric(event.derived.mean_airway_pressure),
        format_metric(event.derived.compliance_ml_per_cm_h2o),
        event.derived.minute_ventilation_l_per_min
    );
    if event.alarm_latched {
        let conditions = event.alarm.active_conditions();
        line.push_str(" | ALARM");
        if !conditions.is_empty() {
            line.push_str(&format!(" {}", conditions.join(",")));
        }
    }
    if !record.fault_code.is_clear() {
        let sensors = record.fault_code.faulty_sensors();
        if sensors.is_empty() {
            line.push_str(&format!(" | fault {}", record.fault_code));
        } else {
            line.push_str(&format!(
                " | fault {} ({} sensor)",
                record.fault_code,
                sensors.join(", ")
            ));
        }
    }
    line
}

// ===== calc / ports / config =====

fn run_calc(calc: CalcCommand) -> Result<()> {
    match calc {
        CalcCommand::TidalVolume {
            height,
            sex,
            ml_per_kg,
        } => {
            let sex = Sex::from(sex);
            let weight = clinical::predicted_body_weight(height, sex);
            let volume = clinical::tidal_volume_for(height, sex, ml_per_kg)?;
            println!("Predicted body weight: {:.1} kg", weight);
            println!("Tidal volume: {} mL", volume);
        }
        CalcCommand::Blender { flow, fio2 } => {
            let flows = clinical::blender_flows(flow, fio2)?;
            println!("Air flow: {} L/min", flows.air_lpm);
            println!("O2 flow: {} L/min", flows.oxygen_lpm);
        }
    }
    Ok(())
}

fn print_ports(json: bool) -> Result<()> {
    let ports = list_ports()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let detail = [port.manufacturer, port.product, port.serial_number]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        println!("{}\t{}\t{}", port.name, port.kind, detail);
    }
    Ok(())
}

fn print_config(config: &ConsoleConfig, save: Option<PathBuf>) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    if let Some(path) = save {
        config
            .save(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        eprintln!("Saved to {}", path.display());
    }
    Ok(())
}
