//! Heatmiser CLI - poll and configure thermostats behind a UH1 hub
//!
//! Works against a real hub (serial or TCP) or against the built-in virtual
//! bus started with `simulate`.

use clap::{Parser, Subcommand, ValueEnum};
use heatmiser_core::cli::{parse_setting, print_exit_codes, CliResult, ExitCodes, SETTING_USAGE};
use heatmiser_core::config::{self, DeviceConfig, HubConfig, LoggingConfig};
use heatmiser_core::core::device::DeviceState;
use heatmiser_core::core::hub::{Hub, PollOutcome};
use heatmiser_core::core::protocol::dcb::{Model, Register};
use heatmiser_core::core::simulator::{self, VirtualBus, VirtualThermostat};
use heatmiser_core::core::transport::list_ports;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Heatmiser CLI
#[derive(Parser, Debug)]
#[command(
    name = "heatmiser-cli",
    version,
    about = "Heatmiser V3 thermostats behind a UH1 hub",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "HEATMISER_CONFIG")]
    config: Option<PathBuf>,

    /// Link address, overriding the config file
    #[arg(short, long, global = true, env = "HEATMISER_ADDRESS")]
    address: Option<String>,

    /// Device as ID[:MODEL], replacing the configured list (repeatable)
    #[arg(short, long = "device", global = true, value_parser = parse_device)]
    devices: Vec<DeviceConfig>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Record every frame to this file (.jsonl for JSON lines)
    #[arg(long, global = true)]
    trace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    Ports,

    /// Read every configured thermostat once
    Poll,

    /// Poll repeatedly until Ctrl-C
    Watch {
        /// Seconds between polls
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },

    /// Read one attribute
    Get {
        /// Device id
        id: u8,
        /// Attribute name, e.g. target_temperature or room-temperature
        attribute: Register,
    },

    /// Write a setting
    #[command(after_help = SETTING_USAGE)]
    Set {
        /// Device id
        id: u8,
        /// Setting and value(s)
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        setting: Vec<String>,
    },

    /// Set thermostat clocks from the local time
    SyncClock {
        /// Device id (all devices when omitted)
        id: Option<u8>,
    },

    /// Serve a virtual UH1 hub over TCP
    Simulate {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:1024")]
        listen: String,
    },

    /// Print the exit code table
    ExitCodes,

    /// Show configuration and version
    Info,
}

fn parse_device(s: &str) -> Result<DeviceConfig, String> {
    let (id, model) = match s.split_once(':') {
        Some((id, model)) => (id, model.parse::<Model>()?),
        None => (s, Model::Prt),
    };
    let id = id.parse::<u8>().map_err(|_| format!("invalid device id: {id}"))?;
    Ok(DeviceConfig::new(id, "", model))
}

fn load_config(cli: &Cli) -> Result<HubConfig, config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => HubConfig::load_from(path)?,
        None => HubConfig::load()?,
    };
    if let Some(address) = &cli.address {
        config.address.clone_from(address);
    }
    if !cli.devices.is_empty() {
        config.devices.clone_from(&cli.devices);
    }
    if cli.trace.is_some() {
        config.logging.trace_file.clone_from(&cli.trace);
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(cli: &Cli, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = if logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file, guard) = match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .or_else(config::log_dir)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map_or_else(|| "heatmiser.log".into(), |n| n.to_os_string());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    guard
}

/// Ctrl-C as something a task can wait on
fn stop_signal() -> anyhow::Result<Arc<Notify>> {
    let stop = Arc::new(Notify::new());
    let notify = Arc::clone(&stop);
    ctrlc::set_handler(move || notify.notify_one())?;
    Ok(stop)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::ExitCodes) {
        print_exit_codes();
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };
    let _guard = init_logging(&cli, &config.logging);

    let result = match run(&cli, &config).await {
        Ok(result) => result,
        Err(e) => CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
    };

    if let Some(msg) = result.message() {
        if !result.is_success() {
            eprintln!("Error: {msg}");
        } else if !cli.quiet {
            eprintln!("{msg}");
        }
    }
    result.to_exit_code()
}

async fn run(cli: &Cli, config: &HubConfig) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::Ports => list_serial_ports(cli),
        Commands::Simulate { listen } => simulate(config, listen).await,
        Commands::Info => show_info(cli, config),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
        command => {
            let hub = match Hub::open(config).await {
                Ok(hub) => hub,
                Err(e) => return Ok(e.into()),
            };
            let result = match command {
                Commands::Poll => poll(cli, config, &hub).await,
                Commands::Watch { interval } => watch(cli, config, &hub, *interval).await,
                Commands::Get { id, attribute } => get(cli, &hub, *id, *attribute).await,
                Commands::Set { id, setting } => set(&hub, *id, setting).await,
                Commands::SyncClock { id } => sync_clock(&hub, *id).await,
                _ => Ok(CliResult::success()),
            };
            hub.close().await;
            result
        }
    }
}

fn list_serial_ports(cli: &Cli) -> anyhow::Result<CliResult> {
    let ports = list_ports()?;

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if ports.is_empty() && !cli.quiet {
                println!("No serial ports found.");
            }
            for port in &ports {
                println!("{} [{:?}]", port.port_name, port.port_type);
            }
        }
    }
    Ok(CliResult::success())
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn on_off(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "on",
        Some(false) => "off",
        None => "-",
    }
}

fn summary(state: &DeviceState) -> String {
    let mut line = format!(
        "target {}°C  room {}°C  heat {}  holiday {}h",
        or_dash(state.target_temperature()),
        or_dash(state.room_temperature().map(|t| format!("{t:.1}"))),
        on_off(state.heat_status()),
        or_dash(state.holiday_hours()),
    );
    if state.model.has_hot_water() {
        line.push_str(&format!("  hot water {}", on_off(state.hot_water_status())));
    }
    line
}

fn print_poll(cli: &Cli, config: &HubConfig, hub: &Hub, results: &BTreeMap<u8, PollOutcome>) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = hub
                .devices()
                .iter()
                .map(|state| {
                    let error = match results.get(&state.id) {
                        Some(PollOutcome::Offline(e)) => Some(e.to_string()),
                        _ => None,
                    };
                    serde_json::json!({
                        "id": state.id,
                        "name": config.device(state.id).map(DeviceConfig::display_name),
                        "model": state.model,
                        "online": state.online,
                        "error": error,
                        "target_temperature": state.target_temperature(),
                        "room_temperature": state.room_temperature(),
                        "heat_status": state.heat_status(),
                        "hot_water_status": state.hot_water_status(),
                        "holiday_hours": state.holiday_hours(),
                        "last_updated": state.last_updated,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            for state in hub.devices() {
                let name = config
                    .device(state.id)
                    .map_or_else(|| format!("Thermostat {}", state.id), DeviceConfig::display_name);
                match results.get(&state.id) {
                    Some(PollOutcome::Offline(e)) => {
                        println!("{:>3} {:<16} {:<6} offline  {e}", state.id, name, state.model);
                    }
                    _ => println!("{:>3} {:<16} {:<6} online   {}", state.id, name, state.model, summary(&state)),
                }
            }
        }
    }
    Ok(())
}

fn poll_result(results: &BTreeMap<u8, PollOutcome>) -> CliResult {
    let mut offline = results.values().filter_map(|r| match r {
        PollOutcome::Offline(e) => Some(e),
        PollOutcome::Online(_) => None,
    });
    let Some(first) = offline.next() else {
        return CliResult::success();
    };
    if first.is_link_fault() {
        return first.into();
    }
    let count = 1 + offline.count();
    CliResult::error(ExitCodes::PARTIAL, format!("{count} of {} devices offline", results.len()))
}

async fn poll(cli: &Cli, config: &HubConfig, hub: &Hub) -> anyhow::Result<CliResult> {
    let results = hub.poll_all().await;
    print_poll(cli, config, hub, &results)?;
    Ok(poll_result(&results))
}

async fn watch(cli: &Cli, config: &HubConfig, hub: &Hub, interval: u64) -> anyhow::Result<CliResult> {
    let stop = stop_signal()?;
    let interval = Duration::from_secs(interval.max(1));

    loop {
        let results = hub.poll_all().await;
        if cli.format == OutputFormat::Text && !cli.quiet {
            println!("--- {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        }
        print_poll(cli, config, hub, &results)?;

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = stop.notified() => break,
        }
    }
    Ok(CliResult::error(ExitCodes::CANCELLED, "stopped"))
}

async fn get(cli: &Cli, hub: &Hub, id: u8, attribute: Register) -> anyhow::Result<CliResult> {
    if let Err(e) = hub.poll(id).await {
        // Fall through to the cached value if there is one
        tracing::warn!(device = id, "read failed: {e}");
        if hub.device(id).is_none() {
            return Ok(e.into());
        }
    }

    let Some(reading) = hub.get_attribute(id, attribute) else {
        return Ok(CliResult::error(
            ExitCodes::ERROR,
            format!("{attribute} not available for device {id}"),
        ));
    };

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reading)?),
        OutputFormat::Text => {
            let stale = if reading.stale { " (stale)" } else { "" };
            println!("{}{stale}", reading.value);
        }
    }
    Ok(CliResult::success())
}

async fn set(hub: &Hub, id: u8, words: &[String]) -> anyhow::Result<CliResult> {
    let setting = match parse_setting(words) {
        Ok(setting) => setting,
        Err(e) => return Ok(CliResult::invalid_args(e)),
    };
    Ok(match hub.write_attribute(id, setting.clone()).await {
        Ok(()) => CliResult::success_with_message(format!("device {id}: {setting}")),
        Err(e) => e.into(),
    })
}

async fn sync_clock(hub: &Hub, id: Option<u8>) -> anyhow::Result<CliResult> {
    let ids = id.map_or_else(|| hub.device_ids().to_vec(), |id| vec![id]);
    let mut failure = None;
    for id in ids {
        match hub.sync_clock(id).await {
            Ok(()) => tracing::info!(device = id, "clock set"),
            Err(e) => {
                tracing::error!(device = id, "clock sync failed: {e}");
                failure.get_or_insert(e);
            }
        }
    }
    Ok(failure.map_or_else(CliResult::success, CliResult::from))
}

async fn simulate(config: &HubConfig, listen: &str) -> anyhow::Result<CliResult> {
    let devices = if config.devices.is_empty() {
        vec![(1, Model::Prt), (2, Model::PrtHw)]
    } else {
        config.device_list()
    };

    let bus = VirtualBus::new();
    for (id, model) in devices {
        bus.add(VirtualThermostat::new(id, model));
    }

    let listener = tokio::net::TcpListener::bind(listen).await?;
    let stop = stop_signal()?;
    tokio::select! {
        result = simulator::serve(bus, listener) => result?,
        () = stop.notified() => tracing::info!("virtual UH1 stopped"),
    }
    Ok(CliResult::success())
}

fn show_info(cli: &Cli, config: &HubConfig) -> anyhow::Result<CliResult> {
    let config_path = cli.config.clone().or_else(config::default_config_path);
    let info = serde_json::json!({
        "name": heatmiser_core::NAME,
        "version": heatmiser_core::VERSION,
        "config_file": config_path,
        "address": config.address,
        "devices": config.devices,
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH
    });

    match cli.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        OutputFormat::Text => {
            println!("heatmiser-cli v{}", heatmiser_core::VERSION);
            println!("Platform: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
            if let Some(path) = config_path {
                println!("Config:   {}", path.display());
            }
            println!("Address:  {}", config.address);
            println!();
            for device in &config.devices {
                println!("  {:>3} {:<16} {}", device.id, device.display_name(), device.model);
            }
        }
    }
    Ok(CliResult::success())
}
