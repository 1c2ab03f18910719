use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{Config, TemplateStore};
use crate::drivers::jk_bms::frame_sync::FrameKind;
use crate::drivers::jk_bms::layout::decode_live_frame;
use crate::drivers::{
    build_driver, DriverKind, JkBmsDriver, JkBmsMode, JkBmsSettings, ModbusDriver, SerialSettings,
    TransportEndpoint,
};
use crate::output::{formatter_for, ConsoleSender, FileSender, LogSender, PublishingSink};
use crate::services::DataService;
use crate::utils::error::ModbusError;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

pub fn build_cli() -> Command {
    Command::new("energy_collector")
        .version(crate::VERSION)
        .about("Polls inverters, meters and battery systems over Modbus and JK BMS links")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value(DEFAULT_CONFIG_PATH)
                .global(true)
                .help("Configuration file"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .help("Overrides the configured log level"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .global(true)
                .value_parser(["json", "console"])
                .help("Reading output format"),
        )
        .arg(
            Arg::new("output-file")
                .short('o')
                .long("output-file")
                .value_name("FILE")
                .global(true)
                .help("Append readings to this file as JSON lines"),
        )
        .subcommand(Command::new("run").about("Poll all equipment until Ctrl-C (default)"))
        .subcommand(Command::new("once").about("Poll every equipment once and print readings"))
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(
            Command::new("read")
                .about("Read raw holding registers from one device")
                .arg(Arg::new("path").long("path").required(true).help("host:port or serial device"))
                .arg(
                    Arg::new("driver")
                        .long("driver")
                        .default_value("modbus_tcp")
                        .help("modbus_tcp, modbus_rtu, raw_tcp_rtu or jk_bms"),
                )
                .arg(
                    Arg::new("unit")
                        .long("unit")
                        .default_value("1")
                        .value_parser(clap::value_parser!(u8)),
                )
                .arg(
                    Arg::new("address")
                        .long("address")
                        .required(true)
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("count")
                        .long("count")
                        .default_value("1")
                        .value_parser(clap::value_parser!(u16).range(1..=125)),
                )
                .arg(
                    Arg::new("timeout-ms")
                        .long("timeout-ms")
                        .default_value("3000")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("bms-listen")
                .about("Capture one JK BMS live frame and print it decoded")
                .arg(Arg::new("path").long("path").required(true).help("host:port or serial device"))
                .arg(
                    Arg::new("active")
                        .long("active")
                        .action(ArgAction::SetTrue)
                        .help("Trigger the broadcast instead of waiting for it"),
                ),
        )
}

/// Level precedence: `--log-level`, then the config file, then `RUST_LOG`, then `info`.
pub fn init_logging(cli_level: Option<&str>, config_level: &str) {
    let env = env_logger::Env::default().default_filter_or("info");
    let mut builder = env_logger::Builder::from_env(env);

    if let Some(level) = cli_level.or_else(|| Some(config_level).filter(|l| !l.trim().is_empty())) {
        builder.parse_filters(level);
    }
    builder.format_timestamp_millis().init();
}

/// Loads the config file; commands that poll configured equipment require it.
pub fn load_config(path: &str, required: bool) -> Result<Config, ModbusError> {
    if !required && !Path::new(path).exists() {
        return Ok(Config::default());
    }
    Config::from_file(path)
}

pub fn needs_config(matches: &ArgMatches) -> bool {
    matches!(matches.subcommand_name(), None | Some("run") | Some("once"))
}

/// Builds the reading sink from `[output]`, with CLI flags taking precedence.
pub fn build_sink(
    config: &Config,
    format: Option<&str>,
    output_file: Option<&str>,
) -> Result<PublishingSink, ModbusError> {
    let format = format.unwrap_or(&config.output.format);
    let formatter = formatter_for(format)
        .ok_or_else(|| ModbusError::ConfigError(format!("unknown output format '{}'", format)))?;
    info!("🎨 Using {} formatter", formatter.name());

    let mut sink = PublishingSink::new(config.collector_id.clone(), formatter);
    if config.output.console {
        sink = sink.with_sender(Box::new(ConsoleSender));
    }
    if config.output.log {
        sink = sink.with_sender(Box::new(LogSender));
    }
    if let Some(path) = output_file.or(config.output.file.as_deref()) {
        info!("📝 Adding file output: {}", path);
        sink = sink.with_sender(Box::new(FileSender::new(path)));
    }
    if sink.senders().next().is_none() {
        warn!("⚠️  No output destinations enabled, readings will be discarded");
    }
    Ok(sink)
}

pub async fn handle_subcommands(matches: &ArgMatches, config: Config) -> Result<(), ModbusError> {
    match matches.subcommand() {
        Some(("ports", _)) => list_serial_ports(),
        Some(("read", sub)) => read_raw(sub).await,
        Some(("bms-listen", sub)) => bms_listen(sub).await,
        Some(("once", _)) => {
            info!("🔍 Executing once command...");
            let mut service = build_service(matches, config)?;
            let result = service.read_all_once().await;
            service.pool().close_all().await;
            match result? {
                0 => Err(ModbusError::CommunicationError("no equipment returned data".to_string())),
                _ => Ok(()),
            }
        }
        _ => run_service(matches, config).await,
    }
}

fn build_service(matches: &ArgMatches, config: Config) -> Result<DataService, ModbusError> {
    let sink = build_sink(
        &config,
        matches.get_one::<String>("format").map(String::as_str),
        matches.get_one::<String>("output-file").map(String::as_str),
    )?;
    let store = TemplateStore::new(&config.templates_dir);
    DataService::new(config, &store, Arc::new(sink))
}

async fn run_service(matches: &ArgMatches, config: Config) -> Result<(), ModbusError> {
    let service = build_service(matches, config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        let _ = shutdown_tx.send(true);
    });

    service.run(shutdown_rx).await
}

fn list_serial_ports() -> Result<(), ModbusError> {
    println!("📡 Available Serial Ports:");

    let ports = serialport::available_ports()
        .map_err(|e| ModbusError::ConnectionError(format!("cannot enumerate serial ports: {}", e)))?;
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
        return Ok(());
    }

    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port.port_name);
        if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
            println!("      🔌 USB {:04x}:{:04x}", usb.vid, usb.pid);
            if let Some(manufacturer) = &usb.manufacturer {
                println!("      📱 Manufacturer: {}", manufacturer);
            }
            if let Some(serial_number) = &usb.serial_number {
                println!("      🔢 Serial Number: {}", serial_number);
            }
        }
    }
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a String, ModbusError> {
    matches
        .get_one::<String>(id)
        .ok_or_else(|| ModbusError::ConfigError(format!("--{} is required", id)))
}

async fn read_raw(matches: &ArgMatches) -> Result<(), ModbusError> {
    let endpoint = TransportEndpoint::parse(required(matches, "path")?)?;
    let kind: DriverKind = required(matches, "driver")?.parse()?;
    let unit = matches.get_one::<u8>("unit").copied().unwrap_or(1);
    let address = matches
        .get_one::<u16>("address")
        .copied()
        .ok_or_else(|| ModbusError::ConfigError("--address is required".to_string()))?;
    let count = matches.get_one::<u16>("count").copied().unwrap_or(1);
    let timeout = Duration::from_millis(matches.get_one::<u64>("timeout-ms").copied().unwrap_or(3000));

    let serial = if kind == DriverKind::JkBms {
        SerialSettings::jk_bms()
    } else {
        SerialSettings::default()
    };
    let mut driver = build_driver(kind, endpoint, &serial, &JkBmsSettings::default())?;
    driver.connect(timeout).await?;
    info!("📖 Reading {} registers from {} unit {} at {}", count, driver.endpoint(), unit, address);

    let result = tokio::time::timeout(timeout + Duration::from_secs(1), driver.read_registers(address, count, unit))
        .await
        .map_err(ModbusError::from)
        .and_then(|r| r);
    let values = match result {
        Ok(values) => values,
        Err(e) => {
            driver.abort();
            return Err(e);
        }
    };
    driver.disconnect().await;

    for (offset, value) in values.iter().enumerate() {
        println!(
            "{:>5}: 0x{:04X}  {:>5}  {:>6}",
            address as usize + offset,
            value,
            value,
            *value as i16
        );
    }
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    println!("raw: {}", hex::encode(bytes));
    Ok(())
}

async fn bms_listen(matches: &ArgMatches) -> Result<(), ModbusError> {
    let endpoint = TransportEndpoint::parse(required(matches, "path")?)?;
    let settings = JkBmsSettings {
        mode: if matches.get_flag("active") {
            JkBmsMode::Active
        } else {
            JkBmsMode::Passive
        },
        ..JkBmsSettings::default()
    };

    let mut driver = JkBmsDriver::new(endpoint, SerialSettings::jk_bms(), settings);
    driver.connect(Duration::from_secs(5)).await?;
    println!("👂 Waiting for a live frame from {}...", driver.endpoint());

    let frame = driver.capture_frame(FrameKind::Live).await;
    driver.disconnect().await;
    let values = decode_live_frame(&frame?)?;

    let width = values.keys().map(String::len).max().unwrap_or(0);
    for (name, value) in &values {
        println!("   {:<width$} : {}", name, value, width = width);
    }
    Ok(())
}
