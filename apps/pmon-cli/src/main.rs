use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use i2c_transport::{I2cBus, I2cConfig, MockBus, MockHandle};
use power_monitor as pm;
use power_monitor::{Fanout, MetricsHub, MonitorConfig, PollSettings, Poller, SampleRecord};
use sensor_devices::{adc128d818, ina260, Adc128d818, DynSensor, Ina260, SensorKind};

#[derive(Parser, Debug)]
#[command(
    name = "pmon",
    version,
    about = "ADC128D818 + INA260 power monitor",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use the in-process mock bus with demo readings
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Debug logging, including register traffic (RUST_LOG overrides)
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Chip {
    Adc128d818,
    Ina260,
}

impl Chip {
    fn kind(self) -> SensorKind {
        match self {
            Chip::Adc128d818 => SensorKind::Adc128d818,
            Chip::Ina260 => SensorKind::Ina260,
        }
    }

    fn default_address(self) -> u8 {
        match self {
            Chip::Adc128d818 => adc128d818::DEFAULT_ADDRESS,
            Chip::Ina260 => ina260::DEFAULT_ADDRESS,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll the chips a fixed number of times and print or save the records
    Read {
        /// I2C bus number
        #[arg(long, default_value_t = 1u32)]
        bus: u32,
        /// INA260 address (e.g. 0x40); with neither address both defaults are used
        #[arg(long, value_parser = parse_address)]
        ina260: Option<u8>,
        /// ADC128D818 address (e.g. 0x1D)
        #[arg(long, value_parser = parse_address)]
        adc128: Option<u8>,
        /// Number of samples; 0 runs until Ctrl-C
        #[arg(long, default_value_t = 1u64)]
        count: u64,
        /// Seconds between samples
        #[arg(long, default_value_t = 0.0)]
        delay: f64,
        /// Output file (.json/.jsonl, .csv, .prom); status lines on stdout otherwise
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Long-running monitor sending a UDP status line every cycle
    Monitor {
        /// Configuration document (YAML or JSON); stock defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Prometheus textfile rewritten every cycle
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List addresses that acknowledge on a bus
    Scan {
        #[arg(long, default_value_t = 1u32)]
        bus: u32,
    },
    /// Print every register of one chip
    Dump {
        #[arg(long, value_enum)]
        chip: Chip,
        #[arg(long, default_value_t = 1u32)]
        bus: u32,
        /// Chip address; the chip's default when omitted
        #[arg(long, value_parser = parse_address)]
        address: Option<u8>,
    },
    /// Write the default configuration document
    ConfigInit {
        #[arg(long, default_value = "power_monitor.yaml")]
        out: PathBuf,
    },
    /// Print status-line datagrams as they arrive
    UdpListen {
        #[arg(long, short = 'H', default_value = "0.0.0.0")]
        host: String,
        #[arg(long, short = 'p', default_value_t = 9999u16)]
        port: u16,
        /// Stop after this many datagrams
        #[arg(long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.debug);

    match cli.command {
        Commands::Read {
            bus,
            ina260,
            adc128,
            count,
            delay,
            out,
        } => cmd_read(cli.mock, bus, ina260, adc128, count, delay, out.as_deref()).await,
        Commands::Monitor { config, out } => {
            cmd_monitor(cli.mock, config.as_deref(), out.as_deref()).await
        }
        Commands::Scan { bus } => cmd_scan(cli.mock, bus),
        Commands::Dump { chip, bus, address } => cmd_dump(cli.mock, chip, bus, address),
        Commands::ConfigInit { out } => cmd_config_init(&out),
        Commands::UdpListen { host, port, count } => cmd_udp_listen(&host, port, count),
    }
}

fn setup_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn parse_address(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    let addr = parsed.map_err(|e| format!("bad address {s:?}: {e}"))?;
    I2cConfig::new(0, addr)
        .map(|_| addr)
        .map_err(|e| e.to_string())
}

/// Fixed demo values so `--mock` output looks like a live board.
fn seed_demo(kind: SensorKind, h: &MockHandle) {
    match kind {
        SensorKind::Adc128d818 => {
            for ch in 0..8u8 {
                let code = 0x0400 + u16::from(ch) * 0x0100;
                h.set_u16(0x20 + ch, code << 4);
            }
            h.set_u8(0x3E, adc128d818::MANUFACTURER_ID);
            h.set_u8(0x3F, adc128d818::REVISION_ID);
        }
        SensorKind::Ina260 => {
            h.set_u16(0x02, 9600); // 12 V
            h.set_u16(0x01, 400); // 0.5 A
            h.set_u16(0x03, 600); // 6 W
            h.set_u16(0xFE, ina260::MANUFACTURER_ID);
            h.set_u16(0xFF, ina260::DIE_ID);
        }
    }
}

fn open_mock(kind: SensorKind, i2c: &I2cConfig) -> i2c_transport::Result<MockBus> {
    let bus = MockBus::open(i2c)?;
    seed_demo(kind, &bus.handle());
    Ok(bus)
}

fn build_sensors(cfg: &MonitorConfig, mock: bool) -> Result<Vec<DynSensor>> {
    if mock {
        return Ok(cfg.build_sensors(open_mock)?);
    }
    build_hardware_sensors(cfg)
}

#[cfg(feature = "linux")]
fn build_hardware_sensors(cfg: &MonitorConfig) -> Result<Vec<DynSensor>> {
    Ok(cfg.build_sensors(|_, i2c| i2c_transport::LinuxBus::open(i2c))?)
}

#[cfg(not(feature = "linux"))]
fn build_hardware_sensors(_cfg: &MonitorConfig) -> Result<Vec<DynSensor>> {
    anyhow::bail!("built without the linux I2C backend; rebuild with --features linux or pass --mock")
}

/// Run the poller on a blocking thread; Ctrl-C raises the stop flag.
async fn run_poller(mut poller: Poller, mut sink: Fanout) -> Result<pm::PollSummary> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current cycle");
            flag.store(true, Ordering::SeqCst);
        }
    });
    let summary = tokio::task::spawn_blocking(move || {
        let summary = poller.run(&stop, &mut sink);
        poller.close_all();
        summary
    })
    .await
    .context("polling thread")?;
    info!(
        cycles = summary.cycles,
        read_errors = summary.read_errors,
        "polling finished"
    );
    Ok(summary)
}

async fn cmd_read(
    mock: bool,
    bus: u32,
    ina_addr: Option<u8>,
    adc_addr: Option<u8>,
    count: u64,
    delay: f64,
    out: Option<&Path>,
) -> Result<()> {
    let stock = MonitorConfig::defaults();
    let both = ina_addr.is_none() && adc_addr.is_none();
    let mut cfg = MonitorConfig {
        udp: None,
        ..MonitorConfig::default()
    };
    if let Some(mut adc) = stock.adc128d818.filter(|_| both || adc_addr.is_some()) {
        adc.i2c.bus = bus;
        adc.i2c.address = adc_addr.unwrap_or(adc128d818::DEFAULT_ADDRESS);
        cfg.adc128d818 = Some(adc);
    }
    if let Some(mut ina) = stock.ina260.filter(|_| both || ina_addr.is_some()) {
        ina.i2c.bus = bus;
        ina.i2c.address = ina_addr.unwrap_or(ina260::DEFAULT_ADDRESS);
        cfg.ina260 = Some(ina);
    }
    cfg.validate()?;

    let settings = PollSettings::new(count, delay)?;
    let metrics = MetricsHub::new()?;
    let mut poller = Poller::new(build_sensors(&cfg, mock)?, settings).with_metrics(metrics.clone());
    poller.configure_all()?;

    let sink = match out {
        Some(path) => Fanout::new().with(pm::sink_for_path(path, &metrics)?),
        None => Fanout::new().with(Box::new(pm::StdoutSink)),
    };
    run_poller(poller, sink).await?;
    Ok(())
}

async fn cmd_monitor(mock: bool, config: Option<&Path>, out: Option<&Path>) -> Result<()> {
    let cfg = match config {
        Some(path) => MonitorConfig::load(path)?,
        None => {
            warn!("no config file specified, using defaults");
            MonitorConfig::defaults()
        }
    };
    let settings = PollSettings::new(cfg.samples, cfg.read_interval_s)?;
    let metrics = MetricsHub::new()?;
    let mut poller = Poller::new(build_sensors(&cfg, mock)?, settings).with_metrics(metrics.clone());
    poller.configure_all()?;

    let mut sink = Fanout::new();
    if let Some(udp) = &cfg.udp {
        sink.push(Box::new(pm::UdpSink::new(&udp.host, udp.port)?));
    }
    if let Some(path) = out.or(cfg.prom_out.as_deref()) {
        sink.push(Box::new(pm::PromFileSink::new(path, metrics.clone())));
    }
    if sink.is_empty() {
        sink.push(Box::new(pm::StdoutSink));
    }
    run_poller(poller, sink).await?;
    Ok(())
}

fn cmd_scan(mock: bool, bus: u32) -> Result<()> {
    let found = if mock {
        vec![adc128d818::DEFAULT_ADDRESS, ina260::DEFAULT_ADDRESS]
    } else {
        scan_hardware(bus)?
    };
    for addr in &found {
        println!("0x{addr:02X}");
    }
    info!(bus, count = found.len(), "scan complete");
    Ok(())
}

#[cfg(feature = "linux")]
fn scan_hardware(bus: u32) -> Result<Vec<u8>> {
    Ok(i2c_transport::LinuxBus::scan(bus)?)
}

#[cfg(not(feature = "linux"))]
fn scan_hardware(_bus: u32) -> Result<Vec<u8>> {
    anyhow::bail!("built without the linux I2C backend; rebuild with --features linux or pass --mock")
}

fn dump_registers<B: I2cBus>(chip: Chip, bus: B) -> Result<Vec<(&'static str, u16)>> {
    let regs = match chip {
        Chip::Adc128d818 => Adc128d818::new(bus).registers().dump_all()?,
        Chip::Ina260 => Ina260::new(bus).registers().dump_all()?,
    };
    Ok(regs)
}

fn cmd_dump(mock: bool, chip: Chip, bus: u32, address: Option<u8>) -> Result<()> {
    let i2c = I2cConfig::new(bus, address.unwrap_or(chip.default_address()))?;
    let regs = if mock {
        dump_registers(chip, open_mock(chip.kind(), &i2c)?)?
    } else {
        dump_hardware(chip, &i2c)?
    };
    println!("{} at {i2c}", chip.kind().as_str());
    for (name, value) in regs {
        println!("  {name:<14} 0x{value:04X}");
    }
    Ok(())
}

#[cfg(feature = "linux")]
fn dump_hardware(chip: Chip, i2c: &I2cConfig) -> Result<Vec<(&'static str, u16)>> {
    dump_registers(chip, i2c_transport::LinuxBus::open(i2c)?)
}

#[cfg(not(feature = "linux"))]
fn dump_hardware(_chip: Chip, _i2c: &I2cConfig) -> Result<Vec<(&'static str, u16)>> {
    anyhow::bail!("built without the linux I2C backend; rebuild with --features linux or pass --mock")
}

fn cmd_config_init(out: &Path) -> Result<()> {
    MonitorConfig::defaults().save(out)?;
    println!("wrote {}", out.display());
    Ok(())
}

fn hexdump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn cmd_udp_listen(host: &str, port: u16, count: Option<u64>) -> Result<()> {
    let sock = UdpSocket::bind((host, port)).with_context(|| format!("binding {host}:{port}"))?;
    println!("listening on {host}:{port}, Ctrl-C to stop");
    let mut buf = vec![0u8; 65_535];
    let mut received = 0u64;
    while count.map_or(true, |n| received < n) {
        let (n, src) = sock.recv_from(&mut buf)?;
        received += 1;
        let data = &buf[..n];
        let ts = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        let text = String::from_utf8_lossy(data);
        println!("[{ts}] from {src} ({n} bytes)");
        println!("TEXT:\n{text}");
        println!("HEX:\n{}", hexdump(data));
        match SampleRecord::parse_status_line(&text) {
            Ok(rec) => {
                println!("FIELDS:");
                println!("  {:<14} {:.3}", "timestamp", rec.timestamp);
                for (name, v) in pm::FIELD_NAMES.iter().zip(rec.positional()) {
                    match v {
                        Some(v) => println!("  {name:<14} {v:.4}"),
                        None => println!("  {name:<14} -"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "not a status line"),
        }
        println!("{}", "-".repeat(60));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address("0x40").unwrap(), 0x40);
        assert_eq!(parse_address("29").unwrap(), 0x1D);
        assert!(parse_address("0x02").is_err());
        assert!(parse_address("0xZZ").is_err());
    }

    #[test]
    fn test_hexdump() {
        assert_eq!(hexdump(b"1, 2"), "31 2c 20 32");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["pmon", "--mock", "read", "--ina260", "0x41", "--count", "3"])
            .unwrap();
        assert!(cli.mock);
        match cli.command {
            Commands::Read { ina260, adc128, count, .. } => {
                assert_eq!(ina260, Some(0x41));
                assert_eq!(adc128, None);
                assert_eq!(count, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_mock_dump_reads_seeded_ids() {
        let i2c = I2cConfig::new(1, 0x40).unwrap();
        let regs = dump_registers(Chip::Ina260, open_mock(SensorKind::Ina260, &i2c).unwrap())
            .unwrap();
        assert!(regs.contains(&("MFG_ID", 0x5449)));
        assert!(regs.contains(&("BUS_VOLTAGE", 9600)));
    }
}
