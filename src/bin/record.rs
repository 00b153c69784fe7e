use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use rs485_archiver::channel::{ChannelSettings, SensorAddress};
use rs485_archiver::config::{resolve_db_path, Layout, PollingConfig, StorageConfig};
use rs485_archiver::export::ExportFormat;
use rs485_archiver::liveness::LivenessFlag;
use rs485_archiver::logging::{init_logging, LogTarget};
use rs485_archiver::recorder::Recorder;
use rs485_archiver::scanner::{ProbeKind, ScanOptions, PRE_SCAN_TIMEOUT};
use rs485_archiver::sim::{SimulatedBus, SimulatedOpener};
use rs485_archiver::transport::{list_ports, PortOpener, SerialOpener};

/// `NAME,PORT,TEMP,CURRENT`, e.g. `L1,/dev/ttyUSB0,1,none`.
#[derive(Debug, Clone)]
struct ChannelArg {
    name: String,
    port: String,
    temperature: SensorAddress,
    current: SensorAddress,
}

impl FromStr for ChannelArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [name, port, temperature, current] = parts[..] else {
            return Err(format!("expected NAME,PORT,TEMP,CURRENT, got '{s}'"));
        };
        if name.is_empty() || port.is_empty() {
            return Err("channel name and port must not be empty".into());
        }
        Ok(Self {
            name: name.to_string(),
            port: port.to_string(),
            temperature: temperature.parse().map_err(|e| format!("{e}"))?,
            current: current.parse().map_err(|e| format!("{e}"))?,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "ems-record", about = "Record RS-485 temperature/current sensors")]
struct Args {
    /// Channels to record, as NAME,PORT,TEMP,CURRENT (TEMP/CURRENT: address, "none" or "-")
    #[arg(long = "channel", value_name = "SPEC")]
    channels: Vec<ChannelArg>,
    /// Shift label written into every record
    #[arg(long, default_value = "")]
    shift: String,
    /// Work order written into every record
    #[arg(long, default_value = "")]
    work_order: String,
    /// Tick interval in milliseconds (50..=5000)
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,
    /// Stop after this many seconds
    #[arg(long, default_value_t = 60)]
    duration: u64,
    /// List serial ports and exit
    #[arg(long)]
    list: bool,
    /// Probe every listed port and report which have responsive slaves
    #[arg(long)]
    pre_scan: bool,
    /// Scan one port for responsive slave addresses
    #[arg(long, value_name = "PORT")]
    scan: Option<String>,
    /// Highest address probed by --scan
    #[arg(long, default_value_t = 32)]
    max_address: u8,
    /// Probe with "report slave ID" instead of a register read
    #[arg(long)]
    slave_id_probe: bool,
    /// Use a simulated bus (ports SIM1 and SIM2) instead of hardware
    #[arg(long)]
    simulate: bool,
    /// Working tree holding real_time_monitoring/
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Record database (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,
    /// Export directory; persisted for later runs
    #[arg(long)]
    save_path: Option<PathBuf>,
    /// Export format (csv or txt); persisted for later runs
    #[arg(long)]
    format: Option<ExportFormat>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn simulated_opener() -> SimulatedOpener {
    let first = SimulatedBus::new();
    first.set_register(1, 235);
    first.set_register(2, 12);
    let second = SimulatedBus::with_devices(&[5], 198);
    SimulatedOpener::new()
        .with_port("SIM1", first)
        .with_port("SIM2", second)
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(LogTarget::Stderr);

    let (opener, ports): (Box<dyn PortOpener>, Vec<String>) = if args.simulate {
        let opener = simulated_opener();
        let ports = opener.ports();
        (Box::new(opener), ports)
    } else {
        (Box::new(SerialOpener), list_ports().context("listing serial ports")?)
    };

    if args.list {
        for port in &ports {
            println!("{port}");
        }
        return Ok(());
    }

    let layout = Layout::new(&args.root);
    layout.prepare().context("preparing runtime directories")?;

    let mut storage = StorageConfig::load(&layout.storage_config());
    if args.save_path.is_some() || args.format.is_some() {
        if let Some(path) = args.save_path.clone() {
            storage.save_path = path;
        }
        if let Some(format) = args.format {
            storage.save_format = format;
        }
        storage
            .save(&layout.storage_config())
            .context("saving storage settings")?;
        storage.reload(&layout.storage_config());
    }

    let polling = PollingConfig::with_interval(Duration::from_millis(args.interval_ms));
    let mut recorder = Recorder::new(
        opener,
        storage,
        polling,
        resolve_db_path(&layout, args.db_path.clone()),
        LivenessFlag::new(layout.recording_flag()),
    );

    let probe = if args.slave_id_probe {
        ProbeKind::ReportSlaveId
    } else {
        ProbeKind::ReadHoldingRegister
    };

    if args.pre_scan {
        let options = ScanOptions {
            max_address: args.max_address,
            timeout: PRE_SCAN_TIMEOUT,
            probe,
        };
        for scan in recorder.pre_scan(&ports, &options) {
            let state = if scan.active { "active" } else { "silent" };
            println!("{}\t{}", scan.port, state);
        }
        return Ok(());
    }

    if let Some(port) = &args.scan {
        let options = ScanOptions {
            max_address: args.max_address,
            probe,
            ..ScanOptions::default()
        };
        let found = recorder.scan_addresses(port, &options);
        if found.is_empty() {
            println!("no slaves answered on {port}");
        } else {
            let list: Vec<String> = found.iter().map(u8::to_string).collect();
            println!("{port}: {}", list.join(", "));
        }
        return Ok(());
    }

    if args.channels.is_empty() {
        bail!("nothing to record: pass at least one --channel");
    }
    record(&mut recorder, &args)
}

fn record(recorder: &mut Recorder, args: &Args) -> Result<()> {
    let ids: Vec<_> = args
        .channels
        .iter()
        .map(|c| {
            recorder.add_channel(ChannelSettings {
                name: c.name.clone(),
                shift: args.shift.clone(),
                work_order: args.work_order.clone(),
                port: c.port.clone(),
                temperature: c.temperature,
                current: c.current,
            })
        })
        .collect();

    for &id in &ids {
        let mode = recorder
            .start(id)
            .with_context(|| format!("starting channel {id}"))?;
        if let Some(channel) = recorder.channel(id) {
            let (temperature, current) = channel.sensor_status();
            info!(
                "{}: {:?} (temperature {:?}, current {:?})",
                channel.name(),
                mode,
                temperature,
                current
            );
        }
    }

    let interval = recorder.polling().interval;
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut next = Instant::now();
    while Instant::now() < deadline {
        for record in recorder.tick_running() {
            println!(
                "{}\t{}\t{:.1}\t{:.1}",
                record.time, record.line, record.temperature, record.current
            );
        }
        next += interval;
        thread::sleep(next.saturating_duration_since(Instant::now()));
    }

    match recorder.close() {
        Ok(files) => {
            for file in files {
                println!("exported {}", file.display());
            }
            Ok(())
        }
        Err(e) => {
            warn!("closing recorder: {}", e);
            Err(e.into())
        }
    }
}
