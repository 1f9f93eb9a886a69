//! Command line front end: wire up bus devices, meters and printers, then
//! run the dispatch loop until stopped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use tokio_serial::SerialPortBuilderExt;

use wmeters::address::{split_match_expressions, AddressExpression};
use wmeters::bus::{BusDevice, LinkModeSet, Watchdog};
use wmeters::device_manager::DeviceManager;
use wmeters::meters::{create_meter, dynamic, MeterInfo};
use wmeters::shell::spawn_meter_shells;
use wmeters::telegram::{AboutTelegram, FrameType, MeterKeys, Telegram};
use wmeters::util::crypto::AesKey;
use wmeters::util::hex::decode_hex_flex;

#[derive(Parser, Debug)]
#[command(
    name = "wmeters",
    about = "Decode wired and wireless M-Bus telegrams from utility meters"
)]
struct Cli {
    /// Bus device spec: alias=file:type:bps:linkmodes, eg
    /// main=/dev/ttyUSB0:im871a:57600:c1,t1
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Meter spec: name:driver:ids:key, eg
    /// MyHeater:kamheat:67676767:NOKEY
    #[arg(long = "meter")]
    meters: Vec<String>,

    /// Load a dynamic driver file before creating meters.
    #[arg(long = "load-driver")]
    driver_files: Vec<String>,

    /// Default link modes for devices that do not specify their own.
    #[arg(long = "link-modes", default_value = "c1,t1")]
    link_modes: String,

    /// Decode one telegram given as hex and exit.
    #[arg(long)]
    analyze: Option<String>,

    /// Driver to use in analyze mode; auto-detected when omitted.
    #[arg(long)]
    driver: Option<String>,

    /// AES key to use in analyze mode.
    #[arg(long)]
    key: Option<String>,

    /// Polling interval for wired meters.
    #[arg(long, value_parser = parse_duration)]
    poll_interval: Option<Duration>,

    #[arg(long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let (num, mult) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };
    num.parse::<u64>()
        .map(|n| Duration::from_secs(n * mult))
        .map_err(|e| e.to_string())
}

struct DeviceSpec {
    alias: String,
    file: String,
    device_type: String,
    bps: u32,
    link_modes: LinkModeSet,
}

fn parse_device_spec(s: &str, default_modes: LinkModeSet) -> Result<DeviceSpec> {
    let (alias, rest) = match s.split_once('=') {
        Some((a, r)) => (a.to_string(), r),
        None => (String::new(), s),
    };
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() < 2 {
        bail!("bad device spec \"{s}\", expected file:type[:bps][:linkmodes]");
    }
    let file = parts[0].to_string();
    let device_type = parts[1].to_string();
    let mut bps = 57600;
    let mut link_modes = default_modes;
    for extra in &parts[2..] {
        if let Ok(b) = extra.parse::<u32>() {
            bps = b;
        } else if let Some(modes) = LinkModeSet::parse(extra) {
            link_modes = modes;
        } else {
            bail!("bad device spec part \"{extra}\" in \"{s}\"");
        }
    }
    Ok(DeviceSpec {
        alias,
        file,
        device_type,
        bps,
        link_modes,
    })
}

fn parse_meter_spec(s: &str, poll_interval: Option<Duration>) -> Result<MeterInfo> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 3 {
        bail!("bad meter spec \"{s}\", expected name:driver:ids[:key]");
    }
    let mut address_expressions = Vec::new();
    for e in split_match_expressions(parts[2]) {
        address_expressions.push(
            AddressExpression::parse(&e, true)
                .map_err(|err| anyhow!("meter {}: {err}", parts[0]))?,
        );
    }
    Ok(MeterInfo {
        name: parts[0].to_string(),
        driver_name: parts[1].to_string(),
        address_expressions,
        key: parts.get(3).map(|k| k.to_string()),
        poll_interval,
        ..MeterInfo::default()
    })
}

fn analyze(cli: &Cli) -> Result<()> {
    let hex = cli.analyze.as_ref().unwrap();
    let frame = decode_hex_flex(hex).context("bad telegram hex")?;

    let mut keys = MeterKeys::default();
    if let Some(k) = &cli.key {
        if k != "NOKEY" {
            keys.confidentiality_key = Some(AesKey::from_hex(k).context("bad key")?);
        }
    }

    let frame_type = if frame.first() == Some(&0x68) {
        FrameType::MBus
    } else {
        FrameType::WMBus
    };
    let mut t = Telegram::new(AboutTelegram::new("analyze", 0, frame_type));
    t.mark_as_being_analyzed();
    let ok = t.parse(&frame, &keys, false);
    print!("{}", t.analyze_parse());
    if !ok {
        if let Some(e) = &t.error {
            println!("Telegram could not be fully decoded: {e}");
        }
    }

    let driver_name = match &cli.driver {
        Some(d) => d.clone(),
        None => {
            let possible = t.auto_detect_possible_drivers();
            println!("Possible drivers: {}", possible.join(","));
            possible.first().cloned().unwrap_or_default()
        }
    };
    if driver_name.is_empty() {
        return Ok(());
    }

    let id = t
        .addresses
        .last()
        .map(|a| a.id.clone())
        .unwrap_or_else(|| "*".to_string());
    let mi = MeterInfo {
        name: "analyze".to_string(),
        driver_name,
        address_expressions: vec![AddressExpression::parse(&id, true)?],
        key: cli.key.clone(),
        ..MeterInfo::default()
    };
    let mut meter = create_meter(&mi)?;
    let about = AboutTelegram::new("analyze", 0, frame_type);
    if let wmeters::TelegramOutcome::Updated(t) = meter.handle_telegram(&about, &frame) {
        println!("{}", serde_json::to_string_pretty(&meter.to_json(Some(&t)))?);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let default_modes = LinkModeSet::parse(&cli.link_modes)
        .ok_or_else(|| anyhow!("bad link modes \"{}\"", cli.link_modes))?;

    for file in &cli.driver_files {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("cannot read driver file {file}"))?;
        let name = dynamic::load_driver(file, &content)?;
        info!("loaded driver {name} from {file}");
    }

    if cli.analyze.is_some() {
        return analyze(&cli);
    }

    if cli.devices.is_empty() {
        bail!("no bus device specified");
    }

    let mut manager = DeviceManager::new(true);

    manager.on_meter_updated(Arc::new(|meter, t| {
        println!("{}", meter.to_json(Some(t)));
        spawn_meter_shells(meter, t);
    }));

    for spec in &cli.devices {
        let spec = parse_device_spec(spec, default_modes)?;
        let stream = tokio_serial::new(&spec.file, spec.bps)
            .open_native_async()
            .with_context(|| format!("cannot open {}", spec.file))?;
        let sender = manager.telegram_sender();

        let mut device: Box<dyn BusDevice> = match spec.device_type.as_str() {
            "im871a" => Box::new(wmeters::bus::im871a::Im871a::new(
                &spec.alias,
                &spec.file,
                stream,
                sender,
            )),
            "amb8465" => Box::new(wmeters::bus::amb8465::Amb8465::new(
                &spec.alias,
                &spec.file,
                stream,
                sender,
            )),
            other => bail!("unknown device type \"{other}\""),
        };

        device.ping().await?;
        let id = device.get_device_id().await.unwrap_or_default();
        if !device.can_set_link_modes(spec.link_modes) {
            bail!(
                "device {} cannot listen to link modes {}",
                device.device(),
                spec.link_modes.hr()
            );
        }
        device.set_link_modes(spec.link_modes).await?;
        info!("started {} [{id}] listening on {}", device.device(), spec.link_modes.hr());

        manager.add_device(device, Watchdog::default());
    }

    for spec in &cli.meters {
        let mi = parse_meter_spec(spec, cli.poll_interval)?;
        let meter = create_meter(&mi)?;
        manager.add_meter(meter);
    }

    // The main task sleeps in run(); ctrl-c flips the stop flag.
    let stop = manager.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("stopping");
        stop.stop();
    });

    manager.run().await;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    wmeters::logging::init_logger_with_level(level);

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("wmeters: {e:#}");
        std::process::exit(1);
    }
}
