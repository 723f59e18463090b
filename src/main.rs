//! dvbserve: scan DVB networks and serve per-service transport streams.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{error, info};

use dvbserve::config::{load_config, ConfigFile};
use dvbserve::model::transponder::DeliverySystem;
use dvbserve::psi::TS_PACKET_SIZE;
use dvbserve::{logging, DvbDevice};

/// dvbserve - DVB scan and per-service stream server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory where log files are stored (console only when unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the network from the configured seed transponders
    Scan {
        /// Where to write the catalog XML; stdout when unset
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the services of a saved catalog
    List {
        /// Catalog XML produced by a scan
        catalog: PathBuf,
    },
    /// Tune a service and record its remuxed stream to a file
    Record {
        /// Catalog XML produced by a scan
        catalog: PathBuf,
        /// Service name to record
        service: String,
        /// Output file; `<service>.ts` when unset
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// How long to record
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit config path, else auto-detect next to the working directory.
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("dvbserve.toml");
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("loaded config from {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("failed to load config file: {e}");
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.clone().map(PathBuf::from));
    let retention = file_config
        .logging
        .retention_days
        .unwrap_or(args.log_retention_days);
    logging::init_logging(log_dir.as_deref(), retention, args.verbose)?;

    match args.command {
        Command::Scan { output } => run_scan(&file_config, output),
        Command::List { catalog } => run_list(&catalog),
        Command::Record {
            catalog,
            service,
            output,
            seconds,
        } => run_record(&file_config, &catalog, &service, output, seconds),
    }
}

fn open_device(file_config: &ConfigFile) -> Result<DvbDevice, Box<dyn std::error::Error>> {
    #[cfg(target_os = "linux")]
    {
        let mut device = DvbDevice::new(file_config.device_config());
        device.detect_adapters();
        if device.adapters().is_empty() {
            return Err("no DVB adapters found".into());
        }
        Ok(device)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = file_config;
        Err("DVB hardware access requires Linux".into())
    }
}

fn run_scan(
    file_config: &ConfigFile,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let device = open_device(file_config)?;

    let mut seeded = 0;
    for system in [
        DeliverySystem::Terrestrial,
        DeliverySystem::Satellite,
        DeliverySystem::Cable,
    ] {
        let lines = file_config.seed_lines(system);
        if lines.is_empty() {
            continue;
        }
        seeded += device.add_initial_transponders(system, &lines.join("\n"))?;
    }
    if seeded == 0 {
        return Err("no seed transponders configured (see [scan] in the config file)".into());
    }

    let summary = device.scan(|service| {
        info!(
            "found \"{}\" (sid {}, {})",
            service.name,
            service.sid,
            service.service_type.as_str()
        );
    });
    info!(
        "scan finished: {} services on {} transponders ({} failed)",
        summary.services_found, summary.transponders_locked, summary.transponders_failed
    );

    let xml = device.write_xml()?;
    match output {
        Some(path) => fs::write(&path, xml)?,
        None => println!("{xml}"),
    }
    Ok(())
}

fn run_list(catalog_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let xml = fs::read_to_string(catalog_path)?;
    let catalog = dvbserve::Catalog::from_xml(&xml)?;

    let mut names: Vec<&str> = catalog.service_names().collect();
    names.sort_unstable();
    for name in names {
        for &tid in catalog.transponders_for(name) {
            let entry = catalog.transponder(tid);
            if let Some((_, service)) = catalog.service_on(tid, name) {
                println!(
                    "{name}\t{}\t{}\tsid {}\t{}{}",
                    service.service_type.as_str(),
                    service.provider,
                    service.sid,
                    entry.transponder,
                    if service.scrambled { "\t[scrambled]" } else { "" },
                );
            }
        }
    }
    Ok(())
}

fn run_record(
    file_config: &ConfigFile,
    catalog_path: &PathBuf,
    service_name: &str,
    output: Option<PathBuf>,
    seconds: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let device = open_device(file_config)?;
    device.read_xml(&fs::read_to_string(catalog_path)?)?;

    let playable = device.with_catalog(|c| {
        c.first_transponder(service_name)
            .and_then(|tid| c.service_on(tid, service_name))
            .map(|(_, s)| {
                s.status == dvbserve::RunningStatus::Running
                    && !s.scrambled
                    && (s.is_audio() || s.is_sd_video())
            })
    });
    match playable {
        None => return Err(format!("service \"{service_name}\" not in catalog").into()),
        Some(false) => {
            return Err(format!(
                "\"{service_name}\" is not a running, unscrambled audio or SD video service"
            )
            .into())
        }
        Some(true) => {}
    }

    let out_path =
        output.unwrap_or_else(|| PathBuf::from(format!("{service_name}.ts")));
    let mut out_file = fs::File::create(&out_path)?;

    info!("recording \"{service_name}\" for {seconds}s to {}", out_path.display());
    let mut stream = device.get_stream(service_name)?;
    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut buf = vec![0u8; TS_PACKET_SIZE * 500];
    let mut total: u64 = 0;

    while Instant::now() < deadline {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            error!("stream ended early after {total} bytes");
            break;
        }
        out_file.write_all(&buf[..n])?;
        total += n as u64;
    }
    device.free_stream(stream);
    info!("recorded {total} bytes");
    Ok(())
}
