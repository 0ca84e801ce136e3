//! CLI entry point for rust-smu
//!
//! Provides a command-line interface for:
//! - listing attached devices
//! - streaming samples to stdout
//! - changing channel modes
//! - displaying and writing calibration data
//! - flashing firmware
//! - watching hotplug events
//!
//! The CLI drives the simulated transport configured in `config/smu.toml`
//! (`[simulation]`), so it runs without hardware.
//!
//! # Usage
//!
//! ```bash
//! smu list
//! smu stream --samples 1000 --mode-a v --value-a 2.5
//! smu calibrate --write cal.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use rust_smu::config::{SmuConfig, DEFAULT_CONFIG_PATH};
use rust_smu::logging::{self, LoggingConfig};
use rust_smu::sample::channel_name;
use rust_smu::transport::sim::{default_serial, SimDevice, SimTiming, SimulatedTransport};
use rust_smu::{Device, Mode, Session};

#[derive(Parser)]
#[command(name = "smu")]
#[command(about = "Stream and control USB source-measure units", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices
    List {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream samples from every device to stdout
    Stream {
        /// Samples per device, 0 streams until interrupted
        #[arg(short = 'n', long, default_value = "1000")]
        samples: u64,

        /// Sample rate in Hz, 0 selects the device default
        #[arg(long)]
        rate: Option<u32>,

        /// Mode of channel A (d, v, i)
        #[arg(long, default_value = "d")]
        mode_a: Mode,

        /// Mode of channel B (d, v, i)
        #[arg(long, default_value = "d")]
        mode_b: Mode,

        /// Constant value sourced on channel A
        #[arg(long, default_value = "0")]
        value_a: f32,

        /// Constant value sourced on channel B
        #[arg(long, default_value = "0")]
        value_b: f32,

        /// Print one JSON object per sample
        #[arg(long)]
        json: bool,
    },

    /// Set the mode of one channel
    Mode {
        /// Device index as printed by `list`
        #[arg(short, long, default_value = "0")]
        device: usize,

        /// Channel (a or b)
        #[arg(short, long, value_parser = parse_channel)]
        channel: usize,

        /// New mode (d, v, i)
        mode: Mode,
    },

    /// Display, write or reset calibration data
    Calibrate {
        /// Device index as printed by `list`
        #[arg(short, long, default_value = "0")]
        device: usize,

        /// Calibration file to write
        #[arg(long, conflicts_with = "reset")]
        write: Option<PathBuf>,

        /// Restore factory defaults
        #[arg(long)]
        reset: bool,
    },

    /// Flash a firmware image
    Flash {
        /// Firmware image
        file: PathBuf,

        /// Reboot this device into its bootloader first
        #[arg(short, long)]
        device: Option<usize>,
    },

    /// Print attach/detach events
    Hotplug {
        /// How long to watch, in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Plug and unplug a simulated device once a second
        #[arg(long)]
        simulate: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SmuConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate()?;
    logging::init(LoggingConfig::from_config(&config)?.with_ansi(true))?;

    let transport = Arc::new(build_transport(&config));
    let session = Session::from_config(transport.clone(), &config.session);

    match cli.command {
        Commands::List { json } => list(&session, json),
        Commands::Stream {
            samples,
            rate,
            mode_a,
            mode_b,
            value_a,
            value_b,
            json,
        } => {
            let rate = rate.unwrap_or(config.session.sample_rate);
            stream(&session, samples, rate, [mode_a, mode_b], [value_a, value_b], json)
        }
        Commands::Mode {
            device,
            channel,
            mode,
        } => {
            let device = pick_device(&session, device)?;
            device.set_mode(channel, mode)?;
            println!("{device}: channel {} -> {mode}", channel_name(channel));
            Ok(())
        }
        Commands::Calibrate {
            device,
            write,
            reset,
        } => {
            let device = pick_device(&session, device)?;
            if write.is_some() || reset {
                device.write_calibration(write.as_deref())?;
            }
            print!("{}", device.calibration()?);
            Ok(())
        }
        Commands::Flash { file, device } => {
            let target = match device {
                Some(index) => Some(pick_device(&session, index)?),
                None => None,
            };
            session.flash_firmware(&file, target.as_ref())?;
            println!("Flashed {}", file.display());
            Ok(())
        }
        Commands::Hotplug { seconds, simulate } => watch_hotplug(&session, &transport, seconds, simulate),
    }
}

fn build_transport(config: &SmuConfig) -> SimulatedTransport {
    let timing = if config.simulation.realtime {
        SimTiming::Realtime
    } else {
        SimTiming::Instant
    };
    let transport = SimulatedTransport::with_timing(timing);
    for index in 0..config.simulation.devices {
        transport.plug(
            SimDevice::new(default_serial(index))
                .load_ohms(config.simulation.load_ohms)
                .noise(config.simulation.noise),
        );
    }
    transport
}

fn parse_channel(s: &str) -> Result<usize, String> {
    match s.to_lowercase().as_str() {
        "a" | "0" => Ok(0),
        "b" | "1" => Ok(1),
        _ => Err(format!("invalid channel '{s}': expected a or b")),
    }
}

fn pick_device(session: &Session, index: usize) -> Result<Arc<Device>> {
    session.add_all()?;
    let devices = session.devices();
    match devices.get(index) {
        Some(device) => Ok(Arc::clone(device)),
        None => bail!("no device {index}: {} active", devices.len()),
    }
}

fn list(session: &Session, json: bool) -> Result<()> {
    session.scan()?;
    let devices = session.available_devices();
    if json {
        let descriptors: Vec<_> = devices.iter().map(|d| d.descriptor().clone()).collect();
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No devices found");
    }
    for (index, device) in devices.iter().enumerate() {
        println!("{index}: {}", device.descriptor());
    }
    Ok(())
}

fn stream(
    session: &Session,
    samples: u64,
    rate: u32,
    modes: [Mode; 2],
    values: [f32; 2],
    json: bool,
) -> Result<()> {
    session.add_all()?;
    let devices = session.devices();
    if devices.is_empty() {
        bail!("no devices attached");
    }
    session.configure(rate)?;

    for device in &devices {
        for (channel, (&mode, &value)) in modes.iter().zip(values.iter()).enumerate() {
            device.set_mode(channel, mode)?;
            if mode != Mode::HiZ {
                device.channel(channel)?.constant(value)?;
            }
        }
    }

    session.start(samples)?;
    info!(devices = devices.len(), samples, rate, "Streaming");

    // Each device is read from its own thread; samples are printed as they arrive.
    let readers: Vec<_> = devices
        .iter()
        .map(|device| {
            let device = Arc::clone(device);
            thread::spawn(move || {
                for sample in device.samples() {
                    if json {
                        match serde_json::to_string(&sample) {
                            Ok(line) => println!("{line}"),
                            Err(e) => eprintln!("{device}: {e}"),
                        }
                    } else {
                        let (ai, av, bi, bv) = sample.as_tuple();
                        println!("{device}\t{}\t{ai:.6}\t{av:.6}\t{bi:.6}\t{bv:.6}", sample.index);
                    }
                }
            })
        })
        .collect();

    session.wait_for_completion()?;
    for reader in readers {
        if reader.join().is_err() {
            bail!("reader thread panicked");
        }
    }

    session.end()?;
    Ok(())
}

fn watch_hotplug(
    session: &Session,
    transport: &Arc<SimulatedTransport>,
    seconds: u64,
    simulate: bool,
) -> Result<()> {
    session.scan()?;
    session.hotplug_attach(|device| println!("attached: {}", device.descriptor()));
    session.hotplug_detach(|device| println!("detached: {device}"));

    let serial = "SIMFFFF";
    for tick in 0..seconds {
        thread::sleep(Duration::from_secs(1));
        if simulate {
            if tick % 2 == 0 {
                transport.attach(SimDevice::new(serial));
            } else {
                transport.detach(serial);
            }
        }
    }
    transport.wait_idle();
    Ok(())
}
