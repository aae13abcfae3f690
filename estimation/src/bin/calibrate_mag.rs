use anyhow::{bail, Context, Result};
use clap::Parser;
use imu_attitude::calibration::MagCalibration;
use imu_attitude::config::{load_config, save_config};
use imu_attitude::lowpass::SampleFilter;
use imu_attitude::parser::{FrameParser, Icm20948Parser};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Estimate the magnetometer offset. Keep turning the device through every
/// orientation while this runs.
#[derive(Clone, Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// TOML configuration file providing device and filter settings
    #[arg(short, long, default_value = "imu-attitude.toml")]
    config: PathBuf,
    /// Serial port to read input data from (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,
    /// Seconds to collect readings for
    #[arg(short, long, default_value = "30")]
    duration: f64,
    /// Store the result as `mag_offset` in the config file
    #[arg(short, long)]
    write: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calibrate_mag=info".into()),
        )
        .init();

    let args = CliArgs::parse();
    let mut config = load_config(&args.config)?;
    if let Some(port) = &args.port {
        config.device.port = port.clone();
    }
    let window = Duration::try_from_secs_f64(args.duration)
        .with_context(|| format!("Invalid duration: {}", args.duration))?;

    let mut filter = SampleFilter::new(config.model.lowpass_cutoff_hz, config.model.sample_period)?;
    let parser = Icm20948Parser::new(config.device.sentinel);

    // Create serial port connection
    let port = serialport::new(&config.device.port, config.device.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(3000))
        .open()
        .with_context(|| format!("Failed to open serial port {}", config.device.port))?;
    info!(
        port = %config.device.port,
        sentinel = %parser.sentinel(),
        seconds = args.duration,
        "Collecting magnetometer readings"
    );

    let mut reader = BufReader::new(port);
    let mut line = Vec::new();
    let mut calibration = MagCalibration::new();
    let start = Instant::now();

    while start.elapsed() < window {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                warn!("Serial port closed");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let Some(sample) = parser.parse(&text) else {
                    debug!(line = %text.trim_end(), "Skipping unparseable line");
                    continue;
                };
                calibration.add(&filter.filter_sample(&sample).mag());
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                warn!("No data from serial port");
            }
            Err(e) => {
                warn!(%e, "Read error");
            }
        }
    }

    let Some(offset) = calibration.offset() else {
        bail!("No frames received from {}", config.device.port);
    };
    info!(samples = calibration.count(), "Calibration finished");

    config.mag_offset = [offset.x, offset.y, offset.z];
    println!(
        "mag_offset = [{}, {}, {}]",
        config.mag_offset[0], config.mag_offset[1], config.mag_offset[2]
    );
    if args.write {
        save_config(&args.config, &config)?;
    }
    Ok(())
}
