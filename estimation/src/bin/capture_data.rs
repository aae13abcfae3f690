use anyhow::{Context, Result};
use clap::Parser;
use csv::WriterBuilder;
use imu_attitude::parser::{FrameParser, Icm20948Parser};
use imu_attitude::TimedSample;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Serial port to read input data from
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,
    /// Baud rate for the serial port
    #[arg(short, long, default_value = "115200")]
    baud: u32,
    /// Character that starts every sensor frame
    #[arg(short, long, default_value = "&")]
    sentinel: char,
    /// File to write raw IMU data to.
    #[arg(short, long, default_value = "raw_imu_data.csv")]
    file_path: PathBuf,
    /// Overwrite the output file if it exists
    #[arg(short, long)]
    overwrite: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capture_data=info".into()),
        )
        .init();

    let args = CliArgs::parse();

    // Create serial port connection
    let port = serialport::new(&args.port, args.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(3000))
        .open()
        .with_context(|| format!("Failed to open serial port {}", args.port))?;

    if args.overwrite && args.file_path.exists() {
        std::fs::remove_file(&args.file_path).with_context(|| {
            format!("Failed to delete existing file: {}", args.file_path.display())
        })?;
    }

    // Open or create the output file for appending
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.file_path)
        .with_context(|| format!("Failed to open filepath: {}", args.file_path.display()))?;

    // Only a fresh file gets the header row
    let empty = file.metadata()?.len() == 0;
    let mut writer = WriterBuilder::new().has_headers(empty).from_writer(file);
    let parser = Icm20948Parser::new(args.sentinel);
    info!(
        port = %args.port,
        file = %args.file_path.display(),
        sentinel = %parser.sentinel(),
        "Recording frames"
    );

    let mut reader = BufReader::new(port);
    let mut line = Vec::new();
    let clock = Instant::now();
    let mut recorded: u64 = 0;

    loop {
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
                writer.serialize(TimedSample::new(clock.elapsed(), &sample))?;

                // Ensure the data is written to disk
                writer.flush()?;
                recorded += 1;
                if recorded % 1000 == 0 {
                    info!(recorded, "Frames recorded");
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                warn!("No data from serial port");
            }
            Err(e) => {
                warn!(%e, "Read error");
            }
        }
    }

    Ok(())
}
