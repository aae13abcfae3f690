use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures_util::SinkExt;
use imu_attitude::complementary::BlendMode;
use imu_attitude::config::{load_config, AppConfig};
use imu_attitude::parser::{FrameParser, Icm20948Parser};
use imu_attitude::pipeline::Pipeline;
use imu_attitude::sink::{self, Estimate, EstimateSink};
use imu_attitude::{read_csv, TimedSample};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_serial::SerialPortBuilderExt;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

#[derive(Clone, Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// TOML configuration file. Defaults are used if it does not exist.
    #[arg(short, long, default_value = "imu-attitude.toml")]
    config: PathBuf,

    /// Serial port to read input data from (overrides the config file)
    #[arg(short, long, conflicts_with = "file")]
    serial: Option<String>,

    /// Serial port baud rate (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Replay a recording made with `capture_data` instead of reading serial
    #[arg(short, long, conflicts_with = "serial")]
    file: Option<PathBuf>,

    /// Server address on which to send computed attitude estimates (via websocket)
    #[arg(long)]
    server_addr: Option<String>,

    /// Weight of the accel/mag reference in [0, 1]
    #[arg(long)]
    alpha: Option<f64>,

    /// How gyro and reference attitudes are mixed
    #[arg(long, value_enum)]
    blend: Option<BlendArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BlendArg {
    Linear,
    Spherical,
}

impl From<BlendArg> for BlendMode {
    fn from(arg: BlendArg) -> Self {
        match arg {
            BlendArg::Linear => BlendMode::Linear,
            BlendArg::Spherical => BlendMode::Spherical,
        }
    }
}

impl CliArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = &self.serial {
            config.device.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.device.baud = baud;
        }
        if let Some(addr) = &self.server_addr {
            config.server_addr = addr.clone();
        }
        if let Some(alpha) = self.alpha {
            config.model.alpha = alpha;
        }
        if let Some(blend) = self.blend {
            config.model.blend = blend.into();
        }
    }
}

/// Reads newline-terminated frames from the serial port and publishes the
/// newest one. Older unread lines are overwritten.
async fn read_lines_from_serial(config: AppConfig, line_tx: watch::Sender<String>) -> Result<()> {
    let port = tokio_serial::new(config.device.port.as_str(), config.device.baud)
        .open_native_async()
        .with_context(|| format!("Failed to open serial port {}", config.device.port))?;
    info!(port = %config.device.port, baud = config.device.baud, device = %config.device.name, "Serial port open");

    let retry = Duration::from_secs_f64(config.model.sample_period);
    forward_lines(BufReader::new(port), line_tx, retry).await;
    warn!("Serial port closed");
    Ok(())
}

/// Publishes every line read from `reader` until end of stream or until
/// nobody is listening. Read errors are logged and reading resumes after
/// `retry`.
async fn forward_lines<R: AsyncBufRead + Unpin>(
    mut reader: R,
    line_tx: watch::Sender<String>,
    retry: Duration,
) {
    // Serial noise is not always valid UTF-8, so frame on raw bytes
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%e, "Read error");
                tokio::time::sleep(retry).await;
                continue;
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        if line_tx.send(line).is_err() {
            break;
        }
    }
}

/// Fixed-rate estimation loop over the newest serial line.
async fn run_serial<P: FrameParser>(
    config: AppConfig,
    mut pipeline: Pipeline<P>,
    mut sink: EstimateSink,
) -> Result<()> {
    let (line_tx, mut line_rx) = watch::channel(String::new());
    let reader = tokio::spawn(read_lines_from_serial(config.clone(), line_tx));

    let mut interval = tokio::time::interval(Duration::from_secs_f64(config.model.sample_period));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let clock = Instant::now();
    let mut processed: u64 = 0;

    loop {
        interval.tick().await;
        match line_rx.has_changed() {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => break,
        }
        let line = line_rx.borrow_and_update().clone();
        match pipeline.process_line(&line, clock.elapsed()) {
            Ok(Some(estimate)) => {
                sink.push(estimate);
                processed += 1;
                if processed % 1000 == 0 {
                    debug!(processed, dropped = sink.dropped(), "Estimates produced");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(%e, "Rejected sample, keeping previous estimate"),
        }
    }

    reader.await??;
    Ok(())
}

/// Replays a recording at the configured sample period, using the recorded
/// timestamps so the estimates match the recorded run.
async fn run_replay<P: FrameParser>(
    config: AppConfig,
    file: PathBuf,
    mut pipeline: Pipeline<P>,
    mut sink: EstimateSink,
) -> Result<()> {
    let data: Vec<TimedSample> = read_csv(&file)
        .with_context(|| format!("Failed to read recording {}", file.display()))?;
    info!(samples = data.len(), file = %file.display(), "Replaying recording");

    let mut interval = tokio::time::interval(Duration::from_secs_f64(config.model.sample_period));
    for record in &data {
        interval.tick().await;
        match pipeline.process_sample(&record.sample(), record.time) {
            Ok(estimate) => {
                sink.push(estimate);
            }
            Err(e) => debug!(%e, "Rejected sample, keeping previous estimate"),
        }
    }

    info!(dropped = sink.dropped(), "Replay finished");
    Ok(())
}

/// Forwards estimates to one websocket client at a time.
async fn run_server(addr: String, mut estimate_rx: mpsc::Receiver<Estimate>) -> Result<()> {
    // Bind to the address
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(%addr, "WebSocket server running");

    // Accept incoming WebSocket connections
    while let Ok((stream, peer)) = listener.accept().await {
        // Upgrade the TCP stream to a WebSocket stream
        let mut ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%peer, %e, "WebSocket handshake failed");
                continue;
            }
        };
        info!(%peer, "New WebSocket connection established");

        // Whatever sat in the slot while nobody was listening is stale
        sink::discard_pending(&mut estimate_rx);

        while let Some(estimate) = estimate_rx.recv().await {
            // Serialize attitude estimates to JSON and send over websocket
            let json_data = serde_json::to_string(&estimate)?;
            if let Err(e) = ws_stream.send(Message::Text(json_data)).await {
                info!(%peer, %e, "WebSocket connection closed");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imu_attitude=info".into()),
        )
        .init();

    let args = CliArgs::parse();
    let mut config = load_config(&args.config)?;
    args.apply(&mut config);
    config.validate()?;
    info!(
        alpha = config.model.alpha,
        cutoff_hz = config.model.lowpass_cutoff_hz,
        sample_period = config.model.sample_period,
        blend = ?config.model.blend,
        "Estimator configured"
    );

    let parser = Icm20948Parser::new(config.device.sentinel);
    let pipeline = Pipeline::from_config(parser, &config)?;
    let (sink, estimate_rx) = sink::channel();

    let server = tokio::spawn(run_server(config.server_addr.clone(), estimate_rx));

    let estimation = match &args.file {
        Some(file) => run_replay(config, file.clone(), pipeline, sink).await,
        None => run_serial(config, pipeline, sink).await,
    };
    server.abort();
    estimation
}
