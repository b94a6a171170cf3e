use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use xrlink_lib::command::{DeviceInfoReader, GetBrightness, ReadBattery, SetBrightness};
use xrlink_lib::frame::Frame;
use xrlink_lib::framer::BinaryPacketFramer;
use xrlink_lib::link::Link;
use xrlink_lib::ota::{FirmwareFile, OtaUpdater, total_transfer_len};
use xrlink_lib::rlc;
use xrlink_lib::sim::{SimConfig, SimulatedAccessory};
use xrlink_lib::telemetry::{SensorKind, TelemetrySample};
use xrlink_lib::token::{DEFAULT_USER_ID, HandshakeToken, current_cloud_token};
use xrlink_lib::{ConnectionState, DeviceSession, OtaConfig, SessionConfig};

/// Protocol tooling for XR glasses accessories.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file with `session` and `ota` settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Summarize a firmware container.
    Inspect { file: PathBuf },
    /// Slice a hex payload into binary-packet frames.
    Frame {
        #[arg(long, default_value_t = 0x01, value_parser = parse_u8)]
        bin_type: u8,
        #[arg(long, default_value_t = 247)]
        mtu: usize,
        payload: String,
    },
    /// Run-length compress a hex payload and check the round trip.
    Compress { payload: String },
    /// Print a handshake token.
    Token {
        #[arg(long, default_value_t = DEFAULT_USER_ID)]
        user_id: u32,
        /// Device sub-token (8 hex digits) of a paired device.
        #[arg(long)]
        device_token: Option<String>,
    },
    /// Pair with a simulated accessory and exercise the session.
    Simulate {
        /// Run an update with this container after pairing.
        #[arg(long)]
        firmware: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolConfig {
    session: SessionConfig,
    ota: OtaConfig,
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{s}': {e}"))
}

fn setup_logging(log_file_path: Option<&Path>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {path:?}"))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // -v gives DEBUG, -vv TRACE; RUST_LOG still wins per target.
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}

fn load_config(path: Option<&Path>) -> Result<ToolConfig> {
    let Some(path) = path else {
        return Ok(ToolConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {path:?}"))?;
    let config: ToolConfig = serde_json::from_str(&text).with_context(|| format!("Invalid config {path:?}"))?;
    config.session.validate()?;
    Ok(config)
}

fn decode_hex(payload: &str) -> Result<Vec<u8>> {
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    hex::decode(&cleaned).with_context(|| format!("'{payload}' is not hex"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("{e:?}");
        process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Cmd::Inspect { file } => inspect(&file),
        Cmd::Frame {
            bin_type,
            mtu,
            payload,
        } => frame(bin_type, mtu, &payload),
        Cmd::Compress { payload } => compress(&payload),
        Cmd::Token { user_id, device_token } => token(user_id, device_token.as_deref()),
        Cmd::Simulate { firmware } => simulate(config, firmware.as_deref()).await,
    }
}

fn inspect(path: &Path) -> Result<()> {
    let file = FirmwareFile::open(path).with_context(|| format!("Failed to load {path:?}"))?;
    let header = &file.header;
    println!("container  version {:#010x}  device type {:#x}", header.version, header.device_type);
    println!("           built {}  length {} bytes", header.timestamp, header.length);
    for (i, section) in file.sections.iter().enumerate() {
        let h = &section.header;
        println!(
            "section {i}  type {:#x} (bin {:#04x})  version {}  {} bytes at {:#010x}  crc {:08x}{}",
            h.data_type,
            section.bin_type(),
            h.version,
            h.length,
            h.start_addr,
            h.crc,
            if h.is_forced() { "  forced" } else { "" }
        );
    }
    println!("update transfers {} bytes", total_transfer_len(&file.sections));
    Ok(())
}

fn frame(bin_type: u8, mtu: usize, payload: &str) -> Result<()> {
    let inner = decode_hex(payload)?;
    let framer = BinaryPacketFramer::new(mtu)?;
    let packets = framer.build(bin_type, &inner, None);
    info!(frames = packets.len(), chunk = framer.chunk_size(), "framed {} bytes", inner.len());
    for packet in &packets {
        let frame = Frame::parse(packet)?;
        println!("{:>4} {:<6} {}", frame.index, frame.slice.to_string(), hex::encode(packet));
    }
    Ok(())
}

fn compress(payload: &str) -> Result<()> {
    let src = decode_hex(payload)?;
    let packed = rlc::compress(&src);
    if packed.is_empty() {
        println!("not compressed ({} bytes); send raw", src.len());
        return Ok(());
    }
    let Some(unpacked) = rlc::decompress(&packed, src.len()) else {
        bail!("round trip failed");
    };
    if unpacked != src {
        bail!("round trip mismatch");
    }
    println!(
        "{} -> {} bytes ({:.1}%)",
        src.len(),
        packed.len(),
        packed.len() as f64 * 100.0 / src.len() as f64
    );
    println!("{}", hex::encode(&packed));
    Ok(())
}

fn token(user_id: u32, device_token: Option<&str>) -> Result<()> {
    let token = match device_token {
        Some(text) => {
            let bytes = decode_hex(text)?;
            let device_token: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .context("device token must be 4 bytes")?;
            HandshakeToken::retrieve(user_id, device_token)
        }
        None => HandshakeToken::connection(user_id, current_cloud_token()),
    };
    println!("{token}");
    Ok(())
}

async fn simulate(config: ToolConfig, firmware: Option<&Path>) -> Result<()> {
    let firmware = firmware
        .map(|path| FirmwareFile::open(path).with_context(|| format!("Failed to load {path:?}")))
        .transpose()?;

    let accessory = Arc::new(SimulatedAccessory::new(SimConfig::default()));
    let link: Arc<dyn Link> = accessory.clone();
    let session = DeviceSession::new("00:00:00:00:00:00", link, config.session)?;

    let mut states = session.state_stream();
    let watcher = tokio::spawn(async move {
        while let Some(state) = states.next().await {
            println!("state: {state}");
        }
    });

    session.connect().await?;
    let state = tokio::time::timeout(
        Duration::from_secs(30),
        session.wait_for_state(|s| {
            matches!(
                s,
                ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Available
            )
        }),
    )
    .await
    .context("pairing did not finish")??;
    if state != ConnectionState::Connected {
        bail!("pairing ended in {state}");
    }

    let device = DeviceInfoReader::read(&session).await?;
    println!("device: {}", serde_json::to_string(&device)?);
    session.execute(SetBrightness(7)).await?;
    println!("brightness: {}", session.execute(GetBrightness).await?);
    session.execute(ReadBattery).await?;
    println!("battery: {:?}", *session.battery().borrow());

    let mut telemetry = Box::pin(session.telemetry());
    accessory.push_telemetry(&[
        TelemetrySample::new(SensorKind::Accelerometer, 1, [0.0, 0.0, 9.81]),
        TelemetrySample::new(SensorKind::Gyroscope, 1, [0.01, -0.02, 0.0]),
    ]);
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(1), telemetry.next()).await {
            Ok(Some(sample)) => println!("telemetry: {}", serde_json::to_string(&sample)?),
            _ => warn!("telemetry sample missing"),
        }
    }

    if let Some(file) = firmware {
        let updater = OtaUpdater::new(session.clone(), config.ota);
        let mut progress = updater.progress();
        let reporter = tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let value = *progress.borrow_and_update();
                println!("progress: {:.0}%", value * 100.0);
            }
        });
        let result = updater.update_file(&file).await;
        println!("update: {:?}", *updater.state().borrow());
        reporter.abort();
        result?;
        println!("rebooted: {}", accessory.rebooted());
    }

    session.disconnect().await?;
    watcher.abort();
    Ok(())
}
