//! Frame receiver daemon.
//!
//! Loads receiver configuration, starts the receive and monitor tasks and
//! runs until Ctrl-C. Released frames are logged and their buffers returned
//! straight away, which makes the daemon a standalone sink for testing
//! detector links.
//!
//! ```text
//! frame-receiver --config config/frame_receiver.toml --log-level debug
//! FR_RECEIVER__DECODER_TYPE=udp frame-receiver --json-logs
//! ```

use anyhow::Context;
use clap::Parser;
use fr_decoder::{BufferReturner, ReadyFrame};
use fr_receiver::{FrameReceiverService, ReceiverConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "frame-receiver", version, about = "Detector frame receiver")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/frame_receiver.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Seconds between status log lines (0 disables)
    #[arg(long, default_value_t = 10)]
    status_interval_secs: u64,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("invalid log filter '{}'", cli.log_level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn consume_frames(mut frames: mpsc::Receiver<ReadyFrame>, returner: BufferReturner) {
    let mut received = 0u64;
    let mut missing_data = 0u64;
    while let Some(frame) = frames.recv().await {
        received += 1;
        if !frame.metadata.complete {
            missing_data += 1;
        }
        debug!(
            frame_number = frame.metadata.frame_number,
            buffer_id = frame.buffer_id,
            payload_size = frame.metadata.payload_size,
            complete = frame.metadata.complete,
            "Frame ready"
        );
        returner.return_frame(frame.buffer_id, &frame.metadata);
    }
    info!(received, missing_data, "Frame consumer finished");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = ReceiverConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(config = %cli.config.display(), "Starting frame receiver");
    let mut handle = FrameReceiverService::start(config).await?;
    let frames = handle
        .take_frames()
        .context("frame channel already taken")?;
    let consumer = tokio::spawn(consume_frames(frames, handle.buffer_returner()));

    let status_period = Duration::from_secs(cli.status_interval_secs.max(1));
    let mut status_ticker = tokio::time::interval(status_period);
    status_ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "Failed to listen for Ctrl-C, shutting down");
                }
                break;
            }
            _ = status_ticker.tick(), if cli.status_interval_secs > 0 => {
                info!(status = %handle.status().to_value(), "Receiver status");
            }
        }
    }

    let final_status = handle.status().to_value();
    handle.shutdown().await?;
    consumer.await?;
    info!(status = %final_status, "Frame receiver stopped");
    Ok(())
}
