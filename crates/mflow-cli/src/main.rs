//! mflow CLI - dump, replay, split, measure and generate mflow streams

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use colored::Colorize;
use mflow::{ConnType, Mode, Payload, Statistics, Stream, StreamConfig, ThroughputStatistics};
use mflow_core::{FrameSource, Handler};
use serde_json::json;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod files;
mod split;

use files::Dumper;
use split::{SplitConfig, Splitter};

/// mflow - multi-part, self-describing data streams
#[derive(Parser)]
#[command(name = "mflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write every received frame to its own file
    Dump {
        /// Source address - format "tcp://<address>:<port>"
        source: String,

        /// Destination folder
        folder: PathBuf,
    },

    /// Send a dumped folder again
    Replay {
        /// Folder written by `mflow dump`
        folder: PathBuf,

        /// Address to bind
        #[arg(short, long, default_value = "tcp://*:9999")]
        address: String,

        /// Communication mode - push or pub
        #[arg(short, long, default_value = "push")]
        mode: Mode,
    },

    /// Forward one stream to several others
    Split {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Source address - format "tcp://<address>:<port>"
        source: Option<String>,

        /// Streams to generate - format "tcp://<address>:<port>"
        streams: Vec<String>,
    },

    /// Print message and data rates of a stream
    Stats {
        /// Source address - format "tcp://<address>:<port>"
        source: String,

        /// Sampling interval in milliseconds
        #[arg(short, long, default_value = "1000")]
        interval: u64,
    },

    /// Send raw-1.0 messages as fast as possible
    Generate {
        /// Address to bind
        #[arg(short, long, default_value = "tcp://*:9999")]
        address: String,

        /// Size of data to send (MB)
        #[arg(short, long, default_value = "1")]
        size: f64,

        /// Communication mode - push or pub
        #[arg(short, long, default_value = "push")]
        mode: Mode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.log_level, cli.json_logs)?;

    // Handle Ctrl+C
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!("Failed to listen for ctrl+c: {}", e),
        }
        let _ = shutdown_tx.send(()).await;
    });

    match cli.command {
        Commands::Dump { source, folder } => {
            println!(
                "{} Dumping {} to {}",
                "MFLOW".cyan().bold(),
                source.yellow(),
                folder.display()
            );
            run_dump(&source, folder, &mut shutdown_rx).await?;
        }

        Commands::Replay {
            folder,
            address,
            mode,
        } => {
            println!(
                "{} Replaying {} on {} ({})",
                "MFLOW".cyan().bold(),
                folder.display(),
                address.yellow(),
                mode
            );
            run_replay(&folder, &address, mode).await?;
        }

        Commands::Split {
            config,
            source,
            streams,
        } => {
            let (config, conn_type) = match (config, source) {
                (Some(path), _) => (SplitConfig::load(&path)?, None),
                (None, Some(source)) if !streams.is_empty() => {
                    (SplitConfig::from_args(&source, &streams), Some(ConnType::Bind))
                }
                _ => bail!("Either a configuration file or a source and at least one stream is required"),
            };
            println!(
                "{} Splitting {} into {} stream(s)",
                "MFLOW".cyan().bold(),
                config.source.address.yellow(),
                config.streams.len()
            );
            run_split(&config, conn_type, &mut shutdown_rx).await?;
        }

        Commands::Stats { source, interval } => {
            println!("{} Measuring {}", "MFLOW".cyan().bold(), source.yellow());
            run_stats(&source, interval, &mut shutdown_rx).await?;
        }

        Commands::Generate {
            address,
            size,
            mode,
        } => {
            println!(
                "{} Sending messages of size {} MB on {}",
                "MFLOW".cyan().bold(),
                size,
                address.yellow()
            );
            run_generate(&address, size, mode, &mut shutdown_rx).await?;
        }
    }

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

async fn connect(address: &str, mode: Mode) -> Result<Stream> {
    let mut stream = Stream::new();
    stream
        .connect(&StreamConfig::new(address, mode))
        .await
        .with_context(|| format!("Failed to open {}", address))?;
    Ok(stream)
}

async fn bind(address: &str, mode: Mode) -> Result<Stream> {
    if !mode.can_send() {
        bail!("Mode must be push or pub, got {}", mode);
    }
    let mut config = StreamConfig::new(address, mode);
    config.conn_type = ConnType::Bind;

    let mut stream = Stream::new();
    stream
        .connect(&config)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    Ok(stream)
}

async fn run_dump(source: &str, folder: PathBuf, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
    tokio::fs::create_dir_all(&folder)
        .await
        .with_context(|| format!("Failed to create {}", folder.display()))?;

    let mut stream = connect(source, Mode::Pull).await?;
    let mut dumper = Dumper::new(folder);

    loop {
        tokio::select! {
            received = stream.receive_with(&mut dumper, true) => {
                received?;
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    println!("{} Dumped {} message(s)", "OK".green().bold(), dumper.messages());
    stream.disconnect().await;
    Ok(())
}

async fn run_replay(folder: &std::path::Path, address: &str, mode: Mode) -> Result<()> {
    let plan = files::replay_plan(folder).await?;
    let mut stream = bind(address, mode).await?;

    for frame in &plan {
        let data = tokio::fs::read(&frame.path)
            .await
            .with_context(|| format!("Failed to read {}", frame.path.display()))?;
        info!("Sending {} [{}]", frame.path.display(), frame.more);
        stream.send(data, frame.more, true).await?;
    }

    println!("{} Replayed {} frame(s)", "OK".green().bold(), plan.len());
    stream.disconnect().await;
    Ok(())
}

async fn run_split(
    config: &SplitConfig,
    conn_type: Option<ConnType>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    let mut splitter = Splitter::connect(config, conn_type).await?;
    let mut source = Stream::new();
    source
        .connect(&config.source.source_config()?)
        .await
        .with_context(|| format!("Failed to open {}", config.source.address))?;

    println!("{} Forwarding to {} output(s)", "OK".green().bold(), splitter.outputs());

    loop {
        tokio::select! {
            received = source.receive_with(&mut splitter, true) => {
                received?;
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    source.disconnect().await;
    splitter.disconnect().await;
    println!("{}", "Split stopped".yellow());
    Ok(())
}

/// Reads every frame so all of them are counted; keeps only the header
struct Counter;

#[async_trait]
impl Handler for Counter {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> mflow_core::Result<Option<Payload>> {
        let header = source.expect_json("header").await?;
        while source.has_more() {
            source.next().await?;
        }
        Ok(Some(Payload::Json(header)))
    }
}

async fn run_stats(source: &str, interval: u64, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
    let mut stream = connect(source, Mode::Pull).await?;
    let mut throughput = ThroughputStatistics::with_interval(std::time::Duration::from_millis(interval));
    let mut counter = Counter;

    loop {
        tokio::select! {
            received = stream.receive_with(&mut counter, true) => {
                if let Some(message) = received? {
                    if throughput.save(message.statistics()) {
                        print_sample(&throughput);
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    stream.disconnect().await;
    print_summary(&mut throughput);
    Ok(())
}

async fn run_generate(address: &str, size: f64, mode: Mode, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
    if size.is_nan() || size <= 0.0 {
        bail!("Size must be positive, got {}", size);
    }
    let size_bytes = (size * 1024.0 * 1024.0) as usize;
    let data = Bytes::from(vec![0u8; size_bytes]);

    let mut stream = bind(address, mode).await?;
    let mut throughput = ThroughputStatistics::new();
    let mut statistics = Statistics::new();

    let mut frame = 0u64;
    loop {
        let header = json!({
            "htype": "raw-1.0",
            "type": "int32",
            "shape": [1, size_bytes / 4],
            "frame": frame,
        });
        let sent = async {
            stream.send_json(&header, true, true).await?;
            stream.send(data.clone(), false, true).await
        };
        tokio::select! {
            sent = sent => sent?,
            _ = shutdown_rx.recv() => break,
        }
        frame += 1;

        // Header bytes are not counted.
        statistics.record_frame(size_bytes);
        statistics.commit();
        if throughput.save(&statistics) {
            print_sample(&throughput);
        }
    }

    println!("{}", "Terminated by user.".yellow());
    stream.disconnect().await;
    print_summary(&mut throughput);
    Ok(())
}

fn print_sample(throughput: &ThroughputStatistics) {
    if let Some(sample) = throughput.last_sample() {
        println!("{} {}", "RATE".cyan(), sample);
    }
}

fn print_summary(throughput: &mut ThroughputStatistics) {
    throughput.flush();
    match throughput.summary() {
        Some(summary) => {
            println!("{}", "_".repeat(60));
            println!("{}", summary);
            println!("{}", "_".repeat(60));
        }
        None => println!("{}", "Nothing was received".yellow()),
    }
}
