//! Entry point for `ktp`.
//!
//! Starts a KTP service in this process and runs one of the two file-transfer
//! clients on top of it.  All protocol work is delegated to the library;
//! `main.rs` owns only process setup (logging, signal handling, argument
//! parsing) and the release of this process's connections on the way out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use socket2::Domain;

use ktp::retry::RetryPolicy;
use ktp::transfer::{receive_file, send_file, TransferReport};
use ktp::{KtpConfig, KtpStack, OwnerId, SocketHandle, SocketType};

/// Reliable message transport over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    protocol: ProtocolArgs,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct ProtocolArgs {
    /// Payload bytes per message.
    #[arg(long, default_value_t = 512)]
    message_size: usize,
    /// Window size and per-connection queue depth.
    #[arg(long, default_value_t = 10)]
    window: usize,
    /// Retransmission interval T in milliseconds.
    #[arg(long, default_value_t = 5000)]
    retransmit_ms: u64,
    /// Probability of discarding a received segment.
    #[arg(long, default_value_t = 0.05)]
    loss: f64,
    /// Size of the connection table.
    #[arg(long, default_value_t = 100)]
    max_connections: usize,
    /// Seed for the loss simulator.
    #[arg(long)]
    seed: Option<u64>,
}

impl From<&ProtocolArgs> for KtpConfig {
    fn from(args: &ProtocolArgs) -> Self {
        KtpConfig {
            message_size: args.message_size,
            window_capacity: args.window,
            retransmit_interval: Duration::from_millis(args.retransmit_ms),
            loss_probability: args.loss,
            max_connections: args.max_connections,
            loss_seed: args.seed,
        }
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Send a file to a peer running `ktp recv`.
    Send {
        /// Local address to bind (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        local: SocketAddr,
        /// Peer address (e.g. 127.0.0.1:9001).
        #[arg(short, long)]
        remote: SocketAddr,
        /// File to send.
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Receive a file from a peer running `ktp send`.
    Recv {
        #[arg(short, long)]
        local: SocketAddr,
        #[arg(short, long)]
        remote: SocketAddr,
        /// Where to write the received file.
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = KtpConfig::from(&cli.protocol);
    let stack = KtpStack::start(config).context("starting KTP service")?;

    let result = tokio::select! {
        result = run(&stack, cli.mode) => result,
        () = shutdown_signal() => {
            log::warn!("termination signal received, releasing connections");
            Ok(())
        }
    };

    let released = stack.reclaim(OwnerId::current());
    log::info!("released {} connection(s)", released.len());
    stack.shutdown();
    result
}

async fn run(stack: &KtpStack, mode: Mode) -> anyhow::Result<()> {
    // Outlast several retransmission rounds before giving up on the peer.
    let interval = stack.config().retransmit_interval;
    let patience = RetryPolicy::fixed(
        u32::try_from(interval.as_millis() * 20 / 100).unwrap_or(u32::MAX).max(100),
        Duration::from_millis(100),
    );

    match mode {
        Mode::Send { local, remote, file } => {
            let handle = open(stack, local, remote)?;
            let mut reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            log::info!("sending {} to {remote}", file.display());

            let report = send_file(stack, handle, remote, &mut reader, &patience).await?;
            print_summary("sent", &report);
            let stats = stack.stats(handle)?;
            if let Some(ratio) = stats.transmissions_per_message() {
                println!(
                    "average transmissions per message: {ratio:.3} ({} retransmissions)",
                    stats.retransmissions
                );
            }
            stack.close(handle)?;
        }
        Mode::Recv { local, remote, output } => {
            let handle = open(stack, local, remote)?;
            let mut writer = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("creating {}", output.display()))?;
            log::info!("receiving from {remote} into {}", output.display());

            // Wait for the sender indefinitely.
            let waiting = RetryPolicy::fixed(u32::MAX, Duration::from_millis(50));
            let report = receive_file(stack, handle, &mut writer, &waiting).await?;
            print_summary("received", &report);

            // Keep answering retransmissions in case our last ACKs were lost.
            tokio::time::sleep(interval * 2).await;
            stack.close(handle)?;
        }
    }
    Ok(())
}

fn open(stack: &KtpStack, local: SocketAddr, remote: SocketAddr) -> anyhow::Result<SocketHandle> {
    let domain = Domain::for_address(local);
    let handle = stack.socket(domain, SocketType::Ktp, None)?;
    stack
        .bind(handle, local, remote)
        .with_context(|| format!("binding {local} -> {remote}"))?;
    Ok(handle)
}

fn print_summary(verb: &str, report: &TransferReport) {
    println!("{verb} {} bytes in {} messages", report.bytes, report.messages);
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
