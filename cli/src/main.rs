use std::{net::SocketAddr, path::PathBuf};
use anyhow::Context;
use clap::{value_parser, Parser, ValueEnum};
use swarmbench::{
    config::DEFAULT_PEER_FANOUT,
    engine::{HttpEngine, Protocol, DEFAULT_TRACKER_HOST, DEFAULT_TRACKER_PORT},
    ExperimentConfig, Role,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    #[value(aliases = ["source", "server"])]
    Seeder,
    #[value(aliases = ["receiver", "client"])]
    Leecher,
}

impl From<Mode> for Role {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Seeder => Role::Source,
            Mode::Leecher => Role::Receiver,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Http1,
    Http2,
}

impl From<ProtocolArg> for Protocol {
    fn from(protocol: ProtocolArg) -> Self {
        match protocol {
            ProtocolArg::Http1 => Protocol::Http1,
            ProtocolArg::Http2 => Protocol::Http2,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "swarmbench", version, about = "Repeated file transfer benchmark")]
struct Args {

    #[arg(value_enum, help = "Role of this node")]
    mode: Mode,

    #[arg(help = "File to serve, or whose name to fetch")]
    file_path: PathBuf,

    #[arg(help = "Directory downloads are written to")]
    save_dir: PathBuf,

    #[arg(value_parser = value_parser!(u32).range(1..), help = "Number of transfer iterations")]
    iterations: u32,

    #[arg(long, value_enum, default_value_t = ProtocolArg::Http1, help = "Transfer protocol")]
    protocol: ProtocolArg,

    #[arg(
        long,
        default_value_t = DEFAULT_PEER_FANOUT,
        value_parser = value_parser!(u32).range(1..),
        help = "Assumed number of receivers in the swarm",
    )]
    peer_fanout: u32,

    #[arg(long, default_value = "0.0.0.0:6969", help = "Address the seeder listens on")]
    listen: SocketAddr,

    #[arg(long = "results-dir", help = "Result directory, may be repeated (default: /results, /data, cwd)")]
    results_dirs: Vec<PathBuf>,

    #[arg(long, env = "TRACKER_HOST", default_value = DEFAULT_TRACKER_HOST, help = "Host receivers fetch from")]
    tracker_host: String,

    #[arg(long, env = "TRACKER_PORT", default_value_t = DEFAULT_TRACKER_PORT, help = "Port receivers fetch from")]
    tracker_port: u16,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,

}

#[tokio::main]
async fn main() -> anyhow::Result<()> {

    let args = Args::parse();

    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).context("failed to install logger")?;

    let role = Role::from(args.mode);
    let mut config = ExperimentConfig::new(role, args.file_path, args.save_dir, args.iterations);
    config.peer_fanout = args.peer_fanout;
    if !args.results_dirs.is_empty() {
        config.result_dirs = args.results_dirs;
    }
    tracing::info!("node id: {}", config.node_id);

    let engine = HttpEngine::new(args.protocol.into(), args.tracker_host, args.tracker_port, args.listen);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            interrupt.cancel();
        }
    });

    let report = swarmbench::run_experiment(config, engine, cancel)
        .await
        .map_err(|e| {
            tracing::error!("{}", e);
            e
        })
        .context("experiment failed")?;

    if role == Role::Receiver {
        tracing::info!(
            "{} iterations recorded{}",
            report.results.len(),
            if report.cancelled { ", run interrupted" } else { "" },
        );
    }
    Ok(())
}
