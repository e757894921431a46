use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;
use swarmbench::{config::DEFAULT_PEER_FANOUT, AggregationPipeline};

#[derive(Parser, Debug)]
#[command(name = "swarmbench-aggregate", version, about = "Merge per-node result files into comparison tables")]
struct Args {

    #[arg(default_value = "results", help = "Directory holding the per-node result files")]
    results_dir: PathBuf,

    #[arg(short, long, help = "Output directory (default: the results directory)")]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_PEER_FANOUT, help = "Assumed number of receivers in the swarm")]
    peer_fanout: u32,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,

}

fn main() -> anyhow::Result<()> {

    let args = Args::parse();

    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(sub).context("failed to install logger")?;

    let output = args.output.unwrap_or_else(|| args.results_dir.clone());
    let report = AggregationPipeline::new(args.peer_fanout)
        .run(&args.results_dir, &output)
        .with_context(|| format!("failed to aggregate {}", args.results_dir.display()))?;

    for row in &report.per_category {
        tracing::info!(
            "{}: {} iterations, mean throughput {:.2} kbps, mean transfer time {:.2} s",
            row.size_category,
            row.iterations,
            row.stats.throughput.mean,
            row.stats.transfer_time.mean,
        );
    }
    for row in &report.combined_ratio {
        match row.combined_ratio {
            Some(ratio) => tracing::info!("{}: combined transfer ratio {:.4}", row.size_category, ratio),
            None => tracing::warn!("{}: combined transfer ratio undefined", row.size_category),
        }
    }
    Ok(())
}
