//! Dispatch Tool
//!
//! Offline helpers for operating a dispatch deployment: see which nodes a
//! search-path directive reaches, and how many hits per node the top-k
//! estimator asks for.

use searchdispatch::cluster::{TopologyDescriptor, TopologySnapshot};
use searchdispatch::config::DispatchConfig;
use searchdispatch::search::{SearchPath, TopKEstimator};
use searchdispatch::telemetry::Telemetry;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dispatch configuration as JSON; defaults and DISPATCH_* environment otherwise
    #[arg(long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when SEARCHDISPATCH_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a search-path directive against a topology file
    SearchPath {
        /// Topology as JSON: {"nodes": [{"key", "host", "port", "group"}]}
        #[arg(long)]
        topology: PathBuf,

        /// Directive such as "[0,2>/1" or "*/0"
        #[arg(long)]
        path: String,
    },
    /// Show per-node hit counts chosen by the top-k estimator
    TopK {
        /// Hits the caller needs (offset + limit)
        #[arg(long)]
        hits: u32,

        /// Nodes in the group
        #[arg(long)]
        partitions: u32,

        /// Overrides the configured top-k probability
        #[arg(long)]
        probability: Option<f64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> searchdispatch::Result<DispatchConfig> {
    let config = match path {
        Some(path) => DispatchConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => DispatchConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init("searchdispatch-tool", &args.log_level)?;
    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::SearchPath { topology, path } => {
            let descriptor = TopologyDescriptor::load(&topology)?;
            let snapshot = TopologySnapshot::build(&descriptor, &config, 1)?;
            let parsed = SearchPath::parse(&path)?;
            let resolved = parsed.resolve(&snapshot)?;
            info!(search_path = %parsed, group = resolved.group_id, "Resolved search path");

            println!("group {}", resolved.group_id);
            for node in &resolved.nodes {
                println!(
                    "  [{}] distribution-key {} at {}",
                    node.path_index(),
                    node.key(),
                    node.address()
                );
            }
            if resolved.nodes.is_empty() {
                println!("  no nodes selected, query would use regular dispatch");
            }
        }
        Command::TopK {
            hits,
            partitions,
            probability,
        } => {
            let estimator =
                TopKEstimator::new(config.top_k_degrees_of_freedom, config.top_k_probability)?;
            let p = probability.unwrap_or(config.top_k_probability);
            let per_node = estimator.estimate_k_with(hits, partitions, p);
            let capped = per_node.min(config.max_hits_per_node);

            println!("probability        {p}");
            println!("hits per node      {capped}");
            println!("exact estimate     {}", estimator.estimate_exact_k_with(hits, partitions, p));
            println!(
                "total fetched      {}",
                u64::from(capped) * u64::from(partitions.max(1))
            );
        }
    }

    Ok(())
}
