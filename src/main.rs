// ========================================================================================
//
//                          THE COMMAND LINE: RAYVAR
//
// ========================================================================================
//
// Two subcommands, each driven by one TOML file:
//
//   - `prepare` maps rays into matrix-column space and stages the ray weight sets and
//     non-represented variance vectors a solve reads.
//   - `solve` contracts every stored covariance block against the staged rays and
//     writes per-ray variance, per-site-pair covariance and a performance summary.
//
// Progress goes to stderr as `> ` lines and an interactive progress bar. Diagnostics go
// through `log`, filtered by `RUST_LOG` (default `info`).

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use rayvar::config::{PrepareConfig, RunConfig};
use rayvar::output::write_results;
use rayvar::pipeline::run_solve;
use rayvar::prepare::run_prepare;
use rayvar::progress::ProgressBarObserver;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "rayvar",
    version,
    about = "Travel-time prediction uncertainty from a block-partitioned model covariance",
    long_about = "Computes the variance of ray travel-time predictions by contracting sparse \
                 ray weight vectors against a tomographic model covariance matrix stored as \
                 lower-triangular blocks."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage ray weight sets and non-represented variance vectors
    #[command(about = "Stage rays for a solve (outputs: ray weight sets, layout.toml)")]
    Prepare {
        /// Path to the prepare configuration TOML
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
    },

    /// Contract the covariance blocks against the staged rays
    #[command(about = "Compute ray variance and site-pair covariance (outputs: TSV tables)")]
    Solve {
        /// Path to the run configuration TOML
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Run every task on the main thread instead of a worker pool
        #[arg(long)]
        inline: bool,

        /// Worker threads, overriding the configuration
        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Prepare { config }) => prepare(config),
        Some(Commands::Solve {
            config,
            inline,
            threads,
        }) => solve(config, inline, threads),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn prepare(config_path: PathBuf) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();
    let config = PrepareConfig::load(&config_path)?;
    eprintln!(
        "> Staging rays from {} into {}",
        config.rays.display(),
        config.ray_weight_dir.display()
    );

    let summary = run_prepare(&config)?;
    eprintln!(
        "> Staged {} rays ({} weights) as {} ray weight sets in {} files.",
        summary.rays, summary.elements, summary.staged.set_count, summary.files_written
    );
    if !summary.warnings.is_empty() {
        eprintln!(
            "> Recovered from {} I/O failures while staging.",
            summary.warnings.len()
        );
    }
    eprintln!(
        "\nSuccess! Total execution time: {:.2?}",
        start_time.elapsed()
    );
    Ok(())
}

fn solve(config_path: PathBuf, inline: bool, threads: Option<usize>) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();
    let mut config = RunConfig::load(&config_path)?;
    config.workers.inline |= inline;
    if threads.is_some() {
        config.workers.threads = threads;
    }
    eprintln!(
        "> Solving with ray weights from {} and {} block server roots.",
        config.ray_weight_dir.display(),
        config.block_servers.len()
    );

    let mut observer = ProgressBarObserver::new();
    let results = run_solve(&config, &mut observer)?;

    let summary = &results.summary;
    eprintln!(
        "> {} rays, {} site-pair entries, {} contributions; {} block reads, {} cache hits, {} I/O warnings.",
        results.self_variance.len(),
        results.pair_covariance.len(),
        summary.counters.contributions,
        summary.counters.block_reads,
        summary.counters.block_cache_hits,
        summary.io_warnings
    );

    for path in write_results(&config.output_dir, &results)? {
        eprintln!("> Wrote {}", path.display());
    }
    eprintln!(
        "\nSuccess! Total execution time: {:.2?}",
        start_time.elapsed()
    );
    Ok(())
}
