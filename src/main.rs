use clap::{Parser, Subcommand};
use dotenv::dotenv;
use rowmerge::config::{RunArgs, RunConfig};
use rowmerge::inspect::inspect;
use rowmerge::workload::run_local;
use rowmerge::MergeError;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rowmerge")]
#[command(about = "Row-partitioned incremental merging of worker snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a world of workers and collectors in this process
    Run(RunArgs),
    /// Print the entries of a merged output file
    Inspect {
        /// Container file to open
        file: PathBuf,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn run(args: RunArgs) -> Result<(), MergeError> {
    let config = RunConfig::from_env(args)?;
    info!(
        "[rowmerge] {} rank(s), split {}, {} event(s) per worker, sync every {}, output {}",
        config.world_size,
        config.split,
        config.events,
        config.sync_rate,
        config.output.display()
    );
    let summary = run_local(&config)?;
    for c in &summary.collectors {
        for output in &c.outputs {
            println!(
                "row {}: {} message(s), {} bytes, {} merge pass(es), {} worker(s) -> {}",
                c.color,
                c.messages,
                c.bytes,
                c.merges,
                c.finished_workers,
                output.display()
            );
        }
    }
    let shipped: u64 = summary.workers.iter().map(|w| w.bytes_sent).sum();
    println!("{} worker(s) shipped {} bytes", summary.workers.len(), shipped);
    Ok(())
}

fn main() {
    dotenv().ok();
    rowmerge::init_tracing("rowmerge");
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Inspect { file, json } => inspect(&file).and_then(|report| {
            let rendered = if json { report.to_json()? } else { report.to_text() };
            println!("{}", rendered);
            Ok(())
        }),
    };

    if let Err(e) = result {
        error!("[rowmerge] {}", e);
        std::process::exit(e.exit_code());
    }
}
