//! Entry point for the dataset builder.
//! Handles CLI parsing, logging and thread pool setup, and dispatches the statistics,
//! additions and info commands.

use clap::Parser;
use dataset_builder::cli::{Cli, Command};
use dataset_builder::dates::to_iso;
use dataset_builder::loaders::{build_state, AdditionsLoader, BuildSession, DatasetMetadata, StatisticsAdder, StatisticsOutput};
use dataset_builder::parallel::{get_parallel_info, ParallelConfig};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    ParallelConfig::new(cli.threads).setup_global_pool()?;
    if cli.verbose {
        get_parallel_info().log();
    }

    match cli.command {
        Command::Statistics { path, output, start, end } => {
            let mut session = BuildSession::open(&path)?;
            let adder = StatisticsAdder::new(StatisticsOutput::from_arg(output.as_deref())).with_bounds(start, end);
            adder.run(&mut session).await?;
        }
        Command::AdditionsInit { path, name } => {
            AdditionsLoader::open(&path, &name)?.initialise().await?;
        }
        Command::AdditionsLoad { path, name, parts } => {
            let report = AdditionsLoader::open(&path, &name)?.run(&parts).await?;
            info!("Computed statistics for {} dates (parts {parts})", report.built.len());
        }
        Command::AdditionsFinalise { path, name } => {
            let summary = AdditionsLoader::open(&path, &name)?.finalise().await?;
            info!("Additions '{name}':\n{summary}");
        }
        Command::Info { path } => print_info(&path).await?,
    }

    Ok(())
}

async fn print_info(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = BuildSession::open(path)?;
    let state = build_state(&mut session).await?;
    println!("Dataset: {path}");
    println!("State: {state:?}");
    if session.registry.exists().await {
        let flags = session.registry.get_flags(true).await?;
        let built = flags.iter().filter(|&&f| f).count();
        println!("Groups: {built}/{} built", flags.len());
    }
    let meta = DatasetMetadata::read(&session.store).await?;
    println!("Shape: {:?}", meta.shape);
    println!("Variables: {}", meta.variables.join(", "));
    if let (Some(first), Some(last)) = (meta.dates.first(), meta.dates.last()) {
        println!("Dates: {} to {} ({} dates)", to_iso(first), to_iso(last), meta.dates.len());
    }
    println!("Missing dates: {}", meta.missing_dates.len());
    if let (Some(start), Some(end)) = (meta.statistics_start, meta.statistics_end) {
        println!("Statistics period: {} to {}", to_iso(&start), to_iso(&end));
    }
    println!("Partial records: {}", session.statistics.len());
    Ok(())
}
