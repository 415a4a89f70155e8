//! Defines command-line interface options using `clap` for the dataset builder.
//!
//! Initialising and loading need an input provider, so they are library entry points;
//! the commands here only work on an existing dataset.

use crate::chunks::Parts;
use clap::{Parser, Subcommand};

/// A CLI tool for finishing and inspecting datasets built in parts
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    name = "dataset-builder",
    about = "Statistics and additions for partially built datasets"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output.
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Number of threads to use for parallel processing. Defaults to number of CPU cores.
    #[arg(short = 't', long, global = true)]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge the partial statistics of a build
    Statistics {
        /// Path to the dataset
        path: String,

        /// JSON file to write the statistics to, `-` to print them. Defaults to the dataset itself.
        #[arg(short, long)]
        output: Option<String>,

        /// First date of the statistics period (YYYY, YYYY-MM, YYYY-MM-DD or datetime)
        #[arg(long)]
        start: Option<String>,

        /// Last date of the statistics period
        #[arg(long)]
        end: Option<String>,
    },

    /// Start a new additions pass, discarding any previous one with the same name
    AdditionsInit {
        /// Path to the dataset
        path: String,

        /// Name of the additions, used as prefix of the output arrays
        #[arg(short, long)]
        name: String,
    },

    /// Compute per-date statistics for the dates owned by this worker
    AdditionsLoad {
        /// Path to the dataset
        path: String,

        /// Name of the additions
        #[arg(short, long)]
        name: String,

        /// Work owned by this worker: `all`, `i/n` or a list of date numbers
        #[arg(short, long, default_value = "all", value_parser = parse_parts_arg)]
        parts: Parts,
    },

    /// Merge the additions, check them and write them into the dataset
    AdditionsFinalise {
        /// Path to the dataset
        path: String,

        /// Name of the additions
        #[arg(short, long)]
        name: String,
    },

    /// Print the build state and metadata of a dataset
    Info {
        /// Path to the dataset
        path: String,
    },
}

fn parse_parts_arg(s: &str) -> Result<Parts, String> {
    s.parse::<Parts>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_statistics_command() {
        let cli = Cli::try_parse_from([
            "dataset-builder",
            "statistics",
            "ds.zarr",
            "--output",
            "-",
            "--start",
            "2020",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Statistics { path, output, start, end } => {
                assert_eq!(path, "ds.zarr");
                assert_eq!(output.as_deref(), Some("-"));
                assert_eq!(start.as_deref(), Some("2020"));
                assert!(end.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parts_are_parsed_on_the_command_line() {
        let cli = Cli::try_parse_from([
            "dataset-builder",
            "--threads",
            "2",
            "additions-load",
            "ds.zarr",
            "--name",
            "tendencies",
            "--parts",
            "2/3",
        ])
        .unwrap();
        assert_eq!(cli.threads, Some(2));
        match cli.command {
            Command::AdditionsLoad { parts, name, .. } => {
                assert_eq!(parts, Parts::Fraction { index: 2, count: 3 });
                assert_eq!(name, "tendencies");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_parts() {
        let parsed = Cli::try_parse_from([
            "dataset-builder",
            "additions-load",
            "ds.zarr",
            "--name",
            "x",
            "--parts",
            "one/two",
        ]);
        assert!(parsed.is_err());
    }
}
