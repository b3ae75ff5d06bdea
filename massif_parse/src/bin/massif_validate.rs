//! Check that a massif output file parses and summarize it.
//!
//! # Usage
//!
//! ```bash
//! massif_validate massif.out.1234
//! massif_validate --strict-indentation -v massif.out.1234
//! ```

use clap::Parser;
use env_logger::Env;
use massif_parse::{Document, IndentationPolicy, ParserConfig};
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "massif_validate")]
#[command(about = "Validate a Valgrind massif output file")]
#[command(version)]
struct Args {
    /// massif.out file to check
    input: PathBuf,

    /// Fail when tree indentation disagrees with the declared child counts
    #[arg(long)]
    strict_indentation: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening '{}': {}", args.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let config = ParserConfig {
        indentation: if args.strict_indentation {
            IndentationPolicy::Strict
        } else {
            IndentationPolicy::Warn
        },
        ..ParserConfig::default()
    };

    match Document::parse_with_config(file, &config) {
        Ok(massif) => {
            println!("Valid massif file: {}", args.input.display());
            println!("  Command: {}", massif.command);
            println!("  Description: {}", massif.description);
            println!("  Time unit: {}", massif.time_unit);
            println!("  Snapshots: {}", massif.snapshots.len());
            println!("  Detailed snapshots: {}", massif.detailed_indices.len());
            if let Some(peak) = massif.peak_snapshot() {
                println!(
                    "  Peak: snapshot {} at time {} ({} heap bytes)",
                    peak.id,
                    peak.time,
                    peak.total_heap()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Invalid massif file '{}': {}", args.input.display(), e);
            ExitCode::FAILURE
        }
    }
}
