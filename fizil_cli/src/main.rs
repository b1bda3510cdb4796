use fizil_core::config::{FizilConfig, IsolationMode};
use fizil_core::executor::{EntryPoint, DEFAULT_CRASH_EXIT_CODE};
use fizil_core::fuzzer::{self, RunOutcome};
use fizil_core::status::LogStatusSink;
use fizil_core::test_case::TestResult;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Project file (TOML). Defaults to ./fizil.toml when present.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Override the examples directory from the project file.
    #[clap(long)]
    examples: Option<PathBuf>,
    /// Override the worker count for out-of-process runs.
    #[clap(long)]
    workers: Option<usize>,
    /// Raise log verbosity (-v: debug, -vv: trace).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Built-in entry point used when a project selects in-process isolation
/// from the command line. Real embeddings bind their own entry point
/// through the library API; this one exists so the CLI can demonstrate
/// the serial path end to end.
fn demo_entry_point() -> EntryPoint {
    EntryPoint::Bytes(Box::new(|data: &[u8]| {
        let crashed = data.starts_with(b"BAD") || data.starts_with(b"CRAS");
        TestResult {
            crashed,
            exit_code: if crashed {
                DEFAULT_CRASH_EXIT_CODE as i32
            } else {
                0
            },
            stdout: String::new(),
            stderr: String::new(),
        }
    }))
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let config_path = match cli.config_file {
        Some(path) => path,
        None => {
            let default_path = PathBuf::from("fizil.toml");
            if !default_path.exists() {
                anyhow::bail!(
                    "no project file: pass --config-file or create ./fizil.toml"
                );
            }
            default_path
        }
    };
    log::info!("loading project file {config_path:?}");
    let mut config = FizilConfig::load_from_file(&config_path)?;

    if let Some(examples) = cli.examples {
        config.examples = examples;
    }
    if let Some(workers) = cli.workers {
        config.workers = Some(workers);
    }

    let entry_point =
        matches!(config.isolation, IsolationMode::InProcess).then(demo_entry_point);

    match fuzzer::run(&config, entry_point, Box::new(LogStatusSink))? {
        RunOutcome::ExamplesNotFound => {
            anyhow::bail!("no examples found under {:?}", config.examples);
        }
        RunOutcome::Success(stats) => {
            println!(
                "Executions: {}, Paths: {}, Crashes: {}, Non-zero exits: {}, Findings: {}",
                stats.executions, stats.paths, stats.crashes, stats.nonzero_exits, stats.findings
            );
        }
    }
    Ok(())
}
