//! The run driver: loads the example corpus, wires the pipeline into a
//! runner, funnels every outcome through the aggregator, and waits on the
//! final barrier.

use crate::aggregator::{AggregatorMessage, ResultAggregator, RunStats};
use crate::config::{ConfigError, FizilConfig, InputDeliveryMode, IsolationMode};
use crate::executor::{
    self, CommandExecutor, CommandExecutorConfig, EntryPoint, Executor, InProcessExecutor,
    InputDelivery,
};
use crate::pipeline::{self, Example, TestCasePipeline};
use crate::status::{RunInfo, StatusEvent, StatusSink};
use chrono::Local;
use log::{info, warn};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// What a caller learns from the run entry; everything else (crashes,
/// findings) is observable through status events and the filesystem.
#[derive(Debug)]
pub enum RunOutcome {
    ExamplesNotFound,
    Success(RunStats),
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read examples from {path:?}: {source}")]
    ExamplesUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read dictionary {path:?}: {source}")]
    DictionaryUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Executor(#[from] crate::executor::ExecutorError),
    #[error(transparent)]
    Aggregator(#[from] crate::aggregator::AggregatorError),
}

/// Runs one full fuzzing campaign described by `config`.
///
/// `entry_point` is the host-bound in-process entry point, required iff
/// the config selects in-process isolation. The driver iterates the test
/// stream serially for in-process isolation and with a worker pool for
/// out-of-process isolation; in both modes every result is posted to the
/// aggregator, which is the only writer of run state.
pub fn run(
    config: &FizilConfig,
    entry_point: Option<EntryPoint>,
    mut status: Box<dyn StatusSink>,
) -> Result<RunOutcome, RunError> {
    config.validate(entry_point.is_some())?;
    executor::disable_crash_reporting();

    let examples = load_examples(&config.examples)?;
    if examples.is_empty() {
        warn!("no examples under {:?}; nothing to do", config.examples);
        return Ok(RunOutcome::ExamplesNotFound);
    }

    let dictionary = match &config.dictionary {
        Some(path) => {
            pipeline::load_dictionary(path).map_err(|source| RunError::DictionaryUnreadable {
                path: path.clone(),
                source,
            })?
        }
        None => Vec::new(),
    };

    let pipeline = TestCasePipeline::new(examples, dictionary);
    let run_info = RunInfo {
        start_time: Local::now(),
        example_bytes: pipeline.example_bytes(),
        example_count: pipeline.example_count(),
        expected_cases: pipeline.expected_case_count(),
    };
    status.emit(StatusEvent::Initialize(&run_info));

    let aggregator = ResultAggregator::spawn(&config.examples, status);

    match config.isolation {
        IsolationMode::InProcess => {
            // Validation guarantees the entry point; a missing one here is
            // the same configuration error.
            let entry_point = entry_point.ok_or(ConfigError::MissingEntryPoint)?;
            let mut runner =
                InProcessExecutor::new(entry_point, config.map_size, config.crash_exit_code())?;
            let sender = aggregator.sender();
            for case in pipeline.test_cases() {
                let outcome = runner.execute_test(case);
                if sender
                    .send(AggregatorMessage::TestComplete(Box::new(outcome)))
                    .is_err()
                {
                    break;
                }
            }
        }
        IsolationMode::OutOfProcess => {
            let target = config
                .target
                .as_ref()
                .ok_or(ConfigError::MissingTargetCommand)?;
            let runner_config = CommandExecutorConfig {
                command: target.command.clone(),
                input_delivery: match target.input_delivery {
                    InputDeliveryMode::OnCommandLine => InputDelivery::OnCommandLine,
                    InputDeliveryMode::OnStandardInput => InputDelivery::OnStandardInput,
                },
                crash_exit_code: target.crash_exit_code,
                map_size: config.map_size,
                timeout: config.timeout(),
            };
            let workers = config.workers.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            });
            let cases = Mutex::new(pipeline.test_cases());
            std::thread::scope(|scope| {
                for _ in 0..workers.max(1) {
                    let sender = aggregator.sender();
                    let runner_config = runner_config.clone();
                    let cases = &cases;
                    scope.spawn(move || {
                        let mut runner = CommandExecutor::new(runner_config);
                        loop {
                            let case = {
                                let Ok(mut stream) = cases.lock() else {
                                    break;
                                };
                                stream.next()
                            };
                            let Some(case) = case else { break };
                            let outcome = runner.execute_test(case);
                            if sender
                                .send(AggregatorMessage::TestComplete(Box::new(outcome)))
                                .is_err()
                            {
                                break;
                            }
                        }
                    });
                }
            });
        }
    }

    let stats = aggregator.finish()?;
    info!(
        "run complete: {} executions, {} paths, {} crashes, {} non-zero exits, {} findings",
        stats.executions, stats.paths, stats.crashes, stats.nonzero_exits, stats.findings
    );
    Ok(RunOutcome::Success(stats))
}

/// Reads every regular file directly under `root`, sorted by path so the
/// stream order is stable across runs. Hidden files are skipped; a
/// missing directory counts as an empty corpus.
fn load_examples(root: &Path) -> Result<Vec<Example>, RunError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(RunError::ExamplesUnreadable {
                path: root.to_path_buf(),
                source,
            })
        }
    };
    let mut examples = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| RunError::ExamplesUnreadable {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'))
        {
            continue;
        }
        let example =
            Example::from_file(&path).map_err(|source| RunError::ExamplesUnreadable {
                path: path.clone(),
                source,
            })?;
        examples.push(example);
    }
    examples.sort_by(|a, b| a.source_file.cmp(&b.source_file));
    Ok(examples)
}
