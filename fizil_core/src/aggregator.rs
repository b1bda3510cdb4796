//! The result aggregator: a single consumer that owns all run-mutable
//! state.
//!
//! Every executed test funnels through the aggregator's bounded mailbox.
//! Being the only writer of the observed-path set and the finding counter
//! is what makes finding numbering deterministic under parallel
//! execution: results are processed strictly in arrival order, and when
//! two workers surface the same novel coverage hash the first arrival
//! wins while the second is treated as a duplicate.

use crate::status::{StatusEvent, StatusSink};
use crate::test_case::TestOutcome;
use chrono::Local;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, trace};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use thiserror::Error;

/// Mailbox capacity. Producers block briefly when the consumer falls
/// behind, which also bounds memory held in flight.
const MAILBOX_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum AggregatorError {
    /// The consumer thread went away before answering the final barrier.
    #[error("result aggregator terminated early")]
    Disconnected,
}

/// Messages accepted by the aggregator.
pub enum AggregatorMessage {
    /// A completed execution, fire-and-forget from the producer side.
    TestComplete(Box<TestOutcome>),
    /// Synchronous barrier: reply with the final counters and terminate.
    AllTestsComplete(Sender<RunStats>),
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub executions: u64,
    pub crashes: u64,
    pub nonzero_exits: u64,
    pub paths: u64,
    pub findings: u64,
}

/// Handle to the consumer thread. Producers clone the sender; the driver
/// calls [`ResultAggregator::finish`] as the end-of-run barrier.
pub struct ResultAggregator {
    sender: Sender<AggregatorMessage>,
    handle: JoinHandle<()>,
}

impl ResultAggregator {
    /// Picks a findings folder name that did not exist at startup and
    /// starts the consumer thread.
    pub fn spawn(examples_root: &Path, status: Box<dyn StatusSink>) -> Self {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let findings_folder = unique_findings_folder(examples_root, &stamp);
        let (sender, receiver) = bounded(MAILBOX_CAPACITY);
        let handle = std::thread::spawn(move || consume(receiver, findings_folder, status));
        Self { sender, handle }
    }

    pub fn sender(&self) -> Sender<AggregatorMessage> {
        self.sender.clone()
    }

    /// Drains the mailbox and returns the final counters.
    pub fn finish(self) -> Result<RunStats, AggregatorError> {
        let (reply_sender, reply_receiver) = bounded(1);
        self.sender
            .send(AggregatorMessage::AllTestsComplete(reply_sender))
            .map_err(|_| AggregatorError::Disconnected)?;
        let stats = reply_receiver
            .recv()
            .map_err(|_| AggregatorError::Disconnected)?;
        let _ = self.handle.join();
        Ok(stats)
    }
}

/// Timestamp-named folder under the examples root, suffixed with `_`
/// until the name is unused.
fn unique_findings_folder(examples_root: &Path, stamp: &str) -> PathBuf {
    let mut name = format!("findings_{stamp}");
    while examples_root.join(&name).exists() {
        name.push('_');
    }
    examples_root.join(name)
}

fn consume(
    receiver: Receiver<AggregatorMessage>,
    findings_folder: PathBuf,
    status: Box<dyn StatusSink>,
) {
    let mut state = ExecutionState {
        observed_paths: HashSet::new(),
        finding_name: 0,
        findings_folder,
        stats: RunStats::default(),
        status,
    };
    while let Ok(message) = receiver.recv() {
        match message {
            AggregatorMessage::TestComplete(outcome) => state.record(*outcome),
            AggregatorMessage::AllTestsComplete(reply) => {
                let _ = reply.send(state.stats.clone());
                return;
            }
        }
    }
}

/// Aggregator-private run state. Nothing else reads or writes it.
struct ExecutionState {
    observed_paths: HashSet<String>,
    finding_name: u64,
    findings_folder: PathBuf,
    stats: RunStats,
    status: Box<dyn StatusSink>,
}

impl ExecutionState {
    fn record(&mut self, mut outcome: TestOutcome) {
        let hash = format!("{:x}", md5::compute(&outcome.coverage));
        let new_path = self.observed_paths.insert(hash);

        self.stats.executions += 1;
        if new_path {
            self.stats.paths += 1;
            debug!(
                "new path via stage '{}' ({} observed)",
                outcome.test_case.stage.name,
                self.observed_paths.len()
            );
        }
        if outcome.result.crashed {
            self.stats.crashes += 1;
            info!(
                "crash via stage '{}' (exit code {:#x})",
                outcome.test_case.stage.name, outcome.result.exit_code
            );
        } else if outcome.result.exit_code != 0 {
            self.stats.nonzero_exits += 1;
            debug!(
                "non-zero exit {} via stage '{}'",
                outcome.result.exit_code, outcome.test_case.stage.name
            );
        }
        if !outcome.result.stdout.is_empty() {
            trace!("target stdout: {}", outcome.result.stdout);
        }
        if !outcome.result.stderr.is_empty() {
            trace!("target stderr: {}", outcome.result.stderr);
        }

        outcome.new_path_found = new_path;
        self.status.emit(StatusEvent::Update(&outcome));

        let worth_keeping = outcome.result.crashed
            && outcome.new_path_found
            && outcome.test_case.source_file.is_none();
        if worth_keeping {
            self.persist_finding(&outcome);
        }
    }

    /// Writes the finding's input bytes to disk. A lost finding is logged,
    /// never allowed to end the run.
    fn persist_finding(&mut self, outcome: &TestOutcome) {
        if let Err(err) = fs::create_dir_all(&self.findings_folder) {
            error!(
                "could not create findings folder {:?}: {err}",
                self.findings_folder
            );
            return;
        }
        let file_name = format!(
            "{}{}",
            self.finding_name, outcome.test_case.file_extension
        );
        let path = self.findings_folder.join(file_name);
        match fs::write(&path, &outcome.test_case.data) {
            Ok(()) => {
                info!("finding persisted at {path:?}");
                self.finding_name += 1;
                self.stats.findings += 1;
            }
            Err(err) => error!("could not write finding {path:?}: {err}"),
        }
    }
}
