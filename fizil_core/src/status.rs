use crate::test_case::TestOutcome;
use chrono::{DateTime, Local};

/// Run-level facts announced once at startup.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub start_time: DateTime<Local>,
    pub example_bytes: u64,
    pub example_count: usize,
    pub expected_cases: u64,
}

/// What the engine tells the outside world. Consumers (status displays,
/// dashboards) live outside the core.
pub enum StatusEvent<'a> {
    Initialize(&'a RunInfo),
    Update(&'a TestOutcome),
}

pub trait StatusSink: Send {
    fn emit(&mut self, event: StatusEvent<'_>);
}

/// Swallows everything. Useful for embeddings and tests.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn emit(&mut self, _event: StatusEvent<'_>) {}
}

/// Routes status traffic to the log facade; stands in when no richer
/// display is attached.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn emit(&mut self, event: StatusEvent<'_>) {
        match event {
            StatusEvent::Initialize(info) => log::info!(
                "run started {}: {} examples, {} bytes, ~{} cases queued",
                info.start_time.format("%Y-%m-%d %H:%M:%S"),
                info.example_count,
                info.example_bytes,
                info.expected_cases,
            ),
            StatusEvent::Update(outcome) => log::trace!(
                "stage '{}': crashed={} exit={} new_path={}",
                outcome.test_case.stage.name,
                outcome.result.crashed,
                outcome.result.exit_code,
                outcome.new_path_found,
            ),
        }
    }
}
