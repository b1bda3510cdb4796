pub mod aggregator;
pub mod config;
pub mod coverage;
pub mod executor;
pub mod fuzzer;
pub mod pipeline;
pub mod status;
pub mod strategy;
pub mod test_case;

pub use aggregator::{AggregatorMessage, ResultAggregator, RunStats};
pub use config::{ConfigError, FizilConfig, InputDeliveryMode, IsolationMode, TargetSettings};
pub use coverage::{CoverageMap, SHARED_MEMORY_ENV_VAR};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, EntryPoint, Executor, ExecutorError,
    InProcessExecutor, InputDelivery,
};
pub use fuzzer::{run, RunError, RunOutcome};
pub use pipeline::{load_dictionary, Example, TestCasePipeline};
pub use status::{LogStatusSink, NullStatusSink, RunInfo, StatusEvent, StatusSink};
pub use test_case::{Stage, StageCount, StageInfo, TestCase, TestOutcome, TestResult};
