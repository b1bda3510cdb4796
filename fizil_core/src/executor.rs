//! Test runners.
//!
//! A runner takes one [`TestCase`], executes the target, and returns a
//! [`TestOutcome`] with the coverage snapshot attached and
//! `new_path_found` still false. Two variants exist: an in-process runner
//! that invokes a pre-bound entry point (serial only, one coverage region
//! for its whole lifetime) and an out-of-process runner that spawns the
//! target as a child per test (parallel-capable, one fresh region per
//! test).
//!
//! Runner-level failures never escape `execute_test`: a test the runner
//! could not perform is reported as a non-crash outcome carrying the error
//! text in `stderr`, and the run keeps going.

use crate::coverage::{CoverageError, CoverageMap, SHARED_MEMORY_ENV_VAR};
use crate::test_case::{TestCase, TestOutcome, TestResult};
use log::warn;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Exit code a managed runtime reports for an unhandled exception: the
/// CLR's exception status. Projects targeting other runtimes override it
/// in their settings.
#[cfg(windows)]
pub const DEFAULT_CRASH_EXIT_CODE: u32 = 0xE043_4352;

/// Exit code a managed runtime reports for an unhandled exception. Unix
/// kernels truncate exit statuses to eight bits, so the wide Windows
/// sentinel could never match here; the conventional runtime-abort code
/// is the default instead. Projects targeting other runtimes override it
/// in their settings.
#[cfg(not(windows))]
pub const DEFAULT_CRASH_EXIT_CODE: u32 = 134;

/// Default size of a coverage region when the project does not pin one.
pub const DEFAULT_MAP_SIZE: usize = 65536;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("target command is empty")]
    EmptyCommand,
    #[error("failed to spawn target '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to deliver input on target stdin: {0}")]
    InputDelivery(std::io::Error),
    #[error("failed to collect target output: {0}")]
    OutputCapture(std::io::Error),
    #[error("target exceeded the {0:?} time limit")]
    Timeout(Duration),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

/// The runner contract. Implementations own whatever resources a test
/// needs and release them on drop.
pub trait Executor: Send {
    fn execute_test(&mut self, case: TestCase) -> TestOutcome;
}

/// How test bytes reach an out-of-process target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDelivery {
    /// Bytes become one extra command-line argument, converted to a
    /// string UTF-8 best-effort.
    OnCommandLine,
    /// Bytes go to the child's stdin verbatim; stdin is closed afterwards.
    OnStandardInput,
}

/// Runtime settings for [`CommandExecutor`], assembled from the project
/// configuration by the driver.
#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub crash_exit_code: u32,
    pub map_size: usize,
    pub timeout: Option<Duration>,
}

/// Spawns the target as a child process for every test. Each test gets a
/// fresh coverage region whose name travels in the child's environment,
/// so parallel workers never collide.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    fn run_child(&self, case: &TestCase) -> Result<(TestResult, Vec<u8>), ExecutorError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(ExecutorError::EmptyCommand)?;

        let region_name = CoverageMap::unique_name();
        let coverage = CoverageMap::create(&region_name, self.config.map_size)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env(SHARED_MEMORY_ENV_VAR, coverage.name())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match self.config.input_delivery {
            InputDelivery::OnCommandLine => {
                command.arg(String::from_utf8_lossy(&case.data).into_owned());
                command.stdin(Stdio::null());
            }
            InputDelivery::OnStandardInput => {
                command.stdin(Stdio::piped());
            }
        }

        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            command: program.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(&case.data) {
                // A target that exits without draining stdin closes the
                // pipe early; that is its prerogative, not a failure.
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecutorError::InputDelivery(err));
                }
            }
        }

        let output = self.wait_for_output(child)?;
        let (crashed, exit_code) = self.classify_exit(&output.status);
        let result = TestResult {
            crashed,
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        Ok((result, coverage.snapshot()))
    }

    /// Waits for the child, draining captured output. With a time limit
    /// configured, the child is polled and torn down once the deadline
    /// passes so a hung target cannot stall the run.
    fn wait_for_output(&self, mut child: Child) -> Result<Output, ExecutorError> {
        let Some(limit) = self.config.timeout else {
            return child
                .wait_with_output()
                .map_err(ExecutorError::OutputCapture);
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let deadline = Instant::now() + limit;
        let status = loop {
            match child.try_wait().map_err(ExecutorError::OutputCapture)? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout.join();
                    let _ = stderr.join();
                    return Err(ExecutorError::Timeout(limit));
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        };
        Ok(Output {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }

    /// Crash detection is the exit-code comparison and nothing else. A
    /// child torn down without an exit code is recorded as a plain
    /// non-zero exit.
    fn classify_exit(&self, status: &ExitStatus) -> (bool, i32) {
        match status.code() {
            Some(code) => (code as u32 == self.config.crash_exit_code, code),
            None => (false, -1),
        }
    }
}

impl Executor for CommandExecutor {
    fn execute_test(&mut self, case: TestCase) -> TestOutcome {
        match self.run_child(&case) {
            Ok((result, coverage)) => TestOutcome::new(case, result, coverage),
            Err(err) => runner_failure(case, err),
        }
    }
}

/// The two admissible entry-point shapes for in-process execution: one
/// parameter, typed as raw bytes or as text.
pub enum EntryPoint {
    Bytes(Box<dyn FnMut(&[u8]) -> TestResult + Send>),
    Text(Box<dyn FnMut(&str) -> TestResult + Send>),
}

/// Invokes a bound entry point inside the fuzzer's own process. One
/// coverage region lives for the runner's lifetime; its name is published
/// in the environment at construction and the region is cleared before
/// every test. Loaded target state is process-global, so this runner is
/// strictly serial.
pub struct InProcessExecutor {
    entry_point: EntryPoint,
    coverage: CoverageMap,
    crash_exit_code: u32,
}

impl InProcessExecutor {
    pub fn new(
        entry_point: EntryPoint,
        map_size: usize,
        crash_exit_code: u32,
    ) -> Result<Self, ExecutorError> {
        let name = CoverageMap::unique_name();
        let coverage = CoverageMap::create(&name, map_size)?;
        std::env::set_var(SHARED_MEMORY_ENV_VAR, coverage.name());
        Ok(Self {
            entry_point,
            coverage,
            crash_exit_code,
        })
    }
}

impl Executor for InProcessExecutor {
    fn execute_test(&mut self, case: TestCase) -> TestOutcome {
        self.coverage.clear();
        let entry_point = &mut self.entry_point;
        let invoked = catch_unwind(AssertUnwindSafe(|| match entry_point {
            EntryPoint::Bytes(harness) => harness(&case.data),
            EntryPoint::Text(harness) => harness(&String::from_utf8_lossy(&case.data)),
        }));
        let result = match invoked {
            Ok(result) => result,
            Err(payload) => {
                let message = if let Some(text) = payload.downcast_ref::<&str>() {
                    (*text).to_string()
                } else if let Some(text) = payload.downcast_ref::<String>() {
                    text.clone()
                } else {
                    "entry point panicked".to_string()
                };
                TestResult {
                    crashed: true,
                    exit_code: self.crash_exit_code as i32,
                    stdout: String::new(),
                    stderr: message,
                }
            }
        };
        TestOutcome::new(case, result, self.coverage.snapshot())
    }
}

impl Drop for InProcessExecutor {
    fn drop(&mut self) {
        std::env::remove_var(SHARED_MEMORY_ENV_VAR);
    }
}

/// Children inherit the zeroed core-dump limit, so crashing targets exit
/// instead of waiting on crash-reporting machinery. Called once at run
/// init.
pub fn disable_crash_reporting() {
    #[cfg(unix)]
    unsafe {
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &limit);
    }
}

fn runner_failure(case: TestCase, err: ExecutorError) -> TestOutcome {
    warn!("test runner failure on stage '{}': {err}", case.stage.name);
    let result = TestResult {
        crashed: false,
        exit_code: -1,
        stdout: String::new(),
        stderr: err.to_string(),
    };
    TestOutcome::new(case, result, Vec::new())
}

fn drain<R>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>>
where
    R: std::io::Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        buffer
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::{StageCount, StageInfo};
    use std::sync::Arc;

    fn case(data: &[u8]) -> TestCase {
        TestCase {
            data: data.to_vec(),
            file_extension: ".bin".to_string(),
            source_file: None,
            stage: Arc::new(StageInfo {
                name: "bitflip 1/1".to_string(),
                cases_per_example: StageCount::PerByte(8),
            }),
        }
    }

    fn byte_entry_point(
        harness: impl FnMut(&[u8]) -> TestResult + Send + 'static,
    ) -> EntryPoint {
        EntryPoint::Bytes(Box::new(harness))
    }

    #[test]
    fn in_process_runner_reports_the_entry_point_verdict() {
        let _guard = crate::coverage::test_support::env_lock();
        let entry = byte_entry_point(|data| TestResult {
            crashed: data.first() == Some(&0xFF),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        });
        let mut executor =
            InProcessExecutor::new(entry, 32, DEFAULT_CRASH_EXIT_CODE).expect("construct runner");

        let calm = executor.execute_test(case(&[0x00]));
        assert!(!calm.result.crashed);
        assert!(!calm.new_path_found, "runners never claim novelty");
        assert_eq!(calm.coverage.len(), 32);

        let crash = executor.execute_test(case(&[0xFF]));
        assert!(crash.result.crashed);
    }

    #[test]
    fn in_process_runner_publishes_the_region_name() {
        let _guard = crate::coverage::test_support::env_lock();
        let entry = byte_entry_point(|_| TestResult::default());
        let _executor =
            InProcessExecutor::new(entry, 16, DEFAULT_CRASH_EXIT_CODE).expect("construct runner");
        let published = std::env::var(SHARED_MEMORY_ENV_VAR).expect("name published");
        assert!(CoverageMap::backing_path(&published).exists());
    }

    #[test]
    fn in_process_runner_converts_panics_into_crashes() {
        let _guard = crate::coverage::test_support::env_lock();
        let entry = byte_entry_point(|data| {
            if data.first() == Some(&0x41) {
                panic!("boom at 0x41");
            }
            TestResult::default()
        });
        let mut executor =
            InProcessExecutor::new(entry, 16, DEFAULT_CRASH_EXIT_CODE).expect("construct runner");
        let outcome = executor.execute_test(case(&[0x41]));
        assert!(outcome.result.crashed);
        assert_eq!(outcome.result.exit_code, DEFAULT_CRASH_EXIT_CODE as i32);
        assert!(outcome.result.stderr.contains("boom at 0x41"));
    }

    #[test]
    fn text_entry_points_receive_lossily_decoded_input() {
        let _guard = crate::coverage::test_support::env_lock();
        let entry = EntryPoint::Text(Box::new(|text: &str| TestResult {
            crashed: false,
            exit_code: 0,
            stdout: text.to_string(),
            stderr: String::new(),
        }));
        let mut executor =
            InProcessExecutor::new(entry, 16, DEFAULT_CRASH_EXIT_CODE).expect("construct runner");
        let outcome = executor.execute_test(case(&[b'h', b'i', 0xFF]));
        assert!(outcome.result.stdout.starts_with("hi"));
    }

    #[cfg(unix)]
    mod child_process {
        use super::*;

        fn config(command: &[&str]) -> CommandExecutorConfig {
            CommandExecutorConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
                input_delivery: InputDelivery::OnStandardInput,
                crash_exit_code: DEFAULT_CRASH_EXIT_CODE,
                map_size: 16,
                timeout: None,
            }
        }

        #[test]
        fn captures_stdout_and_stderr_from_the_child() {
            let mut executor = CommandExecutor::new(config(&[
                "sh",
                "-c",
                "cat >/dev/null; echo out-text; echo err-text >&2",
            ]));
            let outcome = executor.execute_test(case(b"fed to stdin"));
            assert!(!outcome.result.crashed);
            assert_eq!(outcome.result.exit_code, 0);
            assert!(outcome.result.stdout.contains("out-text"));
            assert!(outcome.result.stderr.contains("err-text"));
            assert_eq!(outcome.coverage.len(), 16, "region read after exit");
        }

        #[test]
        fn delivers_input_on_the_command_line_when_configured() {
            let mut cfg = config(&["sh", "-c", "echo \"$1\"", "argv-target"]);
            cfg.input_delivery = InputDelivery::OnCommandLine;
            let mut executor = CommandExecutor::new(cfg);
            let outcome = executor.execute_test(case(b"payload"));
            assert!(outcome.result.stdout.contains("payload"));
        }

        #[test]
        fn classifies_the_sentinel_exit_code_as_a_crash() {
            let mut cfg = config(&["sh", "-c", "exit 77"]);
            cfg.crash_exit_code = 77;
            let mut executor = CommandExecutor::new(cfg);
            let outcome = executor.execute_test(case(&[0x00]));
            assert!(outcome.result.crashed);
            assert_eq!(outcome.result.exit_code, 77);
        }

        #[test]
        fn tracks_other_nonzero_exits_as_plain_failures() {
            let mut executor = CommandExecutor::new(config(&["sh", "-c", "exit 3"]));
            let outcome = executor.execute_test(case(&[0x00]));
            assert!(!outcome.result.crashed);
            assert_eq!(outcome.result.exit_code, 3);
        }

        #[test]
        fn classifies_the_default_sentinel_without_any_override() {
            let exit_line = format!("exit {DEFAULT_CRASH_EXIT_CODE}");
            let mut executor = CommandExecutor::new(config(&["sh", "-c", &exit_line]));
            let outcome = executor.execute_test(case(&[0x00]));
            assert!(
                outcome.result.crashed,
                "the stock sentinel must survive the kernel's exit-status truncation"
            );
            assert_eq!(outcome.result.exit_code as u32, DEFAULT_CRASH_EXIT_CODE);
        }

        #[test]
        fn a_signal_death_is_not_a_crash() {
            let mut executor = CommandExecutor::new(config(&["sh", "-c", "kill -SEGV $$"]));
            let outcome = executor.execute_test(case(&[0x00]));
            assert!(
                !outcome.result.crashed,
                "crash detection is the exit-code check alone"
            );
            assert_eq!(outcome.result.exit_code, -1);
        }

        #[test]
        fn publishes_a_region_name_in_the_child_environment() {
            let mut executor = CommandExecutor::new(config(&[
                "sh",
                "-c",
                "printf '%s' \"$FIZIL_SHARED_MEMORY\"",
            ]));
            let outcome = executor.execute_test(case(&[0x00]));
            assert!(
                outcome.result.stdout.starts_with("fizil-cov-"),
                "child saw '{}'",
                outcome.result.stdout
            );
        }

        #[test]
        fn a_spawn_failure_becomes_a_noncrash_outcome() {
            let mut executor =
                CommandExecutor::new(config(&["/nonexistent-fizil-target-binary"]));
            let outcome = executor.execute_test(case(&[0x00]));
            assert!(!outcome.result.crashed);
            assert_eq!(outcome.result.exit_code, -1);
            assert!(
                outcome.result.stderr.contains("failed to spawn"),
                "stderr carries the runner error: {}",
                outcome.result.stderr
            );
        }

        #[test]
        fn a_hung_child_is_torn_down_at_the_deadline() {
            let mut cfg = config(&["sleep", "30"]);
            cfg.timeout = Some(Duration::from_millis(50));
            let mut executor = CommandExecutor::new(cfg);
            let started = Instant::now();
            let outcome = executor.execute_test(case(&[0x00]));
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!outcome.result.crashed);
            assert!(outcome.result.stderr.contains("time limit"));
        }

        #[test]
        fn a_child_closing_stdin_early_is_not_a_failure() {
            let payload = vec![0x41u8; 1 << 20];
            let mut executor = CommandExecutor::new(config(&["sh", "-c", "exit 0"]));
            let outcome = executor.execute_test(case(&payload));
            assert!(!outcome.result.crashed);
            assert!(outcome.result.stderr.is_empty());
        }
    }
}
