use crate::executor::{DEFAULT_CRASH_EXIT_CODE, DEFAULT_MAP_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("isolation mode 'in-process' needs an entry point registered by the host application")]
    MissingEntryPoint,
    #[error("isolation mode 'out-of-process' needs a [target] section with a non-empty command")]
    MissingTargetCommand,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    InProcess,
    OutOfProcess,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InputDeliveryMode {
    OnCommandLine,
    OnStandardInput,
}

fn default_isolation() -> IsolationMode {
    IsolationMode::OutOfProcess
}

fn default_input_delivery() -> InputDeliveryMode {
    InputDeliveryMode::OnStandardInput
}

fn default_crash_exit_code() -> u32 {
    DEFAULT_CRASH_EXIT_CODE
}

fn default_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub command: Vec<String>,
    #[serde(default = "default_input_delivery")]
    pub input_delivery: InputDeliveryMode,
    #[serde(default = "default_crash_exit_code")]
    pub crash_exit_code: u32,
    pub timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FizilConfig {
    /// Directory holding the seed examples; findings land next to them.
    pub examples: PathBuf,
    pub dictionary: Option<PathBuf>,
    #[serde(default = "default_isolation")]
    pub isolation: IsolationMode,
    #[serde(default = "default_map_size")]
    pub map_size: usize,
    /// Worker threads for out-of-process runs; defaults to the machine's
    /// available parallelism.
    pub workers: Option<usize>,
    pub target: Option<TargetSettings>,
}

impl FizilConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Cross-field checks the deserializer cannot express. `has_entry_point`
    /// reports whether the host application bound an in-process entry point.
    pub fn validate(&self, has_entry_point: bool) -> Result<(), ConfigError> {
        match self.isolation {
            IsolationMode::InProcess if !has_entry_point => Err(ConfigError::MissingEntryPoint),
            IsolationMode::OutOfProcess => match &self.target {
                Some(target) if !target.command.is_empty() => Ok(()),
                _ => Err(ConfigError::MissingTargetCommand),
            },
            _ => Ok(()),
        }
    }

    pub fn crash_exit_code(&self) -> u32 {
        self.target
            .as_ref()
            .map(|target| target.crash_exit_code)
            .unwrap_or(DEFAULT_CRASH_EXIT_CODE)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.target
            .as_ref()
            .and_then(|target| target.timeout_ms)
            .map(Duration::from_millis)
    }
}
