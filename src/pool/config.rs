//! Pool configuration.
//!
//! Configuration can be built in code (`PoolConfig::new` plus `with_*`
//! setters) or loaded from `INTERP_POOL_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

use super::dialect::DialectKind;

/// Environment variable holding the interpreter binary path.
pub const ENV_BIN: &str = "INTERP_POOL_BIN";
/// Environment variable holding the number of instances.
pub const ENV_PARALLELISM: &str = "INTERP_POOL_PARALLELISM";
/// Environment variable selecting the dialect (`r` or `sh`).
pub const ENV_DIALECT: &str = "INTERP_POOL_DIALECT";
/// Environment variable overriding the interpreter arguments.
pub const ENV_ARGS: &str = "INTERP_POOL_ARGS";
/// Environment variable holding the instances' working directory.
pub const ENV_WORKDIR: &str = "INTERP_POOL_WORKDIR";
/// Environment variable holding the handshake timeout in seconds.
pub const ENV_HANDSHAKE_TIMEOUT: &str = "INTERP_POOL_HANDSHAKE_TIMEOUT_SECS";

/// Configuration for a [`WorkerPool`](super::WorkerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path of the interpreter executable. Must exist when the pool is built.
    pub binary: PathBuf,
    /// Number of interpreter instances to keep alive.
    pub parallelism: usize,
    /// Dialect used to talk to the interpreter.
    pub dialect: DialectKind,
    /// Overrides the dialect's launch arguments.
    pub args: Option<Vec<String>>,
    /// Working directory of every instance.
    pub working_dir: PathBuf,
    /// How long `start` waits for every handshake. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("R"),
            parallelism: default_parallelism(),
            dialect: DialectKind::R,
            args: None,
            working_dir: default_working_dir(),
            handshake_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration for the given interpreter binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Default::default()
        }
    }

    /// Sets the number of instances. Zero selects the host's core count.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = if parallelism < 1 {
            default_parallelism()
        } else {
            parallelism
        };
        self
    }

    /// Sets the dialect.
    pub fn with_dialect(mut self, dialect: DialectKind) -> Self {
        self.dialect = dialect;
        self
    }

    /// Overrides the interpreter's launch arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = Some(args);
        self
    }

    /// Sets the working directory of the instances.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Arguments the interpreter is launched with.
    pub fn launch_args(&self) -> Vec<String> {
        self.args
            .clone()
            .unwrap_or_else(|| self.dialect.dialect().args())
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `INTERP_POOL_BIN`: Interpreter binary (required)
    /// - `INTERP_POOL_PARALLELISM`: Number of instances (default: host cores)
    /// - `INTERP_POOL_DIALECT`: `r` or `sh` (default: r)
    /// - `INTERP_POOL_ARGS`: Whitespace-separated launch arguments
    /// - `INTERP_POOL_WORKDIR`: Working directory of the instances
    /// - `INTERP_POOL_HANDSHAKE_TIMEOUT_SECS`: Handshake timeout (default: none)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let binary = lookup(ENV_BIN).ok_or_else(|| ConfigError::MissingEnvVar(ENV_BIN.to_string()))?;
        let mut config = Self::new(binary);

        if let Some(val) = lookup(ENV_PARALLELISM) {
            let parallelism: usize = parse_env_value(&val, ENV_PARALLELISM)?;
            config = config.with_parallelism(parallelism);
        }

        if let Some(val) = lookup(ENV_DIALECT) {
            config.dialect = parse_env_value(&val, ENV_DIALECT)?;
        }

        if let Some(val) = lookup(ENV_ARGS) {
            config.args = Some(val.split_whitespace().map(String::from).collect());
        }

        if let Some(val) = lookup(ENV_WORKDIR) {
            config.working_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup(ENV_HANDSHAKE_TIMEOUT) {
            let secs: u64 = parse_env_value(&val, ENV_HANDSHAKE_TIMEOUT)?;
            config.handshake_timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// Existence of the binary is checked when the pool is built, not here.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "binary cannot be empty".to_string(),
            ));
        }

        if self.parallelism == 0 {
            return Err(ConfigError::ValidationFailed(
                "parallelism must be greater than 0".to_string(),
            ));
        }

        if let Some(timeout) = self.handshake_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(
                    "handshake_timeout must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Number of instances used when none is configured: the host's core count.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Default working directory of the instances: this crate's own directory
/// when it still exists, otherwise the current directory.
pub fn default_working_dir() -> PathBuf {
    let crate_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    if crate_dir.is_dir() {
        return crate_dir.to_path_buf();
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Resolves an interpreter name to an existing file.
///
/// Names with more than one path component are checked as given; bare names
/// are searched for on `PATH`.
pub fn locate_binary(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn parse_env_value<T: FromStr>(val: &str, key: &str) -> Result<T, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{}'", val),
    })
}
