use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where the output conduit keeps a job's captured bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// In-process buffer.
    #[default]
    Memory,
    /// Temporary file inside the host's capture directory.
    TempFile,
}

impl FromStr for CaptureMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "tempfile" | "file" => Ok(Self::TempFile),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Script host configuration.
///
/// All fields have defaults suitable for an interactive desktop session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Interval between output conduit polls (default: 20 ms).
    pub capture_poll_interval: Duration,
    /// Evaluator operations between abort checks (default: `64`).
    pub checkpoint_interval: u64,
    /// Wait slice while the debugger is halted (default: 25 ms).
    pub debug_halt_poll_interval: Duration,
    /// Hard per-job operation budget, `0` for unlimited (default: `0`).
    pub max_operations: u64,
    /// Output conduit backend (default: memory).
    pub capture_mode: CaptureMode,
    /// Parent of the temp-file capture directory (default: system temp dir).
    pub capture_dir: Option<PathBuf>,
}

const DEFAULT_CAPTURE_POLL_MS: u64 = 20;
const DEFAULT_CHECKPOINT_OPS: u64 = 64;
const DEFAULT_DEBUG_HALT_POLL_MS: u64 = 25;

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            capture_poll_interval: Duration::from_millis(DEFAULT_CAPTURE_POLL_MS),
            checkpoint_interval: DEFAULT_CHECKPOINT_OPS,
            debug_halt_poll_interval: Duration::from_millis(DEFAULT_DEBUG_HALT_POLL_MS),
            max_operations: 0,
            capture_mode: CaptureMode::Memory,
            capture_dir: None,
        }
    }
}

impl HostConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default  |
    /// |-------------------------------|----------|
    /// | `MDSCRIPT_CAPTURE_POLL_MS`    | `20`     |
    /// | `MDSCRIPT_CHECKPOINT_OPS`     | `64`     |
    /// | `MDSCRIPT_DEBUG_HALT_POLL_MS` | `25`     |
    /// | `MDSCRIPT_MAX_OPERATIONS`     | `0`      |
    /// | `MDSCRIPT_CAPTURE_MODE`       | `memory` |
    /// | `MDSCRIPT_CAPTURE_DIR`        | system temp dir |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from an arbitrary
    /// lookup, so parsing can be tested without touching the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let capture_poll_ms = parse_var(&lookup, "MDSCRIPT_CAPTURE_POLL_MS")?
            .unwrap_or(DEFAULT_CAPTURE_POLL_MS);
        let checkpoint_interval = parse_var(&lookup, "MDSCRIPT_CHECKPOINT_OPS")?
            .unwrap_or(defaults.checkpoint_interval);
        let halt_poll_ms = parse_var(&lookup, "MDSCRIPT_DEBUG_HALT_POLL_MS")?
            .unwrap_or(DEFAULT_DEBUG_HALT_POLL_MS);
        let max_operations =
            parse_var(&lookup, "MDSCRIPT_MAX_OPERATIONS")?.unwrap_or(defaults.max_operations);
        let capture_mode =
            parse_var(&lookup, "MDSCRIPT_CAPTURE_MODE")?.unwrap_or(defaults.capture_mode);
        let capture_dir = parse_var(&lookup, "MDSCRIPT_CAPTURE_DIR")?;

        if capture_poll_ms == 0 {
            return Err(invalid("MDSCRIPT_CAPTURE_POLL_MS", "0"));
        }
        if checkpoint_interval == 0 {
            return Err(invalid("MDSCRIPT_CHECKPOINT_OPS", "0"));
        }
        if halt_poll_ms == 0 {
            return Err(invalid("MDSCRIPT_DEBUG_HALT_POLL_MS", "0"));
        }

        Ok(Self {
            capture_poll_interval: Duration::from_millis(capture_poll_ms),
            checkpoint_interval,
            debug_halt_poll_interval: Duration::from_millis(halt_poll_ms),
            max_operations,
            capture_mode,
            capture_dir,
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(var, &raw)),
    }
}

fn invalid(var: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
