//! Trace configuration

use std::path::PathBuf;

use thiserror::Error;

/// Environment variable selecting where completed trace trees go.
pub const OUTPUT_ENV: &str = "CALLTRAP_TRACE_OUTPUT";
/// Environment variable overriding [`TraceConfig::max_depth`].
pub const MAX_DEPTH_ENV: &str = "CALLTRAP_TRACE_MAX_DEPTH";

pub const DEFAULT_MAX_DEPTH: usize = calltrap_object::json::DEFAULT_DEPTH_LIMIT;

/// Where completed root events are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TraceOutput {
    /// Kept on the recording thread until [`take_roots`](super::take_roots).
    #[default]
    Memory,
    /// One JSON document per line on stdout.
    Stdout,
    /// One `<pkg>.<name>-<seq>.json` file per root event.
    Dir(PathBuf),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceConfigError {
    #[error("invalid CALLTRAP_TRACE_MAX_DEPTH value '{0}': expected a non-negative integer")]
    InvalidMaxDepth(String),
}

/// Trace settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    pub output: TraceOutput,
    /// Snapshot nesting beyond this depth is replaced by `{}`.
    pub max_depth: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            output: TraceOutput::Memory,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl TraceConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn stdout() -> Self {
        Self {
            output: TraceOutput::Stdout,
            ..Self::default()
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            output: TraceOutput::Dir(path.into()),
            ..Self::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Read `CALLTRAP_TRACE_OUTPUT` and `CALLTRAP_TRACE_MAX_DEPTH`.
    ///
    /// Output values: unset, empty, `off` or `memory` keep events in memory;
    /// `stdout` prints them; anything else is a directory path.
    pub fn from_env() -> Result<Self, TraceConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TraceConfigError> {
        let output = match lookup(OUTPUT_ENV).as_deref().map(str::trim) {
            None | Some("") | Some("off") | Some("memory") => TraceOutput::Memory,
            Some("stdout") => TraceOutput::Stdout,
            Some(dir) => TraceOutput::Dir(PathBuf::from(dir)),
        };
        let max_depth = match lookup(MAX_DEPTH_ENV) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map_err(|_| TraceConfigError::InvalidMaxDepth(raw.clone()))?,
            _ => DEFAULT_MAX_DEPTH,
        };
        Ok(Self { output, max_depth })
    }
}
