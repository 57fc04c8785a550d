//! Build invocation configuration.

use serde::{Deserialize, Serialize};

/// Recognized option switches for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// `-h` / `--help` was requested.
    pub help: bool,

    /// `-v` / `--version` was requested.
    pub version: bool,

    /// Entry script path (`-f` / `--file`).
    pub file: String,

    /// Echo every shell command recipes run (`-l` / `--loud`).
    pub loud: bool,

    /// Only check whether the targets are up to date (`-q` / `--question`).
    pub question: bool,

    /// Maximum number of concurrently running recipes (`-j` / `--jobs`).
    pub jobs: usize,

    /// Print a pass-timing report after the build (`-t` / `--time`).
    pub time: bool,

    /// Clear the cache before deciding anything (`-c` / `--clear`).
    pub clear: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            help: false,
            version: false,
            file: "Exmakefile".to_string(),
            loud: false,
            question: false,
            jobs: 1,
            time: false,
            clear: false,
        }
    }
}

/// Everything one invocation was asked to do: the requested targets, the
/// option switches, and the opaque tail arguments scripts may consume.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Requested target names.
    pub targets: Vec<String>,

    /// Option switches.
    pub options: Options,

    /// Opaque tail handed through to scripts (`--args ...`).
    pub args: Vec<String>,
}

impl Config {
    /// Config for the given targets with default options.
    pub fn with_targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}
