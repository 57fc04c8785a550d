//! Error taxonomy for the build engine.
//!
//! Every failure surfaced to the user renders as `ExMake.<Kind>Error: ...`.
//! The kinds are stable; the message text is free-form.

use std::path::{Path, PathBuf};
use thiserror::Error;

fn script_path(directory: &Path, file: &str) -> String {
    directory.join(file).display().to_string()
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure kinds the engine can report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Bad command-line arguments, or a source file missing at build time.
    #[error("ExMake.UsageError: {0}")]
    Usage(String),

    /// Script file absent, unreadable, or invalid; or the one-module-per-script
    /// rule was violated.
    #[error("ExMake.LoadError: {}: {message}", script_path(.directory, .file))]
    Load {
        /// File name of the script that failed to load.
        file: String,
        /// Directory the script was loaded from.
        directory: PathBuf,
        /// Underlying failure description.
        message: String,
    },

    /// Malformed declaration, duplicate target, name collision, cyclic
    /// dependency, or a recipe contract violation.
    #[error("ExMake.ScriptError: {0}")]
    Script(String),

    /// I/O failure persisting or restoring a cache file.
    #[error("ExMake.CacheError: {0}")]
    Cache(String),

    /// A subprocess invoked by a recipe exited non-zero.
    #[error("ExMake.ShellError: command exited with code {exit_code}: {command}\n{output}")]
    Shell {
        /// The command line handed to the shell.
        command: String,
        /// Captured stdout and stderr, interleaved.
        output: String,
        /// Exit code, or -1 when terminated by a signal.
        exit_code: i32,
    },

    /// Mismatched string/list operation on an environment entry.
    #[error("ExMake.EnvError: {0}")]
    Env(String),

    /// Raised only under `--question` when some rule is stale. Carries no
    /// message and is never logged.
    #[error("ExMake.StaleError: targets are not up to date")]
    Stale,

    /// A non-exception value was thrown inside a recipe.
    #[error("ExMake.ThrowError: value thrown in recipe: {0}")]
    Throw(String),
}

impl Error {
    /// True for the errors that exit silently (no log line).
    pub fn is_quiet(&self) -> bool {
        matches!(self, Error::Stale)
    }
}
