//! Subprocess helper for recipes.
//!
//! Commands are expanded against the environment table (`${KEY}`), run
//! through `sh -c`, and their combined output captured. A non-zero exit
//! becomes a `ShellError` carrying the command and output. Under `--loud`
//! every command is echoed before it runs.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::env;
use crate::error::{Error, Result};

static LOUD: AtomicBool = AtomicBool::new(false);

/// Set by the worker from `--loud`.
pub fn set_loud(loud: bool) {
    LOUD.store(loud, Ordering::Relaxed);
}

/// Is command echoing on?
pub fn loud() -> bool {
    LOUD.load(Ordering::Relaxed)
}

/// Run a shell command after `${KEY}` expansion, returning captured stdout.
///
/// # Errors
///
/// `Error::Shell` when the command cannot be spawned or exits non-zero; the
/// error carries the expanded command line and the combined output.
pub fn shell(command: &str) -> Result<String> {
    let expanded = env::expand(command);

    if loud() {
        println!("{expanded}");
    } else {
        debug!(command = %expanded, "shell");
    }

    let output = Command::new("sh")
        .arg("-c")
        .arg(&expanded)
        .output()
        .map_err(|e| Error::Shell {
            command: expanded.clone(),
            output: e.to_string(),
            exit_code: -1,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        let mut combined = stdout;
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(Error::Shell {
            command: expanded,
            output: combined,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
