//! Pass timing for `--time`.
//!
//! The session lives in the coordinator; the worker opens and closes named
//! passes around the phases of a build and prints the table at the end.

use std::time::{Duration, Instant};

/// One finished pass.
#[derive(Debug, Clone)]
pub struct Pass {
    /// Pass name.
    pub name: String,
    /// Wall-clock duration.
    pub elapsed: Duration,
}

/// A timing session: finished passes plus at most one open pass.
#[derive(Debug, Clone)]
pub struct Session {
    started: Instant,
    passes: Vec<Pass>,
    current: Option<(String, Instant)>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Start a session.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            passes: Vec::new(),
            current: None,
        }
    }

    /// Open a named pass, closing any pass left open.
    pub fn pass_go(&mut self, name: impl Into<String>) {
        self.pass_end();
        self.current = Some((name.into(), Instant::now()));
    }

    /// Close the open pass, if any.
    pub fn pass_end(&mut self) {
        if let Some((name, started)) = self.current.take() {
            self.passes.push(Pass {
                name,
                elapsed: started.elapsed(),
            });
        }
    }

    /// Finished passes, in order.
    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    /// Total wall-clock time since the session started.
    pub fn total(&self) -> Duration {
        self.started.elapsed()
    }

    /// Render the report table.
    pub fn render(&self) -> String {
        let mut out = String::from("Pass timings:\n");
        let width = self
            .passes
            .iter()
            .map(|p| p.name.len())
            .max()
            .unwrap_or(0)
            .max(5);
        for pass in &self.passes {
            out.push_str(&format!(
                "  {:<width$}  {:>9.3}s\n",
                pass.name,
                pass.elapsed.as_secs_f64(),
            ));
        }
        out.push_str(&format!(
            "  {:<width$}  {:>9.3}s\n",
            "total",
            self.total().as_secs_f64(),
        ));
        out
    }
}
