//! Command-line surface.
//!
//! `exmake [switches] [--] [targets] [--args tail-args]`. The `--args` tail
//! is split off before clap ever sees the argument vector, so it stays fully
//! opaque; `--` forces the remainder (up to `--args`) to parse as target
//! names.

use clap::Parser;
use clap::error::ErrorKind;

use crate::config::{Config, Options};
use crate::error::{Error, Result};

/// Scriptable dependency-driven build tool
#[derive(Parser, Debug)]
#[command(name = "exmake")]
#[command(about = "Scriptable dependency-driven build tool")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Entry script path
    #[arg(short, long, value_name = "PATH", default_value = "Exmakefile")]
    file: String,

    /// Echo every shell command recipes run
    #[arg(short, long)]
    loud: bool,

    /// Only check whether the targets are up to date
    #[arg(short, long)]
    question: bool,

    /// Maximum number of concurrently running recipes
    #[arg(short, long, value_name = "N", default_value_t = 1,
          value_parser = clap::value_parser!(u64).range(1..))]
    jobs: u64,

    /// Print a pass-timing report after the build
    #[arg(short, long)]
    time: bool,

    /// Clear the cache before building
    #[arg(short, long)]
    clear: bool,

    /// Print version information and exit
    #[arg(short = 'v', long)]
    version: bool,

    /// Target names to build
    targets: Vec<String>,
}

/// What an argument vector parsed into.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Run a build with this configuration.
    Run(Config),
    /// Exit immediately with this code (help or version was requested).
    Exit(i32),
}

/// Split the opaque `--args` tail off an argument vector. The first `-a` or
/// `--args` token ends option parsing; everything after it is the tail.
fn split_tail(argv: &[String]) -> (Vec<String>, Vec<String>) {
    match argv.iter().position(|a| a == "--args" || a == "-a") {
        Some(pos) => (argv[..pos].to_vec(), argv[pos + 1..].to_vec()),
        None => (argv.to_vec(), Vec::new()),
    }
}

/// Parse an argument vector (including the program name at index 0).
///
/// # Errors
///
/// Returns `Error::Usage` for malformed switches.
pub fn parse(argv: &[String]) -> Result<ParseOutcome> {
    let (head, tail) = split_tail(argv);

    let cli = match Cli::try_parse_from(&head) {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => {
            let _ = e.print();
            return Ok(ParseOutcome::Exit(2));
        }
        Err(e) => {
            return Err(Error::Usage(e.to_string()));
        }
    };

    if cli.version {
        println!("exmake {}", env!("CARGO_PKG_VERSION"));
        return Ok(ParseOutcome::Exit(2));
    }

    let targets = if cli.targets.is_empty() {
        vec!["all".to_string()]
    } else {
        cli.targets
    };

    Ok(ParseOutcome::Run(Config {
        targets,
        options: Options {
            help: false,
            version: false,
            file: cli.file,
            loud: cli.loud,
            question: cli.question,
            jobs: cli.jobs as usize,
            time: cli.time,
            clear: cli.clear,
        },
        args: tail,
    }))
}
