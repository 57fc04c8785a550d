//! exmake command-line entry point.
//!
//! Parses the switches into a [`Config`], hands it to the coordinator via
//! the worker driver, and exits with the driver's code. The binary runs
//! against an empty script host; embedding applications construct their own
//! [`BuildSession`] with registered modules and recipes.

use std::process::ExitCode;

use exmake::cli::{self, ParseOutcome};
use exmake::{BuildSession, StaticEvaluator, logger, worker};

#[tokio::main]
async fn main() -> ExitCode {
    logger::init();

    let argv: Vec<String> = std::env::args().collect();
    let config = match cli::parse(&argv) {
        Ok(ParseOutcome::Run(config)) => config,
        Ok(ParseOutcome::Exit(code)) => return ExitCode::from(code as u8),
        Err(error) => {
            println!("{error}");
            return ExitCode::from(1);
        }
    };

    let mut session = BuildSession::new(Box::new(StaticEvaluator::new()));
    let code = worker::run(&mut session, config).await;
    ExitCode::from(code as u8)
}
