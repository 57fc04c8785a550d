//! exmake - scriptable, dependency-driven build engine
//!
//! Given rules binding output files to input files and recipes, exmake
//! builds requested targets in dependency order, running independent
//! recipes concurrently and skipping work whose outputs are already up to
//! date. The computed graph, the script-authored environment table, and the
//! compiled script artifacts are cached across runs under `.exmake/`.
//!
//! ## Architecture
//!
//! The engine is three long-lived pieces plus a runner per job:
//!
//! 1. **Coordinator** (`coordinator`): single actor owning configuration,
//!    the in-flight job set, the FIFO overflow queue, and the
//!    loaded-libraries set; enforces the `--jobs` bound.
//! 2. **Worker driver** (`worker`): top-level routine deciding cache state,
//!    loading or restoring the graph, and draining pruned sub-graphs leaf
//!    by leaf.
//! 3. **Runner** (`runner`): one task per job, enforcing the recipe
//!    contract and cleaning up partial outputs on failure.
//!
//! Scripts are evaluated by an external collaborator behind
//! [`ScriptEvaluator`]; the bundled [`StaticEvaluator`] hosts modules
//! registered from Rust.
//!
//! ## Usage
//!
//! ```no_run
//! use exmake::{BuildSession, Config, StaticEvaluator};
//!
//! # async fn example() -> i32 {
//! let mut host = StaticEvaluator::new();
//! // host.add_script(...) describes the build.
//!
//! let mut session = BuildSession::new(Box::new(host));
//! // session.registry.register(...) supplies the recipe callables.
//!
//! exmake::worker::run(&mut session, Config::with_targets(["all"])).await
//! # }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod library;
pub mod loader;
pub mod logger;
pub mod paths;
pub mod runner;
pub mod script;
pub mod shell;
pub mod timing;
pub mod worker;

pub use config::{Config, Options};
pub use coordinator::{CoordinatorHandle, Done, JobResult};
pub use error::{Error, Result};
pub use evaluator::{CompiledModule, ModuleMetadata, ScriptEvaluator, StaticEvaluator};
pub use library::LibraryMetadata;
pub use script::{
    Fallback, RecipeCall, RecipeFault, RecipeRef, RecipeRegistry, Rule, ScriptRecord, Task,
    WorkUnit,
};
pub use shell::shell;
pub use worker::BuildSession;
