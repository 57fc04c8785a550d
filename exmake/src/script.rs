//! Build script data model: rules, tasks, fallbacks, and the recipe registry.
//!
//! Recipes are opaque callables owned by the host application. The graph and
//! the cache only ever see a serializable [`RecipeRef`]; the callable itself
//! is looked up in the [`RecipeRegistry`] at job dispatch time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Opaque reference to an executable recipe in some loaded script module,
/// bearing the arity it accepts.
///
/// Arities: rules take 2 (sources, targets) or 3 (sources, targets,
/// directory); tasks take 3 (name, sources, directory); fallbacks take 1
/// (directory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeRef {
    /// Module identifier the recipe is defined in.
    pub module: String,
    /// Recipe name within the module.
    pub name: String,
    /// Number of arguments the callable accepts.
    pub arity: u8,
}

impl RecipeRef {
    /// Build a reference.
    pub fn new(module: impl Into<String>, name: impl Into<String>, arity: u8) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            arity,
        }
    }

    fn key(&self) -> (String, String) {
        (self.module.clone(), self.name.clone())
    }
}

/// Argument shape a recipe is invoked with.
#[derive(Debug, Clone)]
pub enum RecipeCall {
    /// File rule: sources and targets, plus the script directory at arity 3.
    Rule {
        /// Anchored source paths.
        sources: Vec<PathBuf>,
        /// Anchored target paths.
        targets: Vec<PathBuf>,
        /// Script directory; `None` at arity 2.
        directory: Option<PathBuf>,
    },
    /// Named task: qualified name, sources, script directory.
    Task {
        /// Anchored task name.
        name: PathBuf,
        /// Anchored sources (tasks and files alike).
        sources: Vec<PathBuf>,
        /// Script directory.
        directory: PathBuf,
    },
    /// Fallback: script directory only.
    Fallback {
        /// Script directory.
        directory: PathBuf,
    },
    /// Library `on_load` hook: declared args plus the invocation tail.
    Hook {
        /// Arguments from the `load_lib` declaration.
        args: Vec<String>,
        /// Opaque tail arguments of the invocation.
        tail_args: Vec<String>,
    },
}

/// How a recipe invocation fails.
#[derive(Debug)]
pub enum RecipeFault {
    /// A non-error value was thrown; surfaces as `ThrowError`.
    Throw(String),
    /// A real error was raised.
    Fail(Error),
}

/// The callable type recipes are registered as.
pub type RecipeFn = dyn Fn(RecipeCall) -> Result<(), RecipeFault> + Send + Sync;

/// Process-wide table of recipe callables, keyed by module identifier and
/// recipe name. The host registers; the coordinator resolves at dispatch.
#[derive(Default)]
pub struct RecipeRegistry {
    inner: RwLock<HashMap<(String, String), Arc<RecipeFn>>>,
}

impl RecipeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable under `(module, name)`. Re-registration replaces.
    pub fn register<F>(&self, module: impl Into<String>, name: impl Into<String>, recipe: F)
    where
        F: Fn(RecipeCall) -> Result<(), RecipeFault> + Send + Sync + 'static,
    {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.insert((module.into(), name.into()), Arc::new(recipe));
    }

    /// Resolve a reference to its callable.
    pub fn lookup(&self, recipe: &RecipeRef) -> Option<Arc<RecipeFn>> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.get(&recipe.key()).cloned()
    }
}

/// A file rule: targets produced from sources by a recipe, anchored to the
/// declaring script's directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Output files, anchored. Non-empty, globally unique.
    pub targets: Vec<PathBuf>,
    /// Input files, anchored. May be empty.
    pub sources: Vec<PathBuf>,
    /// Recipe reference (arity 2 or 3).
    pub recipe: RecipeRef,
    /// Directory of the declaring script.
    pub directory: PathBuf,
}

/// A named task: like a rule, but its output is symbolic and it always runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Qualified task name, anchored like a path.
    pub name: PathBuf,
    /// Declared sources: files or other task names, anchored.
    pub sources: Vec<PathBuf>,
    /// The subset of `sources` that must exist as files on disk.
    pub real_sources: Vec<PathBuf>,
    /// Recipe reference (arity 3).
    pub recipe: RecipeRef,
    /// Directory of the declaring script.
    pub directory: PathBuf,
}

/// A fallback recipe, run only when a requested target cannot be resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fallback {
    /// Recipe reference (arity 1).
    pub recipe: RecipeRef,
    /// Directory of the declaring script.
    pub directory: PathBuf,
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkUnit {
    /// A file rule.
    Rule(Rule),
    /// A named task.
    Task(Task),
    /// A fallback recipe.
    Fallback(Fallback),
}

impl WorkUnit {
    /// Human-readable name for log and error messages: the first target, the
    /// task name, or `(fallback)`.
    pub fn display_name(&self) -> String {
        match self {
            WorkUnit::Rule(rule) => rule
                .targets
                .first()
                .map(|t| t.display().to_string())
                .unwrap_or_else(|| "(rule)".to_string()),
            WorkUnit::Task(task) => task.name.display().to_string(),
            WorkUnit::Fallback(_) => "(fallback)".to_string(),
        }
    }

    /// Declared output files. Empty for tasks and fallbacks.
    pub fn targets(&self) -> &[PathBuf] {
        match self {
            WorkUnit::Rule(rule) => &rule.targets,
            _ => &[],
        }
    }

    /// Sources that must exist on disk before the unit may run.
    pub fn required_sources(&self) -> &[PathBuf] {
        match self {
            WorkUnit::Rule(rule) => &rule.sources,
            WorkUnit::Task(task) => &task.real_sources,
            WorkUnit::Fallback(_) => &[],
        }
    }
}

/// Rule declaration as surfaced by the script evaluator, before path
/// anchoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDecl {
    /// Declared target paths, relative to the script directory.
    pub targets: Vec<String>,
    /// Declared source paths, relative to the script directory.
    pub sources: Vec<String>,
    /// Recipe reference.
    pub recipe: RecipeRef,
    /// Source line of the declaration, for error citations.
    pub line: u32,
}

/// Task declaration as surfaced by the script evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecl {
    /// Declared task name.
    pub name: String,
    /// Declared sources: files or task names.
    pub sources: Vec<String>,
    /// Recipe reference.
    pub recipe: RecipeRef,
    /// Source line of the declaration.
    pub line: u32,
}

/// Fallback declaration as surfaced by the script evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackDecl {
    /// Recipe reference.
    pub recipe: RecipeRef,
    /// Source line of the declaration.
    pub line: u32,
}

/// Sub-directory inclusion declared by a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScriptDecl {
    /// Sub-directory name. Must not contain path separators.
    pub directory: String,
    /// Script file name within the sub-directory.
    pub file_name: String,
    /// Source line of the declaration.
    pub line: u32,
}

/// Library load declared by a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryUse {
    /// Library identifier.
    pub name: String,
    /// Arguments passed to the library's `on_load` hook.
    pub args: Vec<String>,
    /// Whether the identifier is already fully qualified.
    pub qualified: bool,
    /// Source line of the declaration.
    pub line: u32,
}

/// Everything extracted from one loaded script.
#[derive(Debug, Clone)]
pub struct ScriptRecord {
    /// Directory the script was loaded from.
    pub directory: PathBuf,
    /// File name of the script within `directory`.
    pub file_name: String,
    /// Identifier of the script's `.Exmakefile` module.
    pub module: String,
    /// Compiled artifact bytes, persisted verbatim by the cache.
    pub artifact: Vec<u8>,
    /// Declared rules.
    pub rules: Vec<RuleDecl>,
    /// Declared tasks.
    pub tasks: Vec<TaskDecl>,
    /// Declared fallbacks.
    pub fallbacks: Vec<FallbackDecl>,
    /// Declared manifest entries, relative to `directory`.
    pub manifest: Vec<String>,
    /// Declared sub-directory inclusions.
    pub sub_scripts: Vec<SubScriptDecl>,
}

impl ScriptRecord {
    /// Path of the script file itself.
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}
