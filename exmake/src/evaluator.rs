//! Script evaluator contract and the bundled registry-backed host.
//!
//! The engine does not embed a dynamic language. Whatever evaluates script
//! files — a hosted interpreter, generated code, a static table — plugs in
//! behind [`ScriptEvaluator`] and surfaces one uniform metadata record per
//! module. The bundled [`StaticEvaluator`] keeps modules registered in Rust,
//! which is how embedding applications and the test suite describe their
//! builds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::library::LibraryMetadata;
use crate::paths;
use crate::script::{FallbackDecl, LibraryUse, RuleDecl, SubScriptDecl, TaskDecl};

/// One compiled module produced by evaluating a script file.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModule {
    /// Module identifier. Exactly one per script must end in `.Exmakefile`.
    pub identifier: String,

    /// Compiled artifact bytes, persisted verbatim by the cache.
    pub artifact: Vec<u8>,
}

/// Declarations extracted from one script module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Declared file rules.
    pub rules: Vec<RuleDecl>,

    /// Declared named tasks.
    pub tasks: Vec<TaskDecl>,

    /// Declared fallbacks.
    pub fallbacks: Vec<FallbackDecl>,

    /// Extra manifest entries, relative to the script directory.
    pub manifest: Vec<String>,

    /// Sub-directory inclusions.
    pub sub_scripts: Vec<SubScriptDecl>,

    /// Libraries the script loads.
    pub libraries: Vec<LibraryUse>,
}

/// The external evaluator the loader façade consumes.
pub trait ScriptEvaluator: Send {
    /// Extend the library search path (`EXMAKE_PATH`).
    fn append_search_paths(&mut self, paths: &[PathBuf]);

    /// Evaluate `file_name` in the context of `directory`, returning every
    /// module it defines. Failures are reported as the underlying message;
    /// the loader wraps them into a `LoadError`.
    fn eval_file(
        &mut self,
        directory: &Path,
        file_name: &str,
    ) -> std::result::Result<Vec<CompiledModule>, String>;

    /// Metadata of a previously evaluated or restored module.
    fn describe(&self, module: &str) -> Result<ModuleMetadata>;

    /// Reload a compiled artifact from the cache.
    fn restore(&mut self, module: &str, artifact: &[u8]) -> Result<()>;

    /// Metadata of a library, resolving through the search path.
    fn describe_library(&self, name: &str) -> Result<LibraryMetadata>;
}

/// Registry-backed evaluator: script modules and libraries are registered
/// from Rust, keyed by `(directory, file_name)` and library name.
///
/// Artifact bytes are the serialized module metadata, so cache restore is a
/// genuine round-trip rather than a re-evaluation.
#[derive(Default)]
pub struct StaticEvaluator {
    scripts: HashMap<(PathBuf, String), Vec<(String, ModuleMetadata)>>,
    modules: HashMap<String, ModuleMetadata>,
    libraries: HashMap<String, LibraryMetadata>,
    search_paths: Vec<PathBuf>,
}

impl StaticEvaluator {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the modules a script file evaluates to.
    pub fn add_script(
        &mut self,
        directory: impl AsRef<Path>,
        file_name: impl Into<String>,
        modules: Vec<(String, ModuleMetadata)>,
    ) {
        let key = (paths::clean(directory.as_ref()), file_name.into());
        self.scripts.insert(key, modules);
    }

    /// Register a library.
    pub fn add_library(&mut self, library: LibraryMetadata) {
        self.libraries.insert(library.name.clone(), library);
    }

    /// The accumulated search path.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl ScriptEvaluator for StaticEvaluator {
    fn append_search_paths(&mut self, paths: &[PathBuf]) {
        self.search_paths.extend(paths.iter().cloned());
    }

    fn eval_file(
        &mut self,
        directory: &Path,
        file_name: &str,
    ) -> std::result::Result<Vec<CompiledModule>, String> {
        let key = (paths::clean(directory), file_name.to_string());
        let modules = self
            .scripts
            .get(&key)
            .ok_or_else(|| "script file not found".to_string())?
            .clone();

        let mut compiled = Vec::with_capacity(modules.len());
        for (identifier, metadata) in modules {
            let artifact = serde_json::to_vec(&metadata)
                .map_err(|e| format!("could not compile module '{identifier}': {e}"))?;
            self.modules.insert(identifier.clone(), metadata);
            compiled.push(CompiledModule {
                identifier,
                artifact,
            });
        }
        Ok(compiled)
    }

    fn describe(&self, module: &str) -> Result<ModuleMetadata> {
        self.modules
            .get(module)
            .cloned()
            .ok_or_else(|| Error::Script(format!("module '{module}' is not loaded")))
    }

    fn restore(&mut self, module: &str, artifact: &[u8]) -> Result<()> {
        let metadata: ModuleMetadata = serde_json::from_slice(artifact).map_err(|e| {
            Error::Cache(format!("artifact for module '{module}' is corrupted: {e}"))
        })?;
        self.modules.insert(module.to_string(), metadata);
        Ok(())
    }

    fn describe_library(&self, name: &str) -> Result<LibraryMetadata> {
        self.libraries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Script(format!("library '{name}' not found")))
    }
}
