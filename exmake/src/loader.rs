//! Loader façade over the script evaluator.
//!
//! Evaluates the entry script, enforces the one-`.Exmakefile`-module rule,
//! recurses through declared sub-directories depth-first, loads libraries at
//! most once per build (running their `on_load` hooks), and returns the
//! flattened list of script records plus everything the cache layer needs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::coordinator::CoordinatorHandle;
use crate::error::{Error, Result};
use crate::evaluator::ScriptEvaluator;
use crate::paths;
use crate::script::{RecipeCall, RecipeFault, RecipeRegistry, ScriptRecord};

/// Everything one load pass produced.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    /// Flattened script records, entry script first.
    pub records: Vec<ScriptRecord>,

    /// Every compiled module from every script, for the artifact cache.
    pub artifacts: Vec<(String, Vec<u8>)>,

    /// Precious OS environment variables declared by loaded libraries.
    pub precious: Vec<String>,
}

/// Load `file_name` in `directory` and everything it recurses into.
pub async fn load_scripts(
    evaluator: &mut dyn ScriptEvaluator,
    coordinator: &CoordinatorHandle,
    registry: &Arc<RecipeRegistry>,
    directory: &Path,
    file_name: &str,
    tail_args: &[String],
) -> Result<LoadOutcome> {
    if paths::has_separator(file_name) {
        return Err(Error::Usage(format!(
            "Script file name '{file_name}' must not contain path separators"
        )));
    }

    let mut outcome = LoadOutcome::default();
    let mut visited: HashSet<(PathBuf, String)> = HashSet::new();
    let mut stack: Vec<(PathBuf, String)> =
        vec![(paths::clean(directory), file_name.to_string())];

    while let Some((dir, file)) = stack.pop() {
        // A sub-directory included from two places is loaded once.
        if !visited.insert((dir.clone(), file.clone())) {
            continue;
        }

        let record = load_one(
            evaluator,
            coordinator,
            registry,
            &mut outcome,
            &dir,
            &file,
            tail_args,
        )
        .await?;

        for sub in record.sub_scripts.iter().rev() {
            if sub.directory.is_empty() || paths::has_separator(&sub.directory) {
                return Err(Error::Script(format!(
                    "Invalid recurse in '{}' (line {}): sub-directory '{}' must be a string without path separators",
                    record.path().display(),
                    sub.line,
                    sub.directory
                )));
            }
            if sub.file_name.is_empty() || paths::has_separator(&sub.file_name) {
                return Err(Error::Script(format!(
                    "Invalid recurse in '{}' (line {}): file name '{}' must be a string without path separators",
                    record.path().display(),
                    sub.line,
                    sub.file_name
                )));
            }
            stack.push((paths::clean(&dir.join(&sub.directory)), sub.file_name.clone()));
        }

        outcome.records.push(record);
    }

    debug!(scripts = outcome.records.len(), "scripts loaded");
    Ok(outcome)
}

async fn load_one(
    evaluator: &mut dyn ScriptEvaluator,
    coordinator: &CoordinatorHandle,
    registry: &Arc<RecipeRegistry>,
    outcome: &mut LoadOutcome,
    directory: &Path,
    file_name: &str,
    tail_args: &[String],
) -> Result<ScriptRecord> {
    let load_error = |message: String| Error::Load {
        file: file_name.to_string(),
        directory: directory.to_path_buf(),
        message,
    };

    let modules = evaluator
        .eval_file(directory, file_name)
        .map_err(&load_error)?;

    let mut mains = modules
        .iter()
        .filter(|m| m.identifier.ends_with(".Exmakefile"));
    let main = match (mains.next(), mains.next()) {
        (Some(main), None) => main.clone(),
        (None, _) => {
            return Err(load_error(
                "No module ending in '.Exmakefile' defined".to_string(),
            ));
        }
        (Some(_), Some(_)) => {
            let n = modules
                .iter()
                .filter(|m| m.identifier.ends_with(".Exmakefile"))
                .count();
            return Err(load_error(format!(
                "{n} modules ending in '.Exmakefile' defined"
            )));
        }
    };

    for module in &modules {
        outcome
            .artifacts
            .push((module.identifier.clone(), module.artifact.clone()));
    }

    let metadata = evaluator.describe(&main.identifier)?;

    for lib_use in &metadata.libraries {
        // The libraries set deduplicates on_load across all scripts of one
        // build.
        if coordinator.add_lib(&lib_use.name).await? {
            let library = evaluator.describe_library(&lib_use.name)?;
            debug!(library = %library.name, version = %library.version_string(), "library loaded");
            outcome.precious.extend(library.precious.iter().cloned());

            if let Some(hook_ref) = &library.on_load {
                run_hook(registry, hook_ref, lib_use.args.clone(), tail_args).await?;
            }
        }
    }

    Ok(ScriptRecord {
        directory: directory.to_path_buf(),
        file_name: file_name.to_string(),
        module: main.identifier,
        artifact: main.artifact,
        rules: metadata.rules,
        tasks: metadata.tasks,
        fallbacks: metadata.fallbacks,
        manifest: metadata.manifest,
        sub_scripts: metadata.sub_scripts,
    })
}

async fn run_hook(
    registry: &Arc<RecipeRegistry>,
    hook_ref: &crate::script::RecipeRef,
    args: Vec<String>,
    tail_args: &[String],
) -> Result<()> {
    let hook = registry.lookup(hook_ref).ok_or_else(|| {
        Error::Script(format!(
            "No recipe registered as {}.{}",
            hook_ref.module, hook_ref.name
        ))
    })?;

    let call = RecipeCall::Hook {
        args,
        tail_args: tail_args.to_vec(),
    };
    let joined = tokio::task::spawn_blocking(move || hook(call)).await;
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(RecipeFault::Throw(value))) => Err(Error::Throw(value)),
        Ok(Err(RecipeFault::Fail(error))) => Err(error),
        Err(join_error) => Err(Error::Throw(crate::runner::panic_payload(join_error))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ModuleMetadata, StaticEvaluator};
    use crate::library::LibraryMetadata;
    use crate::script::{LibraryUse, RecipeRef, SubScriptDecl, TaskDecl};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn module(tasks: Vec<TaskDecl>) -> ModuleMetadata {
        ModuleMetadata {
            tasks,
            ..ModuleMetadata::default()
        }
    }

    fn task_decl(name: &str, module: &str) -> TaskDecl {
        TaskDecl {
            name: name.to_string(),
            sources: vec![],
            recipe: RecipeRef::new(module, name, 3),
            line: 1,
        }
    }

    async fn load(
        evaluator: &mut StaticEvaluator,
        registry: &Arc<RecipeRegistry>,
    ) -> Result<LoadOutcome> {
        let coordinator = CoordinatorHandle::spawn(Arc::clone(registry));
        load_scripts(evaluator, &coordinator, registry, Path::new("."), "Exmakefile", &[]).await
    }

    #[tokio::test]
    async fn test_single_module_loads() {
        let mut evaluator = StaticEvaluator::new();
        evaluator.add_script(
            ".",
            "Exmakefile",
            vec![(
                "Demo.Exmakefile".to_string(),
                module(vec![task_decl("all", "Demo.Exmakefile")]),
            )],
        );

        let registry = Arc::new(RecipeRegistry::new());
        let outcome = load(&mut evaluator, &registry).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].module, "Demo.Exmakefile");
        assert_eq!(outcome.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_no_module_fails() {
        let mut evaluator = StaticEvaluator::new();
        evaluator.add_script(".", "Exmakefile", vec![]);

        let registry = Arc::new(RecipeRegistry::new());
        let err = load(&mut evaluator, &registry).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "ExMake.LoadError: ./Exmakefile: No module ending in '.Exmakefile' defined"
        );
    }

    #[tokio::test]
    async fn test_two_modules_fail() {
        let mut evaluator = StaticEvaluator::new();
        evaluator.add_script(
            ".",
            "Exmakefile",
            vec![
                ("TooManyModules1.Exmakefile".to_string(), module(vec![])),
                ("TooManyModules2.Exmakefile".to_string(), module(vec![])),
            ],
        );

        let registry = Arc::new(RecipeRegistry::new());
        let err = load(&mut evaluator, &registry).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "ExMake.LoadError: ./Exmakefile: 2 modules ending in '.Exmakefile' defined"
        );
    }

    #[tokio::test]
    async fn test_helper_modules_are_allowed() {
        let mut evaluator = StaticEvaluator::new();
        evaluator.add_script(
            ".",
            "Exmakefile",
            vec![
                ("Helpers".to_string(), module(vec![])),
                ("Demo.Exmakefile".to_string(), module(vec![])),
            ],
        );

        let registry = Arc::new(RecipeRegistry::new());
        let outcome = load(&mut evaluator, &registry).await.unwrap();
        assert_eq!(outcome.records[0].module, "Demo.Exmakefile");
        assert_eq!(outcome.artifacts.len(), 2);
    }

    #[tokio::test]
    async fn test_file_name_with_separator_rejected() {
        let mut evaluator = StaticEvaluator::new();
        let registry = Arc::new(RecipeRegistry::new());
        let coordinator = CoordinatorHandle::spawn(Arc::clone(&registry));

        let err = load_scripts(
            &mut evaluator,
            &coordinator,
            &registry,
            Path::new("."),
            "sub/Exmakefile",
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[tokio::test]
    async fn test_recursion_flattens_records() {
        let mut evaluator = StaticEvaluator::new();
        evaluator.add_script(
            ".",
            "Exmakefile",
            vec![(
                "Top.Exmakefile".to_string(),
                ModuleMetadata {
                    sub_scripts: vec![SubScriptDecl {
                        directory: "sub".to_string(),
                        file_name: "Exmakefile".to_string(),
                        line: 2,
                    }],
                    ..ModuleMetadata::default()
                },
            )],
        );
        evaluator.add_script(
            "sub",
            "Exmakefile",
            vec![("Sub.Exmakefile".to_string(), module(vec![]))],
        );

        let registry = Arc::new(RecipeRegistry::new());
        let outcome = load(&mut evaluator, &registry).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].module, "Top.Exmakefile");
        assert_eq!(outcome.records[1].module, "Sub.Exmakefile");
        assert_eq!(outcome.records[1].directory, PathBuf::from("sub"));
    }

    #[tokio::test]
    async fn test_invalid_sub_directory_rejected() {
        let mut evaluator = StaticEvaluator::new();
        evaluator.add_script(
            ".",
            "Exmakefile",
            vec![(
                "Top.Exmakefile".to_string(),
                ModuleMetadata {
                    sub_scripts: vec![SubScriptDecl {
                        directory: "a/b".to_string(),
                        file_name: "Exmakefile".to_string(),
                        line: 2,
                    }],
                    ..ModuleMetadata::default()
                },
            )],
        );

        let registry = Arc::new(RecipeRegistry::new());
        let err = load(&mut evaluator, &registry).await.unwrap_err();
        assert!(matches!(err, Error::Script(_)));
    }

    #[tokio::test]
    async fn test_library_on_load_runs_once() {
        static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

        let mut evaluator = StaticEvaluator::new();
        let uses = vec![LibraryUse {
            name: "c".to_string(),
            args: vec!["gcc".to_string()],
            qualified: false,
            line: 1,
        }];
        evaluator.add_script(
            ".",
            "Exmakefile",
            vec![(
                "Top.Exmakefile".to_string(),
                ModuleMetadata {
                    libraries: uses.clone(),
                    sub_scripts: vec![SubScriptDecl {
                        directory: "sub".to_string(),
                        file_name: "Exmakefile".to_string(),
                        line: 2,
                    }],
                    ..ModuleMetadata::default()
                },
            )],
        );
        evaluator.add_script(
            "sub",
            "Exmakefile",
            vec![(
                "Sub.Exmakefile".to_string(),
                ModuleMetadata {
                    libraries: uses,
                    ..ModuleMetadata::default()
                },
            )],
        );

        let mut library = LibraryMetadata::named("c");
        library.precious = vec!["CC".to_string()];
        library.on_load = Some(RecipeRef::new("Lib.C", "on_load", 2));
        evaluator.add_library(library);

        let registry = Arc::new(RecipeRegistry::new());
        registry.register("Lib.C", "on_load", |call: RecipeCall| {
            if let RecipeCall::Hook { args, .. } = &call {
                assert_eq!(args, &["gcc"]);
            }
            HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let outcome = load(&mut evaluator, &registry).await.unwrap();
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.precious, vec!["CC"]);
    }
}
