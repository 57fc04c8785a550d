//! Engine-wide properties: ordering, idempotence, bounded parallelism,
//! question mode, and the configuration snapshot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use exmake::cache::CacheStore;
use exmake::evaluator::ModuleMetadata;
use exmake::library::LibraryMetadata;
use exmake::script::{LibraryUse, RuleDecl, TaskDecl};
use exmake::worker::{self, BuildSession};
use exmake::{Config, Error, RecipeCall, RecipeFault, RecipeRef, StaticEvaluator};
use tempfile::TempDir;

static BUILD_LOCK: LazyLock<tokio::sync::Mutex<()>> =
    LazyLock::new(|| tokio::sync::Mutex::const_new(()));

fn rule_decl(module: &str, recipe: &str, targets: &[&str], sources: &[&str]) -> RuleDecl {
    RuleDecl {
        targets: targets.iter().map(|s| s.to_string()).collect(),
        sources: sources.iter().map(|s| s.to_string()).collect(),
        recipe: RecipeRef::new(module, recipe, 2),
        line: 1,
    }
}

fn task_decl(module: &str, name: &str, sources: &[&str]) -> TaskDecl {
    TaskDecl {
        name: name.to_string(),
        sources: sources.iter().map(|s| s.to_string()).collect(),
        recipe: RecipeRef::new(module, name, 3),
        line: 1,
    }
}

fn write_recipe(registry: &exmake::RecipeRegistry, module: &str, name: &str) {
    registry.register(module, name, |call: RecipeCall| {
        if let RecipeCall::Rule { targets, .. } = &call {
            for target in targets {
                std::fs::write(target, "built")
                    .map_err(|e| RecipeFault::Fail(Error::Script(e.to_string())))?;
            }
        }
        Ok(())
    });
}

#[tokio::test]
async fn dependencies_complete_before_dependents_start() {
    let _guard = BUILD_LOCK.lock().await;
    let tmp = TempDir::new().unwrap();
    let src_path = tmp.path().join("lib.c");
    std::fs::write(&src_path, "source").unwrap();

    let src = src_path.display().to_string();
    let obj = tmp.path().join("lib.o").display().to_string();
    let bin = tmp.path().join("app").display().to_string();

    let module = "Order.Exmakefile";
    let mut host = StaticEvaluator::new();
    host.add_script(
        ".",
        "Exmakefile",
        vec![(
            module.to_string(),
            ModuleMetadata {
                rules: vec![
                    rule_decl(module, "link", &[bin.as_str()], &[obj.as_str()]),
                    rule_decl(module, "compile", &[obj.as_str()], &[src.as_str()]),
                ],
                ..ModuleMetadata::default()
            },
        )],
    );

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let mut session =
        BuildSession::new(Box::new(host)).with_cache_dir(tmp.path().join(".exmake"));
    for name in ["compile", "link"] {
        let log = Arc::clone(&log);
        session
            .registry
            .register(module, name, move |call: RecipeCall| {
                log.lock().unwrap().push(name);
                if let RecipeCall::Rule { targets, .. } = &call {
                    std::fs::write(&targets[0], "built")
                        .map_err(|e| RecipeFault::Fail(Error::Script(e.to_string())))?;
                }
                Ok(())
            });
    }

    let code = worker::run(&mut session, Config::with_targets([bin.as_str()])).await;
    assert_eq!(code, 0);
    assert_eq!(*log.lock().unwrap(), vec!["compile", "link"]);

    // After a successful build no target is older than any source.
    let obj_time = std::fs::metadata(&obj).unwrap().modified().unwrap();
    let src_time = std::fs::metadata(&src_path).unwrap().modified().unwrap();
    assert!(obj_time >= src_time);
}

#[tokio::test]
async fn concurrent_runners_never_exceed_jobs() {
    let _guard = BUILD_LOCK.lock().await;
    let tmp = TempDir::new().unwrap();

    let module = "Jobs.Exmakefile";
    let mut rules = Vec::new();
    let mut targets = Vec::new();
    for i in 0..5 {
        let target = tmp.path().join(format!("part{i}")).display().to_string();
        rules.push(rule_decl(module, "emit", &[target.as_str()], &[]));
        targets.push(target);
    }
    let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();
    let mut module_meta = ModuleMetadata {
        rules,
        ..ModuleMetadata::default()
    };
    module_meta.tasks = vec![task_decl(module, "all", &target_refs)];

    let mut host = StaticEvaluator::new();
    host.add_script(".", "Exmakefile", vec![(module.to_string(), module_meta)]);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut session =
        BuildSession::new(Box::new(host)).with_cache_dir(tmp.path().join(".exmake"));
    {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        session
            .registry
            .register(module, "emit", move |call: RecipeCall| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(25));
                if let RecipeCall::Rule { targets, .. } = &call {
                    let _ = std::fs::write(&targets[0], "built");
                }
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
    }
    session
        .registry
        .register(module, "all", |_call: RecipeCall| Ok(()));

    let mut config = Config::with_targets(["all"]);
    config.options.jobs = 2;
    let code = worker::run(&mut session, config).await;
    assert_eq!(code, 0);

    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {peak:?} exceeds bound");
    for target in &targets {
        assert!(PathBuf::from(target).exists());
    }
}

#[tokio::test]
async fn question_mode_never_invokes_recipes() {
    let _guard = BUILD_LOCK.lock().await;
    let tmp = TempDir::new().unwrap();
    let src_path = tmp.path().join("foo.c");
    std::fs::write(&src_path, "source").unwrap();

    let src = src_path.display().to_string();
    let obj = tmp.path().join("foo.o").display().to_string();
    let module = "Question.Exmakefile";

    let mut host = StaticEvaluator::new();
    host.add_script(
        ".",
        "Exmakefile",
        vec![(
            module.to_string(),
            ModuleMetadata {
                rules: vec![rule_decl(module, "compile", &[obj.as_str()], &[src.as_str()])],
                ..ModuleMetadata::default()
            },
        )],
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let mut session =
        BuildSession::new(Box::new(host)).with_cache_dir(tmp.path().join(".exmake"));
    {
        let calls = Arc::clone(&calls);
        session
            .registry
            .register(module, "compile", move |call: RecipeCall| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let RecipeCall::Rule { targets, .. } = &call {
                    let _ = std::fs::write(&targets[0], "built");
                }
                Ok(())
            });
    }

    // Stale: question mode reports it without building anything.
    let mut config = Config::with_targets([obj.as_str()]);
    config.options.question = true;
    let result = worker::try_run(&mut session, config.clone()).await;
    assert!(matches!(result, Err(Error::Stale)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(worker::run(&mut session, config.clone()).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Build for real, then question mode is satisfied.
    let code = worker::run(&mut session, Config::with_targets([obj.as_str()])).await;
    assert_eq!(code, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(worker::run(&mut session, config).await, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_rebuilds_cache_without_rerunning_fresh_rules() {
    let _guard = BUILD_LOCK.lock().await;
    let tmp = TempDir::new().unwrap();
    let src_path = tmp.path().join("foo.c");
    std::fs::write(&src_path, "source").unwrap();

    let src = src_path.display().to_string();
    let obj = tmp.path().join("foo.o").display().to_string();
    let module = "Clear.Exmakefile";

    let mut host = StaticEvaluator::new();
    host.add_script(
        ".",
        "Exmakefile",
        vec![(
            module.to_string(),
            ModuleMetadata {
                rules: vec![rule_decl(module, "compile", &[obj.as_str()], &[src.as_str()])],
                ..ModuleMetadata::default()
            },
        )],
    );

    let mut session =
        BuildSession::new(Box::new(host)).with_cache_dir(tmp.path().join(".exmake"));
    write_recipe(&session.registry, module, "compile");

    assert_eq!(
        worker::run(&mut session, Config::with_targets([obj.as_str()])).await,
        0
    );

    // --clear wipes the cache; the scripts reload, but the up-to-date rule
    // is still skipped.
    let store = CacheStore::new(tmp.path().join(".exmake"));
    assert!(!store.is_stale().unwrap());

    let mut config = Config::with_targets([obj.as_str()]);
    config.options.clear = true;
    assert_eq!(worker::run(&mut session, config).await, 0);
    assert!(!store.is_stale().unwrap());
    assert!(PathBuf::from(&obj).exists());
}

#[tokio::test]
async fn precious_variables_land_in_config_snapshot() {
    let _guard = BUILD_LOCK.lock().await;
    let tmp = TempDir::new().unwrap();

    let module = "Precious.Exmakefile";
    let mut host = StaticEvaluator::new();
    host.add_script(
        ".",
        "Exmakefile",
        vec![(
            module.to_string(),
            ModuleMetadata {
                tasks: vec![task_decl(module, "all", &[])],
                libraries: vec![LibraryUse {
                    name: "toolchain".to_string(),
                    args: vec![],
                    qualified: false,
                    line: 1,
                }],
                ..ModuleMetadata::default()
            },
        )],
    );
    let mut library = LibraryMetadata::named("toolchain");
    library.precious = vec!["EXMAKE_TEST_CC".to_string()];
    host.add_library(library);

    let mut session =
        BuildSession::new(Box::new(host)).with_cache_dir(tmp.path().join(".exmake"));
    session.registry.register(module, "all", |_call: RecipeCall| Ok(()));

    // No other test reads this variable; runners are not up yet.
    unsafe { std::env::set_var("EXMAKE_TEST_CC", "cc-42") };
    let code = worker::run(&mut session, Config::with_targets(["all"])).await;
    unsafe { std::env::remove_var("EXMAKE_TEST_CC") };
    assert_eq!(code, 0);

    let store = CacheStore::new(tmp.path().join(".exmake"));
    let (_args, precious) = store.load_config().unwrap();
    assert_eq!(
        precious.get("EXMAKE_TEST_CC").map(String::as_str),
        Some("cc-42")
    );
}

#[tokio::test]
async fn failing_recipe_fails_build_and_cleans_output() {
    let _guard = BUILD_LOCK.lock().await;
    let tmp = TempDir::new().unwrap();
    let src_path = tmp.path().join("foo.c");
    std::fs::write(&src_path, "source").unwrap();

    let src = src_path.display().to_string();
    let obj = tmp.path().join("foo.o").display().to_string();
    let module = "Fail.Exmakefile";

    let mut host = StaticEvaluator::new();
    host.add_script(
        ".",
        "Exmakefile",
        vec![(
            module.to_string(),
            ModuleMetadata {
                rules: vec![rule_decl(module, "compile", &[obj.as_str()], &[src.as_str()])],
                ..ModuleMetadata::default()
            },
        )],
    );

    let mut session =
        BuildSession::new(Box::new(host)).with_cache_dir(tmp.path().join(".exmake"));
    session
        .registry
        .register(module, "compile", |call: RecipeCall| {
            if let RecipeCall::Rule { targets, .. } = &call {
                let _ = std::fs::write(&targets[0], "partial");
            }
            Err(RecipeFault::Throw("compiler exploded".to_string()))
        });

    let err = worker::try_run(&mut session, Config::with_targets([obj.as_str()]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Throw(v) if v == "compiler exploded"));
    assert!(!PathBuf::from(&obj).exists());
}

#[tokio::test]
async fn timing_report_does_not_disturb_the_build() {
    let _guard = BUILD_LOCK.lock().await;
    let tmp = TempDir::new().unwrap();

    let module = "Timed.Exmakefile";
    let mut host = StaticEvaluator::new();
    host.add_script(
        ".",
        "Exmakefile",
        vec![(
            module.to_string(),
            ModuleMetadata {
                tasks: vec![task_decl(module, "all", &[])],
                ..ModuleMetadata::default()
            },
        )],
    );

    let mut session =
        BuildSession::new(Box::new(host)).with_cache_dir(tmp.path().join(".exmake"));
    session.registry.register(module, "all", |_call: RecipeCall| Ok(()));

    let mut config = Config::with_targets(["all"]);
    config.options.time = true;
    assert_eq!(worker::run(&mut session, config).await, 0);
}
