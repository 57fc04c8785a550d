//! Top-level build driver.
//!
//! One `run` per invocation: decide the cache state, load or restore the
//! scripts and the graph, resolve the requested targets, and drain each
//! pruned sub-graph leaf by leaf through the coordinator. Returns the
//! process exit code.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use exmake_graph::{Graph, NodeId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::coordinator::{CoordinatorHandle, Done, JobResult};
use crate::env;
use crate::error::{Error, Result};
use crate::evaluator::ScriptEvaluator;
use crate::graph::{build_graph, find_target};
use crate::loader;
use crate::paths;
use crate::runner;
use crate::script::{Fallback, RecipeRegistry, WorkUnit};
use crate::shell;
use crate::timing::Session;

/// Everything one build owns: the evaluator, the recipe registry, the
/// coordinator, and the cache location.
pub struct BuildSession {
    /// Script evaluator supplied by the embedding application.
    pub evaluator: Box<dyn ScriptEvaluator>,

    /// Recipe callables, shared with the coordinator for dispatch.
    pub registry: Arc<RecipeRegistry>,

    /// Handle on the coordinator actor.
    pub coordinator: CoordinatorHandle,

    /// Cache directory for this build.
    pub cache_dir: PathBuf,
}

impl BuildSession {
    /// Create a session around an evaluator. Register recipes through
    /// [`BuildSession::registry`] before running.
    pub fn new(evaluator: Box<dyn ScriptEvaluator>) -> Self {
        let registry = Arc::new(RecipeRegistry::new());
        let coordinator = CoordinatorHandle::spawn(Arc::clone(&registry));
        Self {
            evaluator,
            registry,
            coordinator,
            cache_dir: PathBuf::from(crate::cache::DEFAULT_DIR),
        }
    }

    /// Use a non-default cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }
}

/// Run a build and report the exit code, printing errors and the timing
/// table. `0` on success, `1` on any failure.
pub async fn run(session: &mut BuildSession, config: Config) -> i32 {
    let result = try_run(session, config).await;

    if let Ok(Some(mut timing)) = session.coordinator.take_timer().await {
        timing.pass_end();
        print!("{}", timing.render());
    }

    match result {
        Ok(()) => 0,
        Err(error) => {
            if !error.is_quiet() {
                println!("{error}");
                debug!(?error, "build failed");
            }
            1
        }
    }
}

/// Run a build, surfacing the failure instead of printing it. In-flight
/// jobs are always drained before this returns.
pub async fn try_run(session: &mut BuildSession, config: Config) -> Result<()> {
    session.coordinator.clear_libs().await?;
    session.coordinator.set_config(config.clone()).await?;
    shell::set_loud(config.options.loud);

    if config.options.time {
        session
            .coordinator
            .apply_timer(|_| Some(Session::new()))
            .await?;
    }

    let (owner_tx, owner_rx) = mpsc::unbounded_channel();
    let mut driver = Driver {
        session,
        config,
        owner_tx,
        owner_rx,
        in_flight: 0,
    };

    let result = driver.build().await;
    if result.is_err() {
        driver.drain().await;
    }
    result
}

struct Driver<'a> {
    session: &'a mut BuildSession,
    config: Config,
    owner_tx: mpsc::UnboundedSender<Done>,
    owner_rx: mpsc::UnboundedReceiver<Done>,
    in_flight: usize,
}

impl Driver<'_> {
    async fn pass_go(&self, name: impl Into<String>) -> Result<()> {
        if !self.config.options.time {
            return Ok(());
        }
        let name = name.into();
        self.session
            .coordinator
            .apply_timer(move |timing| {
                timing.map(|mut session| {
                    session.pass_go(name);
                    session
                })
            })
            .await
    }

    async fn build(&mut self) -> Result<()> {
        // Run from the directory the entry script lives in.
        let file = self.config.options.file.clone();
        let script_path = Path::new(&file);
        let file_name = script_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Usage(format!("Invalid script path '{file}'")))?;
        if let Some(parent) = script_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::env::set_current_dir(parent).map_err(|e| {
                Error::Usage(format!(
                    "Cannot change to directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }

        self.session
            .evaluator
            .append_search_paths(&library_search_paths());

        let store = CacheStore::new(&self.session.cache_dir);
        let stale = if self.config.options.clear {
            store.clear()?;
            true
        } else {
            store.is_stale()?
        };

        let (graph, fallbacks) = if stale {
            self.load_fresh_scripts(&store, &file_name).await?
        } else {
            self.restore_from_cache(&store).await?
        };

        // Resolve every requested target before doing any work.
        let mut resolved = Vec::with_capacity(self.config.targets.len());
        for target in &self.config.targets.clone() {
            match find_target(&graph, target) {
                Some(vertex) => resolved.push((target.clone(), vertex)),
                None => {
                    self.run_fallbacks(&fallbacks).await?;
                    return Err(Error::Usage(format!("Target '{target}' not found")));
                }
            }
        }

        for (target, vertex) in resolved {
            self.pass_go(format!("Target {target}")).await?;
            let sub = graph.pruned(vertex)?;
            if self.config.options.question {
                question_walk(sub)?;
            } else {
                self.process_subgraph(sub).await?;
            }
        }

        Ok(())
    }

    /// Stale path: evaluate the scripts and persist everything.
    async fn load_fresh_scripts(
        &mut self,
        store: &CacheStore,
        file_name: &str,
    ) -> Result<(Graph<WorkUnit>, Vec<Fallback>)> {
        // A staleness-triggered rerun still sees the environment the user
        // originally configured with; explicit values win.
        let mut tail = self.config.args.clone();
        if store.has_config() {
            let (saved_args, precious) = store.load_config()?;
            for (key, value) in &precious {
                if std::env::var_os(key).is_none() {
                    // Runners are not spawned yet; nothing else reads the OS
                    // environment concurrently.
                    unsafe { std::env::set_var(key, value) };
                }
            }
            if tail.is_empty() {
                tail = saved_args;
            }
        }

        self.pass_go("Load scripts").await?;
        let outcome = loader::load_scripts(
            self.session.evaluator.as_mut(),
            &self.session.coordinator,
            &self.session.registry,
            Path::new("."),
            file_name,
            &tail,
        )
        .await?;

        store.save_mods(&outcome.artifacts)?;
        env::with_mut(|table| store.save_env(table))?;

        self.pass_go("Build graph").await?;
        let graph = build_graph(&outcome.records)?;

        self.pass_go("Persist cache").await?;
        store.save_graph(&graph)?;

        // Fallbacks come from the entry script.
        let fallbacks: Vec<Fallback> = outcome
            .records
            .first()
            .map(|entry| {
                entry
                    .fallbacks
                    .iter()
                    .map(|decl| Fallback {
                        recipe: decl.recipe.clone(),
                        directory: entry.directory.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        store.save_fallbacks(&fallbacks)?;

        let mut manifest: Vec<PathBuf> = Vec::new();
        for record in &outcome.records {
            manifest.push(record.path());
            for entry in &record.manifest {
                manifest.push(paths::anchor(&record.directory, entry));
            }
        }
        store.append_manifest(&manifest)?;

        let mut precious = BTreeMap::new();
        for name in &outcome.precious {
            if let Ok(value) = std::env::var(name) {
                precious.insert(name.clone(), value);
            }
        }
        store.save_config(&tail, &precious)?;

        Ok((graph, fallbacks))
    }

    /// Fresh path: everything comes back from the cache.
    async fn restore_from_cache(
        &mut self,
        store: &CacheStore,
    ) -> Result<(Graph<WorkUnit>, Vec<Fallback>)> {
        self.pass_go("Load cache").await?;
        for (module, artifact) in store.load_mods()? {
            self.session.evaluator.restore(&module, &artifact)?;
        }
        env::replace(store.load_env()?);
        let graph = store.load_graph()?;
        let fallbacks = store.load_fallbacks()?;
        debug!(
            vertices = graph.node_count(),
            fallbacks = fallbacks.len(),
            "cache restored"
        );
        Ok((graph, fallbacks))
    }

    /// Run every stored fallback serially, one enqueue-and-wait at a time.
    async fn run_fallbacks(&mut self, fallbacks: &[Fallback]) -> Result<()> {
        for (index, fallback) in fallbacks.iter().enumerate() {
            self.session
                .coordinator
                .enqueue(
                    WorkUnit::Fallback(fallback.clone()),
                    index as u64,
                    self.owner_tx.clone(),
                )
                .await?;
            self.in_flight += 1;

            let done = self.recv_done().await?;
            match done.result {
                JobResult::Ok => {}
                JobResult::Throw(value) => return Err(Error::Throw(value)),
                JobResult::Raise(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Drain one pruned sub-graph: enqueue pending leaves, await exactly one
    /// completion per turn, delete finished vertices, repeat until empty.
    async fn process_subgraph(&mut self, mut sub: Graph<WorkUnit>) -> Result<()> {
        let mut processing: HashSet<NodeId> = HashSet::new();

        while !sub.is_empty() {
            let pending: Vec<NodeId> = sub
                .leaves()
                .into_iter()
                .filter(|id| !processing.contains(id))
                .collect();

            for id in pending {
                let unit = sub.node(id)?.clone();
                self.session
                    .coordinator
                    .enqueue(unit, id.0 as u64, self.owner_tx.clone())
                    .await?;
                processing.insert(id);
                self.in_flight += 1;
            }

            let done = self.recv_done().await?;
            let id = NodeId(done.data as usize);
            match done.result {
                JobResult::Ok => {
                    processing.remove(&id);
                    sub.remove_node(id)?;
                }
                JobResult::Throw(value) => return Err(Error::Throw(value)),
                JobResult::Raise(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn recv_done(&mut self) -> Result<Done> {
        let done = self
            .owner_rx
            .recv()
            .await
            .ok_or_else(|| Error::Script("coordinator is not running".to_string()))?;
        self.in_flight -= 1;
        Ok(done)
    }

    /// Wait out every job still in flight; their results are discarded.
    async fn drain(&mut self) {
        while self.in_flight > 0 {
            match self.owner_rx.recv().await {
                Some(_) => self.in_flight -= 1,
                None => break,
            }
        }
    }
}

/// Walk a sub-graph under `--question`: no recipe ever runs, the first stale
/// unit fails the build.
fn question_walk(mut sub: Graph<WorkUnit>) -> Result<()> {
    while !sub.is_empty() {
        for id in sub.leaves() {
            if runner::is_stale(sub.node(id)?) {
                return Err(Error::Stale);
            }
            sub.remove_node(id)?;
        }
    }
    Ok(())
}

/// Library search paths: `EXMAKE_PATH` replaces the default list entirely.
fn library_search_paths() -> Vec<PathBuf> {
    if let Ok(value) = std::env::var("EXMAKE_PATH") {
        return value
            .split(':')
            .filter(|part| !part.is_empty())
            .map(PathBuf::from)
            .collect();
    }

    let mut defaults = vec![PathBuf::from("./exmake")];
    if let Ok(home) = std::env::var("HOME") {
        defaults.push(Path::new(&home).join(".exmake"));
    }
    defaults.push(PathBuf::from("/usr/local/lib/exmake"));
    defaults.push(PathBuf::from("/usr/lib/exmake"));
    defaults.push(PathBuf::from("/lib/exmake"));
    defaults
}
