//! Dependency graph construction from loaded script records.
//!
//! Six passes, in order: declaration validation, path anchoring, uniqueness
//! checks, task `real_sources` computation, vertex and edge insertion (with
//! rule-on-task rejection and cycle reporting), and the finished graph.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use exmake_graph::{Graph, GraphError, NodeId};
use tracing::debug;

use crate::error::{Error, Result};
use crate::paths;
use crate::script::{Rule, ScriptRecord, Task, WorkUnit};

fn valid_name(s: &str) -> bool {
    !s.is_empty()
}

/// Pass 1: every declared name must be a non-empty string and every recipe
/// must carry the arity its kind allows.
fn validate(records: &[ScriptRecord]) -> Result<()> {
    for record in records {
        let script = record.path();
        for rule in &record.rules {
            if rule.targets.is_empty() || !rule.targets.iter().all(|t| valid_name(t)) {
                return Err(Error::Script(format!(
                    "Invalid rule in '{}' (line {}): targets must be a non-empty sequence of valid strings",
                    script.display(),
                    rule.line
                )));
            }
            if !rule.sources.iter().all(|s| valid_name(s)) {
                return Err(Error::Script(format!(
                    "Invalid rule in '{}' (line {}): sources must be valid strings",
                    script.display(),
                    rule.line
                )));
            }
            if !matches!(rule.recipe.arity, 2 | 3) {
                return Err(Error::Script(format!(
                    "Invalid rule in '{}' (line {}): recipe must accept 2 or 3 arguments",
                    script.display(),
                    rule.line
                )));
            }
        }
        for task in &record.tasks {
            if !valid_name(&task.name) {
                return Err(Error::Script(format!(
                    "Invalid task in '{}' (line {}): name must be a valid string",
                    script.display(),
                    task.line
                )));
            }
            if !task.sources.iter().all(|s| valid_name(s)) {
                return Err(Error::Script(format!(
                    "Invalid task in '{}' (line {}): sources must be valid strings",
                    script.display(),
                    task.line
                )));
            }
            if task.recipe.arity != 3 {
                return Err(Error::Script(format!(
                    "Invalid task in '{}' (line {}): recipe must accept 3 arguments",
                    script.display(),
                    task.line
                )));
            }
        }
        for fallback in &record.fallbacks {
            if fallback.recipe.arity != 1 {
                return Err(Error::Script(format!(
                    "Invalid fallback in '{}' (line {}): recipe must accept 1 argument",
                    script.display(),
                    fallback.line
                )));
            }
        }
    }
    Ok(())
}

/// Build the acyclic dependency graph from all loaded scripts.
pub fn build_graph(records: &[ScriptRecord]) -> Result<Graph<WorkUnit>> {
    validate(records)?;

    // Pass 2: anchor every path to its script's directory.
    let mut rules: Vec<Rule> = Vec::new();
    let mut tasks: Vec<Task> = Vec::new();
    for record in records {
        for decl in &record.rules {
            rules.push(Rule {
                targets: decl
                    .targets
                    .iter()
                    .map(|t| paths::anchor(&record.directory, t))
                    .collect(),
                sources: decl
                    .sources
                    .iter()
                    .map(|s| paths::anchor(&record.directory, s))
                    .collect(),
                recipe: decl.recipe.clone(),
                directory: record.directory.clone(),
            });
        }
        for decl in &record.tasks {
            tasks.push(Task {
                name: paths::anchor(&record.directory, &decl.name),
                sources: decl
                    .sources
                    .iter()
                    .map(|s| paths::anchor(&record.directory, s))
                    .collect(),
                real_sources: Vec::new(),
                recipe: decl.recipe.clone(),
                directory: record.directory.clone(),
            });
        }
    }

    // Pass 3: global uniqueness of targets and task names.
    let mut target_names: HashSet<PathBuf> = HashSet::new();
    for rule in &rules {
        for target in &rule.targets {
            if !target_names.insert(target.clone()) {
                return Err(Error::Script(format!(
                    "Multiple rules mention target '{}'",
                    target.display()
                )));
            }
        }
    }
    let mut task_names: HashSet<PathBuf> = HashSet::new();
    for task in &tasks {
        if target_names.contains(&task.name) || !task_names.insert(task.name.clone()) {
            return Err(Error::Script(format!(
                "Task name '{}' conflicts with a rule",
                task.name.display()
            )));
        }
    }

    // Pass 4: a task's real sources are the ones that do not name a task.
    for task in &mut tasks {
        task.real_sources = task
            .sources
            .iter()
            .filter(|s| !task_names.contains(*s))
            .cloned()
            .collect();
    }

    // Pass 5: vertices, producer index, edges.
    let mut graph: Graph<WorkUnit> = Graph::new();
    let mut producers: HashMap<PathBuf, NodeId> = HashMap::new();

    for rule in rules {
        let targets = rule.targets.clone();
        let id = graph.add_node(WorkUnit::Rule(rule));
        for target in targets {
            producers.insert(target, id);
        }
    }
    for task in tasks {
        let name = task.name.clone();
        let id = graph.add_node(WorkUnit::Task(task));
        producers.insert(name, id);
    }

    for u in graph.node_ids() {
        let unit = graph.node(u)?.clone();
        let sources = match &unit {
            WorkUnit::Rule(rule) => rule.sources.clone(),
            WorkUnit::Task(task) => task.sources.clone(),
            WorkUnit::Fallback(_) => Vec::new(),
        };

        for source in sources {
            // A source with no producer is a plain file; its existence is
            // checked at run time, not here.
            let Some(&v) = producers.get(&source) else {
                continue;
            };

            if matches!(unit, WorkUnit::Rule(_))
                && matches!(graph.node(v)?, WorkUnit::Task(_))
            {
                return Err(Error::Script(format!(
                    "Rule '{}' depends on task '{}'",
                    unit.display_name(),
                    source.display()
                )));
            }

            match graph.add_edge(u, v) {
                Ok(()) => {}
                Err(GraphError::WouldCycle { .. }) => {
                    let v_name = graph.node(v)?.display_name();
                    return Err(Error::Script(format!(
                        "Cyclic dependency detected between '{}' and '{}'",
                        unit.display_name(),
                        v_name
                    )));
                }
                Err(e) => return Err(Error::Script(format!("graph construction failed: {e}"))),
            }
        }
    }

    debug!(
        vertices = graph.node_count(),
        edges = graph.edge_count(),
        "dependency graph built"
    );
    Ok(graph)
}

impl From<GraphError> for Error {
    fn from(e: GraphError) -> Self {
        Error::Script(format!("graph operation failed: {e}"))
    }
}

/// Find the vertex producing `target` (a rule target or task name), if any.
pub fn find_target(graph: &Graph<WorkUnit>, target: &str) -> Option<NodeId> {
    let wanted = paths::clean(std::path::Path::new(target));
    graph.node_ids().into_iter().find(|&id| {
        match graph.node(id) {
            Ok(WorkUnit::Rule(rule)) => rule.targets.iter().any(|t| *t == wanted),
            Ok(WorkUnit::Task(task)) => task.name == wanted,
            _ => false,
        }
    })
}
