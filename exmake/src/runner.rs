//! Recipe execution: one runner task per job.
//!
//! A runner checks source existence, decides staleness, invokes the recipe
//! under the recipe contract (working directory unchanged, declared outputs
//! produced), removes partial outputs on failure, and reports the outcome
//! back through the coordinator.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::mtime;
use crate::coordinator::{JobResult, OwnerTx, Request};
use crate::error::Error;
use crate::script::{RecipeCall, RecipeFault, RecipeRegistry, WorkUnit};

/// Is this unit stale? Tasks and fallbacks always are. A rule is stale when
/// any target is missing, or when its newest source is newer than its oldest
/// target; missing files read as the epoch.
pub fn is_stale(unit: &WorkUnit) -> bool {
    let rule = match unit {
        WorkUnit::Rule(rule) => rule,
        WorkUnit::Task(_) | WorkUnit::Fallback(_) => return true,
    };

    if rule.targets.iter().any(|t| !t.exists()) {
        return true;
    }

    let newest_source = rule.sources.iter().map(|p| mtime(p)).max();
    let oldest_target = rule.targets.iter().map(|p| mtime(p)).min();
    match (newest_source, oldest_target) {
        (Some(src), Some(tgt)) => src > tgt,
        _ => false,
    }
}

pub(crate) fn spawn(
    coordinator_tx: mpsc::UnboundedSender<Request>,
    registry: Arc<RecipeRegistry>,
    job_id: u64,
    unit: WorkUnit,
    data: u64,
    owner: OwnerTx,
) {
    tokio::spawn(async move {
        let result = execute(&registry, &unit).await;
        let _ = coordinator_tx.send(Request::Done {
            job_id,
            unit,
            data,
            owner,
            result,
        });
    });
}

/// Execute one unit and report how it went. Never panics outward; recipe
/// panics are mapped to thrown values.
pub async fn execute(registry: &Arc<RecipeRegistry>, unit: &WorkUnit) -> JobResult {
    let result = run_unit(registry, unit).await;
    match result {
        Ok(()) => JobResult::Ok,
        Err(failure) => {
            // Declared outputs may be half-written; drop them so the next
            // run rebuilds rather than trusting a torn file.
            for target in unit.targets() {
                let _ = std::fs::remove_file(target);
            }
            match failure {
                RecipeFault::Throw(value) => JobResult::Throw(value),
                RecipeFault::Fail(error) => JobResult::Raise(error),
            }
        }
    }
}

async fn run_unit(
    registry: &Arc<RecipeRegistry>,
    unit: &WorkUnit,
) -> Result<(), RecipeFault> {
    for source in unit.required_sources() {
        if !source.exists() {
            return Err(RecipeFault::Fail(Error::Usage(format!(
                "No rule to make target '{}'",
                source.display()
            ))));
        }
    }

    if !is_stale(unit) {
        debug!(rule = %unit.display_name(), "up to date");
        return Ok(());
    }

    info!(rule = %unit.display_name(), "building");
    invoke(registry, unit).await
}

fn fail(error: Error) -> RecipeFault {
    RecipeFault::Fail(error)
}

async fn invoke(registry: &Arc<RecipeRegistry>, unit: &WorkUnit) -> Result<(), RecipeFault> {
    let (recipe_ref, call) = match unit {
        WorkUnit::Rule(rule) => (
            &rule.recipe,
            RecipeCall::Rule {
                sources: rule.sources.clone(),
                targets: rule.targets.clone(),
                directory: (rule.recipe.arity == 3).then(|| rule.directory.clone()),
            },
        ),
        WorkUnit::Task(task) => (
            &task.recipe,
            RecipeCall::Task {
                name: task.name.clone(),
                sources: task.sources.clone(),
                directory: task.directory.clone(),
            },
        ),
        WorkUnit::Fallback(fallback) => (
            &fallback.recipe,
            RecipeCall::Fallback {
                directory: fallback.directory.clone(),
            },
        ),
    };

    let recipe = registry.lookup(recipe_ref).ok_or_else(|| {
        fail(Error::Script(format!(
            "No recipe registered as {}.{}",
            recipe_ref.module, recipe_ref.name
        )))
    })?;

    let before = std::env::current_dir()
        .map_err(|e| fail(Error::Script(format!("cannot read working directory: {e}"))))?;

    let joined = tokio::task::spawn_blocking(move || recipe(call)).await;
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(recipe_fault)) => return Err(recipe_fault),
        Err(join_error) => {
            return Err(RecipeFault::Throw(panic_payload(join_error)));
        }
    }

    let after = std::env::current_dir()
        .map_err(|e| fail(Error::Script(format!("cannot read working directory: {e}"))))?;
    if after != before {
        return Err(fail(Error::Script(format!(
            "Recipe for rule {} changed directory from '{}' to '{}'",
            unit.display_name(),
            before.display(),
            after.display()
        ))));
    }

    for target in unit.targets() {
        if !target.exists() {
            return Err(fail(Error::Script(format!(
                "Recipe for rule {} did not produce {} as expected",
                unit.display_name(),
                target.display()
            ))));
        }
    }

    Ok(())
}

pub(crate) fn panic_payload(join_error: tokio::task::JoinError) -> String {
    if join_error.is_panic() {
        let payload = join_error.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "recipe panicked".to_string()
        }
    } else {
        "recipe was cancelled".to_string()
    }
}
