//! Stage graph validation and ordering.

use crate::adapters::AdapterRegistry;
use crate::core::{StageRecord, WorkflowRequest};
use crate::errors::{CycleDetectedError, ValidationError};
use std::collections::{HashMap, HashSet};

/// Validates a request against the adapter registry.
///
/// Checks, in order: non-empty graph, non-empty and unique stage names,
/// registered stage types, no self or dangling dependencies, no cycles.
pub fn validate_request(
    request: &WorkflowRequest,
    registry: &AdapterRegistry,
) -> Result<(), ValidationError> {
    if request.stages.is_empty() {
        return Err(ValidationError::empty());
    }

    let mut names = HashSet::new();
    for stage in &request.stages {
        if stage.name.trim().is_empty() {
            return Err(ValidationError::new(
                "WORKFLOW-EMPTY_NAME",
                "Stage name cannot be empty or whitespace-only",
            ));
        }
        if !names.insert(stage.name.as_str()) {
            return Err(ValidationError::new(
                "WORKFLOW-DUPLICATE_STAGE",
                format!("Stage '{}' is declared more than once", stage.name),
            )
            .with_stages(vec![stage.name.clone()])
            .with_fix_hint("Give every stage a unique name."));
        }
        if !registry.contains(stage.stage_type) {
            return Err(ValidationError::new(
                "WORKFLOW-UNKNOWN_TYPE",
                format!(
                    "Stage '{}' uses stage type '{}' which has no registered adapter",
                    stage.name, stage.stage_type
                ),
            )
            .with_stages(vec![stage.name.clone()])
            .with_fix_hint("Register an adapter for this stage type or remove the stage."));
        }
    }

    for stage in &request.stages {
        for dep in &stage.depends_on {
            if dep == &stage.name {
                return Err(ValidationError::new(
                    "WORKFLOW-SELF_DEP",
                    format!("Stage '{}' cannot depend on itself", stage.name),
                )
                .with_stages(vec![stage.name.clone()]));
            }
            if !names.contains(dep.as_str()) {
                return Err(ValidationError::new(
                    "WORKFLOW-MISSING_DEP",
                    format!("Stage '{}' depends on unknown stage '{}'", stage.name, dep),
                )
                .with_stages(vec![stage.name.clone(), dep.clone()])
                .with_fix_hint("Check for typos in stage names."));
            }
        }
    }

    let deps: Vec<(&str, Vec<&str>)> = request
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();
    if let Some(cycle) = find_cycle(&deps) {
        return Err(CycleDetectedError::new(cycle).into());
    }

    Ok(())
}

/// Finds a dependency cycle, visiting stages in declaration order.
fn find_cycle(stages: &[(&str, Vec<&str>)]) -> Option<Vec<String>> {
    let edges: HashMap<&str, &[&str]> = stages
        .iter()
        .map(|(name, deps)| (*name, deps.as_slice()))
        .collect();
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    fn dfs<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, &[&'a str]>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        for &dep in edges.get(node).copied().unwrap_or_default() {
            if on_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = dfs(dep, edges, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
        None
    }

    for (name, _) in stages {
        if !visited.contains(name) {
            if let Some(cycle) = dfs(name, &edges, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Orders stages so every stage comes after its dependencies.
///
/// Ties keep declaration order. Assumes a validated, acyclic graph; stages
/// caught in a cycle are left out.
#[must_use]
pub fn topological_order(stages: &[StageRecord]) -> Vec<&StageRecord> {
    let mut remaining: HashMap<&str, usize> = stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();
    let mut order: Vec<&StageRecord> = Vec::with_capacity(stages.len());
    let mut placed: HashSet<&str> = HashSet::new();

    loop {
        let next: Vec<&StageRecord> = stages
            .iter()
            .filter(|s| !placed.contains(s.name.as_str()) && remaining[s.name.as_str()] == 0)
            .collect();
        if next.is_empty() {
            break;
        }
        for stage in next {
            placed.insert(stage.name.as_str());
            order.push(stage);
            for child in stages.iter().filter(|c| c.depends_on.contains(&stage.name)) {
                if let Some(count) = remaining.get_mut(child.name.as_str()) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    order
}
