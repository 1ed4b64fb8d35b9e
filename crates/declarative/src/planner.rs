//! Execution planner - compares declarations with recorded state
//!
//! A [`Plan`] owns the resource graph, one [`ResourceChange`] per declared
//! resource (index-aligned with the graph's nodes), and the records that
//! are no longer declared. Building a plan never calls a mutating provider
//! operation; structural errors (cycles, duplicates, dangling references)
//! surface here, before the executor can cause side effects.

use crate::context::EngineContext;
use crate::diff::{DiffSummary, ResourceChange, decide_action};
use crate::error::Result;
use crate::graph::{DependencyGraph, ResourceGraph};
use crate::scheduler::{Direction, Scheduler};
use crate::state::StateRecord;
use crate::types::{Action, Lookup, ResourceDecl, lookup_path, type_package};
use std::collections::BTreeMap;

/// What an apply run will do
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub(crate) graph: ResourceGraph,
    pub(crate) changes: Vec<ResourceChange>,
    pub(crate) selected: Vec<bool>,
    pub(crate) deletions: Vec<StateRecord>,
    pub(crate) deletion_changes: Vec<ResourceChange>,
    pub(crate) deletion_graph: DependencyGraph,
    pub(crate) selected_deletions: Vec<bool>,
}

impl Plan {
    /// Plan the reconciliation of `decls` against the store
    pub fn build(ctx: EngineContext<'_>, decls: &[ResourceDecl]) -> Result<Self> {
        let graph = ResourceGraph::build(decls)?;
        let mut records: BTreeMap<String, StateRecord> = ctx
            .store
            .list()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut actions: Vec<Option<Action>> = vec![None; graph.len()];
        let mut changes: Vec<Option<ResourceChange>> = vec![None; graph.len()];

        for &idx in graph.topological_order() {
            let node = graph.node(idx);
            let record = records.get(&node.id);

            // Outputs are only trusted from dependencies that stay untouched
            let resolved = graph.resolve_with(idx, |dep, reference| {
                let dep_id = &graph.node(dep).id;
                match (actions[dep], records.get(dep_id)) {
                    (Some(Action::NoOp), Some(dep_record)) => {
                        lookup_path(&dep_record.outputs, &reference.output)
                            .cloned()
                            .map_or(Lookup::Missing, Lookup::Known)
                    }
                    _ => Lookup::Unknown,
                }
            })?;

            let action = if resolved.unknown.is_empty() {
                decide_action(ctx.provider, record, &node.resource_type, &resolved.inputs)
            } else {
                match record {
                    None => Action::Create,
                    Some(r) if r.resource_type != node.resource_type => Action::Replace,
                    Some(_) => Action::Update,
                }
            };

            log::debug!("plan: {} -> {action}", node.id);
            actions[idx] = Some(action);
            changes[idx] = Some(ResourceChange {
                resource_id: node.id.clone(),
                resource_type: node.resource_type.clone(),
                action,
                old_inputs: record.map(|r| r.inputs.clone()),
                new_inputs: Some(resolved.inputs),
                unknown: resolved.unknown,
            });
        }

        for node in graph.nodes() {
            records.remove(&node.id);
        }
        let changes: Vec<ResourceChange> = changes.into_iter().flatten().collect();
        let selected = vec![true; changes.len()];

        let mut plan = Self {
            graph,
            changes,
            selected,
            ..Self::default()
        };
        plan.set_deletions(records.into_values().collect())?;
        Ok(plan)
    }

    /// Plan the deletion of every recorded resource
    pub fn destroy(ctx: EngineContext<'_>) -> Result<Self> {
        let mut plan = Self::default();
        plan.set_deletions(ctx.store.list()?)?;
        Ok(plan)
    }

    fn set_deletions(&mut self, records: Vec<StateRecord>) -> Result<()> {
        self.deletion_graph = DependencyGraph::from_named(
            records
                .iter()
                .map(|r| (r.id.clone(), r.dependencies.clone())),
        )?;
        self.deletion_changes = records.iter().map(ResourceChange::deletion).collect();
        self.selected_deletions = vec![true; records.len()];
        self.deletions = records;
        Ok(())
    }

    /// Restrict the plan to resources matching any target
    ///
    /// A target matches a resource identity, a full type tag, or a type
    /// package. Matched resources pull in their transitive dependencies;
    /// matched deletions pull in every recorded resource that depends on
    /// them.
    pub fn filter_by_targets(mut self, targets: &[String]) -> Self {
        if targets.is_empty() {
            return self;
        }

        for target in targets {
            let declared = self
                .graph
                .nodes()
                .iter()
                .any(|n| matches_target(&n.id, &n.resource_type, target));
            let recorded = self
                .deletions
                .iter()
                .any(|r| matches_target(&r.id, &r.resource_type, target));
            if !declared && !recorded {
                log::warn!("Target '{target}' matches no resource");
            }
        }

        let mut selected = vec![false; self.graph.len()];
        for (idx, node) in self.graph.nodes().iter().enumerate() {
            if targets
                .iter()
                .any(|t| matches_target(&node.id, &node.resource_type, t))
            {
                selected[idx] = true;
                for dep in self.graph.edges().transitive_dependencies(idx) {
                    selected[dep] = true;
                }
            }
        }
        self.selected = selected;

        let mut selected_deletions = vec![false; self.deletions.len()];
        for (idx, record) in self.deletions.iter().enumerate() {
            if targets
                .iter()
                .any(|t| matches_target(&record.id, &record.resource_type, t))
            {
                selected_deletions[idx] = true;
                for dependent in self.deletion_graph.transitive_dependents(idx) {
                    selected_deletions[dependent] = true;
                }
            }
        }
        self.selected_deletions = selected_deletions;
        self
    }

    /// Selected deletions that must run before anything is applied
    ///
    /// Replacing a resource deletes its old instance, so undeclared records
    /// that depend on a resource that is (or may turn out to be) replaced
    /// are deleted first, together with their own dependents.
    pub(crate) fn early_deletions(&self) -> Vec<bool> {
        let mut early = vec![false; self.deletions.len()];
        for (idx, record) in self.deletions.iter().enumerate() {
            if early[idx] || !self.selected_deletions[idx] {
                continue;
            }
            let on_replaced = record.dependencies.iter().any(|dep| {
                self.graph
                    .index_of(dep)
                    .is_some_and(|i| self.selected[i] && may_replace(&self.changes[i]))
            });
            if on_replaced {
                early[idx] = true;
                for dependent in self.deletion_graph.transitive_dependents(idx) {
                    early[dependent] = self.selected_deletions[dependent];
                }
            }
        }
        early
    }

    /// Selected changes in execution order: deletions that must precede a
    /// replacement, declared resources in apply order, then the remaining
    /// deletions dependents first
    pub fn changes(&self) -> Vec<&ResourceChange> {
        let early = self.early_deletions();
        let late: Vec<bool> = early.iter().map(|e| !e).collect();
        let applies = self
            .graph
            .topological_order()
            .iter()
            .filter(|&&i| self.selected[i])
            .map(|&i| &self.changes[i]);

        let mut changes = self.deletes_in_order(&early);
        changes.extend(applies);
        changes.extend(self.deletes_in_order(&late));
        changes
    }

    fn deletes_in_order(&self, mask: &[bool]) -> Vec<&ResourceChange> {
        self.deletion_graph
            .topological_order()
            .iter()
            .rev()
            .filter(|&&i| self.selected_deletions[i] && mask[i])
            .map(|&i| &self.deletion_changes[i])
            .collect()
    }

    /// Planned change for one declared or recorded resource
    pub fn change(&self, id: &str) -> Option<&ResourceChange> {
        if let Some(idx) = self.graph.index_of(id) {
            return self.selected[idx].then(|| &self.changes[idx]);
        }
        let idx = self.deletion_graph.index_of(id)?;
        self.selected_deletions[idx].then(|| &self.deletion_changes[idx])
    }

    /// Records scheduled for deletion
    pub fn deletions(&self) -> impl Iterator<Item = &StateRecord> {
        self.deletions
            .iter()
            .zip(&self.selected_deletions)
            .filter(|(_, selected)| **selected)
            .map(|(record, _)| record)
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary::from_changes(self.changes())
    }

    pub fn has_changes(&self) -> bool {
        self.summary().has_changes()
    }

    /// Nothing declared or recorded is selected
    pub fn is_empty(&self) -> bool {
        !self.selected.iter().chain(&self.selected_deletions).any(|s| *s)
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// Groups of selected resources that may be applied concurrently
    pub fn waves(&self) -> Vec<Vec<&str>> {
        Scheduler::waves(self.graph.edges(), Direction::Forward)
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .filter(|&i| self.selected[i])
                    .map(|i| self.graph.node(i).id.as_str())
                    .collect::<Vec<_>>()
            })
            .filter(|wave| !wave.is_empty())
            .collect()
    }
}

/// A replace is planned, or unknown inputs leave it open
fn may_replace(change: &ResourceChange) -> bool {
    match change.action {
        Action::Replace => true,
        Action::Update => !change.unknown.is_empty(),
        _ => false,
    }
}

/// Check if a resource matches a target
fn matches_target(id: &str, resource_type: &str, target: &str) -> bool {
    id == target || resource_type == target || type_package(resource_type) == target
}
