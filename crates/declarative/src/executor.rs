//! Execution engine - applies a plan with graph-driven parallelism
//!
//! A coordinator on the calling thread owns the scheduler and every
//! node's outputs. Ready resources have their inputs resolved and are then
//! handed to workers on a rayon pool sized by `jobs`. Workers decide the
//! action against the state store, call the provider (with retries) and
//! write the new record, then report back over a channel. Completion
//! unlocks dependents; failure blocks them.
//!
//! Deletions run after the apply phase, dependents first. Undeclared
//! records that depend on a resource about to be replaced are deleted
//! before the apply phase, since a replace removes the old instance.

use crate::context::{ConfirmCallback, EngineContext, Phase, ProgressCallback};
use crate::diff::decide_action;
use crate::error::{Error, Result, error_chain};
use crate::graph::ResourceGraph;
use crate::planner::Plan;
use crate::provider::ProviderError;
use crate::retry::{RetryPolicy, with_retry};
use crate::scheduler::{Direction, Scheduler};
use crate::state::StateRecord;
use crate::types::{Action, ExecuteSummary, FailurePolicy, PropertyBag, ResourceStatus};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

/// Final state of one resource after execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceOutcome {
    pub id: String,
    pub resource_type: String,
    /// Action taken, or planned when the resource never ran
    pub action: Option<Action>,
    pub status: ResourceStatus,
    /// Provider calls made, retries included
    pub attempts: u32,
    /// Every status the resource went through, in order
    pub history: Vec<ResourceStatus>,
}

/// Result of executing a plan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub outcomes: Vec<ResourceOutcome>,
    pub summary: ExecuteSummary,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }

    pub fn outcome(&self, id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Outcomes that ended in `Failed`
    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ResourceStatus::Failed { .. }))
    }

    fn push(&mut self, outcome: ResourceOutcome) {
        self.summary.add(outcome.action, &outcome.status);
        self.outcomes.push(outcome);
    }
}

/// Execute a plan with the given context and callbacks
///
/// Confirmation is only requested when the plan has changes. A dry run
/// returns an empty report without touching the provider or the store.
pub fn execute<P, C>(
    ctx: EngineContext<'_>,
    plan: Plan,
    progress: &mut P,
    confirm: &mut C,
) -> Result<ExecutionReport>
where
    P: ProgressCallback,
    C: ConfirmCallback,
{
    let planned = plan.summary();

    if ctx.options.dry_run {
        return Ok(ExecutionReport::default());
    }

    if planned.has_changes() {
        let prompt = format!("Apply {} change(s)?", planned.total());
        let accepted = confirm
            .confirm(&prompt)
            .map_err(|e| Error::Executor(format!("confirmation failed: {e:#}")))?;
        if !accepted {
            return Ok(declined(&plan));
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.options.jobs.max(1))
        .build()
        .map_err(|e| Error::Executor(format!("failed to create thread pool: {e}")))?;

    let mut report = ExecutionReport::default();
    let early = plan.early_deletions();
    let Plan {
        mut graph,
        changes,
        selected,
        deletions,
        deletion_changes,
        deletion_graph,
        selected_deletions,
    } = plan;

    let halt = ctx.options.failure_policy == FailurePolicy::Halt;
    let mut deletes = Tracker::new(deletion_changes.iter().map(|c| {
        (c.resource_id.clone(), c.resource_type.clone(), Some(Action::Delete))
    }));
    let mut late: Vec<bool> = selected_deletions
        .iter()
        .zip(&early)
        .map(|(selected, early)| *selected && !early)
        .collect();
    let mut held_back: BTreeMap<usize, String> = BTreeMap::new();
    let mut halted = false;

    // Dependents of replaced resources go before the apply phase
    let early_count = early.iter().filter(|e| **e).count();
    if early_count > 0 {
        log::info!("Deleting {early_count} resource(s) ahead of replacements");
        progress.on_phase_start(Phase::Delete, early_count);

        let scheduler = Scheduler::with_selection(&deletion_graph, Direction::Reverse, &early);
        let mut driver = DeleteDriver {
            records: &deletions,
        };
        halted = run_phase(
            ctx,
            &pool,
            Phase::Delete,
            scheduler,
            &mut driver,
            &mut deletes,
            progress,
        )? && halt;
        progress.on_phase_complete(Phase::Delete);

        let unsucceeded: Vec<usize> = (0..deletions.len())
            .filter(|&n| early[n] && !deletes.succeeded(n))
            .collect();
        for node in unsucceeded {
            let reason = format!("dependent '{}' could not be deleted", deletions[node].id);
            for dep in &deletions[node].dependencies {
                if let Some(idx) = graph.index_of(dep)
                    && selected[idx]
                {
                    held_back.entry(idx).or_insert_with(|| reason.clone());
                }
            }
            for dep in deletion_graph.transitive_dependencies(node) {
                if late[dep] {
                    late[dep] = false;
                    deletes.settle(
                        dep,
                        ResourceStatus::Skipped {
                            reason: reason.clone(),
                        },
                        progress,
                    );
                }
            }
        }
    }

    // Apply phase
    let apply_count = selected.iter().filter(|s| **s).count();
    if apply_count > 0 {
        let mut tracker = Tracker::new(changes.iter().map(|c| {
            (c.resource_id.clone(), c.resource_type.clone(), Some(c.action))
        }));

        if halted {
            log::info!("Skipping {apply_count} resource(s) after failure");
            tracker.skip_pending(&selected, "halted after failure", progress);
        } else {
            log::info!("Applying {apply_count} resource(s) with {} worker(s)", ctx.options.jobs);
            progress.on_phase_start(Phase::Apply, apply_count);

            let edges = graph.edges().clone();
            let mut scheduler = Scheduler::with_selection(&edges, Direction::Forward, &selected);
            for (node, reason) in held_back {
                hold_back(node, reason, &mut scheduler, &mut tracker, progress);
            }
            let mut driver = ApplyDriver { graph: &mut graph };

            halted = run_phase(
                ctx,
                &pool,
                Phase::Apply,
                scheduler,
                &mut driver,
                &mut tracker,
                progress,
            )? && halt;
            progress.on_phase_complete(Phase::Apply);
        }

        for outcome in tracker.finish(&selected) {
            report.push(outcome);
        }
    }

    // Delete phase
    let delete_count = late.iter().filter(|s| **s).count();
    if delete_count > 0 {
        if halted {
            log::info!("Skipping {delete_count} deletion(s) after failure");
            deletes.skip_pending(&late, "halted after failure", progress);
        } else {
            log::info!("Deleting {delete_count} resource(s)");
            progress.on_phase_start(Phase::Delete, delete_count);

            let scheduler = Scheduler::with_selection(&deletion_graph, Direction::Reverse, &late);
            let mut driver = DeleteDriver {
                records: &deletions,
            };
            run_phase(
                ctx,
                &pool,
                Phase::Delete,
                scheduler,
                &mut driver,
                &mut deletes,
                progress,
            )?;
            progress.on_phase_complete(Phase::Delete);
        }
    }

    for outcome in deletes.finish(&selected_deletions) {
        report.push(outcome);
    }

    Ok(report)
}

/// Every selected resource skipped because the user declined
fn declined(plan: &Plan) -> ExecutionReport {
    let mut report = ExecutionReport::default();
    for change in plan.changes() {
        let status = ResourceStatus::Skipped {
            reason: "cancelled".into(),
        };
        report.push(ResourceOutcome {
            id: change.resource_id.clone(),
            resource_type: change.resource_type.clone(),
            action: Some(change.action),
            status: status.clone(),
            attempts: 0,
            history: vec![ResourceStatus::Pending, status],
        });
    }
    report
}

// ============================================================================
// Phase coordination
// ============================================================================

/// Per-resource status bookkeeping for one phase
struct Tracker {
    outcomes: Vec<ResourceOutcome>,
}

impl Tracker {
    fn new(entries: impl Iterator<Item = (String, String, Option<Action>)>) -> Self {
        let outcomes = entries
            .map(|(id, resource_type, action)| ResourceOutcome {
                id,
                resource_type,
                action,
                status: ResourceStatus::Pending,
                attempts: 0,
                history: vec![ResourceStatus::Pending],
            })
            .collect();
        Self { outcomes }
    }

    fn id(&self, node: usize) -> &str {
        &self.outcomes[node].id
    }

    fn transition(&mut self, node: usize, status: ResourceStatus) {
        let outcome = &mut self.outcomes[node];
        log::debug!("{}: {} -> {}", outcome.id, outcome.status, status);
        outcome.history.push(status.clone());
        outcome.status = status;
    }

    /// Fold in what a worker observed
    fn absorb(&mut self, node: usize, trail: &TaskLog) {
        let outcome = &mut self.outcomes[node];
        if trail.action.is_some() {
            outcome.action = trail.action;
        }
        outcome.attempts += trail.attempts;
        for status in &trail.history {
            log::debug!("{}: {} -> {}", outcome.id, outcome.status, status);
            outcome.history.push(status.clone());
            outcome.status = status.clone();
        }
    }

    fn settle<P: ProgressCallback>(&mut self, node: usize, status: ResourceStatus, progress: &mut P) {
        self.transition(node, status);
        let outcome = &self.outcomes[node];
        progress.on_resource_complete(&outcome.id, &outcome.status);
    }

    fn is_settled(&self, node: usize) -> bool {
        self.outcomes[node].status.is_terminal()
    }

    fn succeeded(&self, node: usize) -> bool {
        self.outcomes[node].status == ResourceStatus::Applied
    }

    /// Skip every masked node that has not settled yet
    fn skip_pending<P: ProgressCallback>(&mut self, mask: &[bool], reason: &str, progress: &mut P) {
        for node in (0..self.outcomes.len()).filter(|&n| mask[n]) {
            if !self.is_settled(node) {
                self.settle(
                    node,
                    ResourceStatus::Skipped {
                        reason: reason.to_string(),
                    },
                    progress,
                );
            }
        }
    }

    fn finish(self, selected: &[bool]) -> impl Iterator<Item = ResourceOutcome> {
        self.outcomes
            .into_iter()
            .zip(selected.to_vec())
            .filter_map(|(outcome, selected)| selected.then_some(outcome))
    }
}

/// Supplies worker tasks for the nodes of one phase
trait PhaseDriver {
    type Task: Task;

    /// Build the task for a node that became ready
    fn prepare(&mut self, node: usize) -> Result<Self::Task>;

    /// Accept the outputs of a node that finished
    fn finish(&mut self, node: usize, outputs: PropertyBag);
}

/// Work done on a pool thread for one node
trait Task: Send {
    fn run(self, ctx: EngineContext<'_>, trail: &mut TaskLog) -> Result<PropertyBag>;
}

/// What a worker did, reported back to the coordinator
#[derive(Debug, Default)]
struct TaskLog {
    action: Option<Action>,
    attempts: u32,
    history: Vec<ResourceStatus>,
}

impl TaskLog {
    /// Call the provider under the retry policy, one `Applying` per attempt
    fn call<T, F>(
        &mut self,
        policy: &RetryPolicy,
        id: &str,
        mut op: F,
    ) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> std::result::Result<T, ProviderError>,
    {
        let history = &mut self.history;
        // Continues across calls, so a replace numbers its delete and create in sequence
        let mut attempt = self.attempts;
        let attempted = with_retry(policy, id, || {
            attempt += 1;
            history.push(ResourceStatus::Applying { attempt });
            op()
        });
        self.attempts += attempted.attempts;
        attempted.result
    }
}

struct TaskReport {
    trail: TaskLog,
    outputs: std::result::Result<PropertyBag, String>,
}

/// Drive one phase to completion; returns whether anything failed
fn run_phase<D, P>(
    ctx: EngineContext<'_>,
    pool: &ThreadPool,
    phase: Phase,
    mut scheduler: Scheduler<'_>,
    driver: &mut D,
    tracker: &mut Tracker,
    progress: &mut P,
) -> Result<bool>
where
    D: PhaseDriver,
    P: ProgressCallback,
{
    let (tx, rx) = mpsc::channel::<(usize, TaskReport)>();
    let mut failed = false;

    let limit = ctx.options.jobs.max(1);

    pool.in_place_scope(|scope| -> Result<()> {
        let mut running = 0usize;

        loop {
            // At most `jobs` tasks in flight, so a halt leaves the rest unstarted
            while running < limit
                && let Some(node) = scheduler.next_ready()
            {
                tracker.transition(node, ResourceStatus::Resolving);
                match driver.prepare(node) {
                    Ok(task) => {
                        progress.on_resource_start(tracker.id(node));
                        let tx = tx.clone();
                        running += 1;
                        scope.spawn(move |_| {
                            let mut trail = TaskLog::default();
                            let outputs = panic::catch_unwind(AssertUnwindSafe(|| {
                                task.run(ctx, &mut trail)
                            }))
                            .unwrap_or_else(|_| {
                                Err(Error::Executor("worker panicked".into()))
                            })
                            .map_err(|e| error_chain(&e));
                            // The receiver lives until the scope ends
                            let _ = tx.send((node, TaskReport { trail, outputs }));
                        });
                    }
                    Err(e) => {
                        failed = true;
                        settle_failure(
                            ctx,
                            phase,
                            node,
                            error_chain(&e),
                            &mut scheduler,
                            tracker,
                            progress,
                        );
                    }
                }
            }

            if running == 0 {
                break;
            }

            let (node, report) = rx
                .recv()
                .map_err(|_| Error::Executor("worker channel closed".into()))?;
            running -= 1;
            tracker.absorb(node, &report.trail);

            match report.outputs {
                Ok(outputs) => {
                    driver.finish(node, outputs);
                    tracker.settle(node, ResourceStatus::Applied, progress);
                    scheduler.complete(node);
                }
                Err(error) => {
                    failed = true;
                    settle_failure(
                        ctx,
                        phase,
                        node,
                        error,
                        &mut scheduler,
                        tracker,
                        progress,
                    );
                }
            }
        }

        debug_assert!(scheduler.is_finished());
        Ok(())
    })?;

    Ok(failed)
}

/// Mark a node failed and skip everything that waited on it
fn settle_failure<P: ProgressCallback>(
    ctx: EngineContext<'_>,
    phase: Phase,
    node: usize,
    error: String,
    scheduler: &mut Scheduler<'_>,
    tracker: &mut Tracker,
    progress: &mut P,
) {
    log::debug!("{} failed: {error}", tracker.id(node));
    tracker.settle(node, ResourceStatus::Failed { error }, progress);

    let reason = match phase {
        Phase::Apply => format!("dependency '{}' failed", tracker.id(node)),
        Phase::Delete => format!("dependent '{}' could not be deleted", tracker.id(node)),
    };
    for blocked in scheduler.fail(node) {
        tracker.settle(
            blocked,
            ResourceStatus::Skipped {
                reason: reason.clone(),
            },
            progress,
        );
    }

    if ctx.options.failure_policy == FailurePolicy::Halt {
        for cancelled in scheduler.cancel_pending() {
            tracker.settle(
                cancelled,
                ResourceStatus::Skipped {
                    reason: "halted after failure".into(),
                },
                progress,
            );
        }
    }
}

/// Skip a node before it starts, along with everything that waits on it
fn hold_back<P: ProgressCallback>(
    node: usize,
    reason: String,
    scheduler: &mut Scheduler<'_>,
    tracker: &mut Tracker,
    progress: &mut P,
) {
    if tracker.is_settled(node) {
        return;
    }
    log::debug!("{}: held back, {reason}", tracker.id(node));
    tracker.settle(node, ResourceStatus::Skipped { reason }, progress);

    let reason = format!("dependency '{}' was skipped", tracker.id(node));
    for blocked in scheduler.fail(node) {
        tracker.settle(
            blocked,
            ResourceStatus::Skipped {
                reason: reason.clone(),
            },
            progress,
        );
    }
}

// ============================================================================
// Apply phase
// ============================================================================

struct ApplyDriver<'p> {
    graph: &'p mut ResourceGraph,
}

impl PhaseDriver for ApplyDriver<'_> {
    type Task = ApplyTask;

    fn prepare(&mut self, node: usize) -> Result<ApplyTask> {
        let inputs = self.graph.resolve_inputs(node)?;
        let decl = self.graph.node(node);
        Ok(ApplyTask {
            id: decl.id.clone(),
            resource_type: decl.resource_type.clone(),
            inputs,
            dependencies: self.graph.dependency_ids(node),
        })
    }

    fn finish(&mut self, node: usize, outputs: PropertyBag) {
        self.graph.set_outputs(node, outputs);
    }
}

struct ApplyTask {
    id: String,
    resource_type: String,
    inputs: PropertyBag,
    dependencies: Vec<String>,
}

impl Task for ApplyTask {
    fn run(self, ctx: EngineContext<'_>, trail: &mut TaskLog) -> Result<PropertyBag> {
        let policy = &ctx.options.retry;
        let provider_error = |source| Error::Provider {
            resource: self.id.clone(),
            source,
        };

        let record = ctx.store.get(&self.id)?;
        let action = decide_action(ctx.provider, record.as_ref(), &self.resource_type, &self.inputs);
        trail.action = Some(action);
        log::debug!("{}: decided {action}", self.id);

        let (provider_id, outputs) = match (action, record) {
            (Action::NoOp, Some(record)) => {
                if record.dependencies != self.dependencies {
                    ctx.store.put(StateRecord {
                        dependencies: self.dependencies,
                        ..record.clone()
                    })?;
                }
                return Ok(record.outputs);
            }
            (Action::Update, Some(record)) => {
                let outputs = trail
                    .call(policy, &self.id, || {
                        ctx.provider.update(
                            &self.resource_type,
                            &record.provider_id,
                            &record.inputs,
                            &self.inputs,
                        )
                    })
                    .map_err(provider_error)?;
                (record.provider_id, outputs)
            }
            (Action::Replace, Some(record)) => {
                let deleted = trail.call(policy, &self.id, || {
                    ctx.provider
                        .delete(&record.resource_type, &record.provider_id, &record.inputs)
                });
                match deleted {
                    Ok(()) | Err(ProviderError::NotFound { .. }) => {}
                    Err(source) => return Err(provider_error(source)),
                }
                ctx.store.remove(&self.id)?;

                let created = trail
                    .call(policy, &self.id, || {
                        ctx.provider.create(&self.resource_type, &self.inputs)
                    })
                    .map_err(provider_error)?;
                (created.identity, created.outputs)
            }
            _ => {
                let created = trail
                    .call(policy, &self.id, || {
                        ctx.provider.create(&self.resource_type, &self.inputs)
                    })
                    .map_err(provider_error)?;
                (created.identity, created.outputs)
            }
        };

        ctx.store.put(StateRecord::new(
            self.id.clone(),
            self.resource_type.clone(),
            provider_id,
            self.inputs.clone(),
            outputs.clone(),
            self.dependencies.clone(),
        ))?;
        Ok(outputs)
    }
}

// ============================================================================
// Delete phase
// ============================================================================

struct DeleteDriver<'p> {
    records: &'p [StateRecord],
}

impl PhaseDriver for DeleteDriver<'_> {
    type Task = DeleteTask;

    fn prepare(&mut self, node: usize) -> Result<DeleteTask> {
        Ok(DeleteTask {
            record: self.records[node].clone(),
        })
    }

    fn finish(&mut self, _node: usize, _outputs: PropertyBag) {}
}

struct DeleteTask {
    record: StateRecord,
}

impl Task for DeleteTask {
    fn run(self, ctx: EngineContext<'_>, trail: &mut TaskLog) -> Result<PropertyBag> {
        let record = &self.record;
        trail.action = Some(Action::Delete);

        let deleted = trail.call(&ctx.options.retry, &record.id, || {
            ctx.provider
                .delete(&record.resource_type, &record.provider_id, &record.inputs)
        });
        match deleted {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                log::debug!("{}: already gone", record.id);
            }
            Err(source) => {
                return Err(Error::Provider {
                    resource: record.id.clone(),
                    source,
                });
            }
        }

        ctx.store.remove(&record.id)?;
        Ok(PropertyBag::new())
    }
}

// ============================================================================
// Refresh
// ============================================================================

/// Result of reconciling the store with what the provider reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub unchanged: usize,
    pub updated: usize,
    pub removed: usize,
    /// Records whose provider cannot read
    pub unsupported: usize,
    /// Resource identity and error chain for each failed read
    pub errors: Vec<(String, String)>,
}

impl RefreshSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Read every recorded resource through the provider and update the store
///
/// Reads run in parallel; with `dry_run` the store is left untouched.
pub fn refresh(ctx: EngineContext<'_>) -> Result<RefreshSummary> {
    let records = ctx.store.list()?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.options.jobs.max(1))
        .build()
        .map_err(|e| Error::Executor(format!("failed to create thread pool: {e}")))?;

    let reads: Vec<(StateRecord, std::result::Result<Option<PropertyBag>, ProviderError>)> =
        pool.install(|| {
            records
                .into_par_iter()
                .map(|record| {
                    let read = with_retry(&ctx.options.retry, &record.id, || {
                        ctx.provider.read(&record.resource_type, &record.provider_id)
                    });
                    (record, read.result)
                })
                .collect()
        });

    let mut summary = RefreshSummary::default();
    for (record, read) in reads {
        match read {
            Ok(Some(outputs)) if outputs == record.outputs => summary.unchanged += 1,
            Ok(Some(outputs)) => {
                log::debug!("refresh: {} outputs changed", record.id);
                summary.updated += 1;
                if !ctx.options.dry_run {
                    ctx.store.put(StateRecord {
                        outputs,
                        updated_at: chrono::Utc::now(),
                        ..record
                    })?;
                }
            }
            Ok(None) | Err(ProviderError::NotFound { .. }) => {
                log::debug!("refresh: {} is gone", record.id);
                summary.removed += 1;
                if !ctx.options.dry_run {
                    ctx.store.remove(&record.id)?;
                }
            }
            Err(ProviderError::Unsupported { .. }) => summary.unsupported += 1,
            Err(source) => {
                let err = Error::Provider {
                    resource: record.id.clone(),
                    source,
                };
                summary.errors.push((record.id, error_chain(&err)));
            }
        }
    }

    log::info!(
        "Refreshed state: {} unchanged, {} updated, {} removed",
        summary.unchanged,
        summary.updated,
        summary.removed
    );
    Ok(summary)
}
