//! Convergence engine
//!
//! `plan` diffs the desired graph against the last applied state; `apply`
//! runs the plan on a bounded pool of workers. An operation starts only after
//! every operation it waits for has succeeded, a failure aborts only the
//! dependent subtree, and every result is written through the state store's
//! compare-and-swap. A lost compare-and-swap re-runs the node's decision
//! against the fresh record.

use crate::action::{
    ApplyReport, AttrChange, FailureClass, Operation, OperationKind, Plan, PlannedValue,
};
use crate::config::EngineConfig;
use crate::error::{CloudError, Result};
use crate::provider::{Outputs, Provider, ProviderContext};
use crate::retry::retry_provider_call;
use crate::state::{RecordStatus, StateRecord, StateSnapshot, StateStore, hash_attributes};
use crate::waiter::{ValidationState, ValidationTask, ValidationWaiter};
use serde_json::Value;
use siteflow_core::{
    Readiness, ResolvedAttributes, ResourceGraph, ResourceKind, ResourceNode, resolve_attributes,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a finished operation did
#[derive(Debug, Clone)]
struct WorkOutcome {
    kind: OperationKind,
    changed: bool,
    message: String,
}

impl WorkOutcome {
    fn changed(kind: OperationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            changed: true,
            message: message.into(),
        }
    }

    fn unchanged() -> Self {
        Self {
            kind: OperationKind::NoOp,
            changed: false,
            message: String::new(),
        }
    }
}

/// Drives provisioned state towards the desired graph
pub struct ConvergenceEngine {
    provider: Arc<dyn Provider>,
    state: Arc<dyn StateStore>,
    ctx: ProviderContext,
    config: EngineConfig,
}

impl ConvergenceEngine {
    pub fn new(
        provider: Arc<dyn Provider>,
        state: Arc<dyn StateStore>,
        ctx: ProviderContext,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            state,
            ctx,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn context(&self) -> &ProviderContext {
        &self.ctx
    }

    /// Diff the desired graph against a state snapshot.
    ///
    /// References are resolved with the outputs recorded for upstream nodes;
    /// a reference to a node without a record is deferred and forces an
    /// update once the upstream exists.
    pub fn plan(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<Plan> {
        let mut operations = Vec::new();
        let mut kinds: HashMap<String, OperationKind> = HashMap::new();

        for id in graph.topological_order() {
            let Some(node) = graph.node(&id) else {
                continue;
            };
            let record = snapshot.get(&id);
            if let Some(record) = record
                && record.kind != node.kind
            {
                return Err(CloudError::KindChanged {
                    node: id.clone(),
                    from: record.kind.to_string(),
                    to: node.kind.to_string(),
                });
            }

            let planned = planned_attributes(node, snapshot);
            let deferred = planned
                .values()
                .any(|v| matches!(v, PlannedValue::Deferred(_)));

            let kind = match record {
                None => OperationKind::Create,
                Some(r) if r.status == RecordStatus::Deleting => OperationKind::Update,
                Some(_) if deferred => OperationKind::Update,
                Some(r) if known_hash(&planned).as_deref() != Some(r.desired_hash.as_str()) => {
                    OperationKind::Update
                }
                Some(_) => OperationKind::NoOp,
            };

            let diff = match kind {
                OperationKind::NoOp => Vec::new(),
                _ => attribute_diff(record.map(|r| &r.desired), &planned),
            };

            debug!(node = %id, operation = %kind, "Planned");
            kinds.insert(id.clone(), kind);
            operations.push(
                Operation::new(kind, id.clone(), node.kind)
                    .with_diff(diff)
                    .with_wait_for(graph.dependencies_in_order(&id)),
            );
        }

        // Records that are no longer declared
        let orphans: Vec<String> = snapshot
            .resources
            .keys()
            .filter(|id| !graph.contains(id))
            .cloned()
            .collect();

        for orphan in &orphans {
            let blocking: Vec<String> = snapshot
                .resources
                .iter()
                .filter(|(id, r)| {
                    graph.contains(id)
                        && r.dependencies.contains(orphan)
                        && kinds.get(id.as_str()) == Some(&OperationKind::NoOp)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if !blocking.is_empty() {
                return Err(CloudError::DependencyViolation {
                    node: orphan.clone(),
                    dependents: blocking,
                });
            }
        }

        operations.extend(delete_operations(orphans, snapshot));
        Ok(Plan::new(operations))
    }

    /// Plan deletion of every recorded node, dependents first
    pub fn plan_destroy(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Plan {
        let mut candidates: Vec<String> = graph
            .topological_order()
            .into_iter()
            .rev()
            .filter(|id| snapshot.get(id).is_some())
            .collect();
        candidates.extend(
            snapshot
                .resources
                .keys()
                .filter(|id| !graph.contains(id))
                .cloned(),
        );
        Plan::new(delete_operations(candidates, snapshot))
    }

    /// Execute a plan.
    ///
    /// `cancel` stops scheduling new operations; in-flight operations finish
    /// (they stop retrying and waiting) and are recorded. The plan timeout
    /// triggers the same path.
    ///
    /// A node with a readiness condition is recorded as soon as the provider
    /// accepts it. Its validation records then run, and only after the
    /// condition holds do its other dependents start.
    pub async fn apply(
        &self,
        graph: &ResourceGraph,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> ApplyReport {
        let started = Instant::now();
        let deadline = started + self.config.plan_timeout;
        let run_cancel = cancel.child_token();
        let max_parallel = self.config.max_parallel.max(1);

        let mut report = ApplyReport::new();
        let mut schedule = Schedule::new(plan);

        let worker = Worker {
            provider: self.provider.clone(),
            state: self.state.clone(),
            ctx: self.ctx.clone(),
            config: self.config.clone(),
            waiter: ValidationWaiter::new(self.config.validation_interval),
            cancel: run_cancel.clone(),
        };

        let mut in_flight: JoinSet<Result<WorkOutcome>> = JoinSet::new();
        let mut task_steps: HashMap<Id, Step> = HashMap::new();
        let mut cancel_seen = false;

        info!(
            operations = plan.operations.len(),
            max_parallel, "Applying plan"
        );

        loop {
            while !run_cancel.is_cancelled() && in_flight.len() < max_parallel {
                let Some(step) = schedule.ready.pop_front() else {
                    break;
                };
                let worker = worker.clone();
                let handle = match &step {
                    Step::Operation(id) => {
                        let Some(op) = schedule.operations.get(id.as_str()) else {
                            continue;
                        };
                        let op = (*op).clone();
                        let node = graph.node(id).cloned();
                        debug!(node = %id, operation = %op.kind, "Starting operation");
                        in_flight.spawn(async move { worker.run(op, node).await })
                    }
                    Step::Readiness(id) => {
                        let Some(node) = graph.node(id).cloned() else {
                            continue;
                        };
                        debug!(node = %id, "Waiting for readiness");
                        in_flight.spawn(async move { worker.validate(node).await })
                    }
                };
                task_steps.insert(handle.id(), step);
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next_with_id() => {
                    let (task_id, result) = match joined {
                        Ok((task_id, result)) => (task_id, result),
                        Err(e) => (e.id(), Err(CloudError::StateError(format!("worker failed: {}", e)))),
                    };
                    let Some(step) = task_steps.remove(&task_id) else {
                        continue;
                    };
                    schedule.settle(step, result, &mut report);
                }
                _ = run_cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!(in_flight = in_flight.len(), "Apply cancelled, draining in-flight operations");
                }
                _ = tokio::time::sleep_until(deadline), if !report.timed_out => {
                    warn!(timeout_secs = self.config.plan_timeout.as_secs(), "Plan timeout exceeded");
                    report.timed_out = true;
                    run_cancel.cancel();
                }
            }
        }

        schedule.finish(plan, &mut report);

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            applied = report.applied.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            duration_ms = report.duration_ms,
            "Apply finished"
        );
        report
    }
}

/// A unit of scheduled work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Step {
    /// The planned operation of a node
    Operation(String),
    /// Waiting for a node's readiness condition
    Readiness(String),
}

impl Step {
    fn node_id(&self) -> &str {
        match self {
            Step::Operation(id) | Step::Readiness(id) => id,
        }
    }
}

/// Dependency bookkeeping for one apply run
struct Schedule<'a> {
    operations: HashMap<&'a str, &'a Operation>,
    waiting: HashMap<Step, HashSet<Step>>,
    dependents: HashMap<Step, Vec<Step>>,
    ready: VecDeque<Step>,
    settled: HashSet<Step>,
    /// Outcomes held back until the node's readiness wait finishes
    pending: BTreeMap<String, WorkOutcome>,
}

impl<'a> Schedule<'a> {
    fn new(plan: &'a Plan) -> Self {
        let operations: HashMap<&str, &Operation> = plan
            .operations
            .iter()
            .map(|o| (o.node_id.as_str(), o))
            .collect();

        let gated: HashSet<&str> = plan
            .operations
            .iter()
            .filter(|o| o.kind != OperationKind::Delete && o.resource_kind.readiness().is_some())
            .map(|o| o.node_id.as_str())
            .collect();
        let validates = |op: &Operation| {
            op.kind != OperationKind::Delete && op.resource_kind == ResourceKind::ValidationRecord
        };

        // Plan order, each readiness wait right after its node
        let mut steps: Vec<(Step, HashSet<Step>)> = Vec::new();
        for op in &plan.operations {
            let deps: HashSet<Step> = op
                .wait_for
                .iter()
                .filter(|d| operations.contains_key(d.as_str()))
                .map(|d| {
                    if gated.contains(d.as_str()) && !validates(op) {
                        Step::Readiness(d.clone())
                    } else {
                        Step::Operation(d.clone())
                    }
                })
                .collect();
            steps.push((Step::Operation(op.node_id.clone()), deps));

            if gated.contains(op.node_id.as_str()) {
                let mut deps = HashSet::from([Step::Operation(op.node_id.clone())]);
                deps.extend(
                    plan.operations
                        .iter()
                        .filter(|v| validates(v) && v.wait_for.contains(&op.node_id))
                        .map(|v| Step::Operation(v.node_id.clone())),
                );
                steps.push((Step::Readiness(op.node_id.clone()), deps));
            }
        }

        let mut dependents: HashMap<Step, Vec<Step>> = HashMap::new();
        let mut ready = VecDeque::new();
        for (step, deps) in &steps {
            for dep in deps {
                dependents.entry(dep.clone()).or_default().push(step.clone());
            }
            if deps.is_empty() {
                ready.push_back(step.clone());
            }
        }

        Self {
            operations,
            waiting: steps.into_iter().collect(),
            dependents,
            ready,
            settled: HashSet::new(),
            pending: BTreeMap::new(),
        }
    }

    fn planned(&self, id: &str) -> OperationKind {
        self.operations
            .get(id)
            .map(|o| o.kind)
            .unwrap_or(OperationKind::NoOp)
    }

    /// Record a finished step and release or abort what waits for it
    fn settle(&mut self, step: Step, result: Result<WorkOutcome>, report: &mut ApplyReport) {
        self.settled.insert(step.clone());
        match (&step, result) {
            (Step::Operation(id), Ok(outcome)) => {
                if self.waiting.contains_key(&Step::Readiness(id.clone())) {
                    self.pending.insert(id.clone(), outcome);
                } else {
                    record_success(report, id, outcome);
                }
                self.release(&step);
            }
            (Step::Readiness(id), Ok(validated)) => {
                let outcome = match self.pending.remove(id) {
                    Some(outcome) if outcome.changed => outcome,
                    _ => validated,
                };
                record_success(report, id, outcome);
                self.release(&step);
            }
            (_, Err(e)) => {
                let id = step.node_id();
                warn!(node = %id, error = %e, "Operation failed");
                self.pending.remove(id);
                report.add_failure(id.to_string(), self.planned(id), failure_class(&e), e.to_string());
                self.abort_subtree(&step, report);
            }
        }
    }

    fn release(&mut self, step: &Step) {
        for dependent in self.dependents.get(step).into_iter().flatten() {
            if let Some(deps) = self.waiting.get_mut(dependent) {
                deps.remove(step);
                if deps.is_empty() && !self.settled.contains(dependent) {
                    self.ready.push_back(dependent.clone());
                }
            }
        }
    }

    /// Settle every transitive dependent of a failed step
    fn abort_subtree(&mut self, failed: &Step, report: &mut ApplyReport) {
        let mut queue = vec![failed.clone()];
        while let Some(current) = queue.pop() {
            let cause = current.node_id().to_string();
            for dependent in self.dependents.get(&current).cloned().into_iter().flatten() {
                if !self.settled.insert(dependent.clone()) {
                    continue;
                }
                match &dependent {
                    Step::Operation(id) => match self.operations.get(id.as_str()).map(|o| o.kind) {
                        // Still provisioned with the last applied values
                        Some(OperationKind::NoOp) => report.add_unchanged(id.clone()),
                        Some(kind) => report.add_failure(
                            id.clone(),
                            kind,
                            FailureClass::UpstreamFailed,
                            format!("not attempted: {} failed", cause),
                        ),
                        None => {}
                    },
                    // Recorded, but its validation never completed
                    Step::Readiness(id) => {
                        if self.pending.remove(id).is_some() {
                            report.add_failure(
                                id.clone(),
                                self.planned(id),
                                FailureClass::UpstreamFailed,
                                format!("readiness not awaited: {} failed", cause),
                            );
                        }
                    }
                }
                queue.push(dependent);
            }
        }
    }

    /// Report what never ran
    fn finish(self, plan: &Plan, report: &mut ApplyReport) {
        for op in &plan.operations {
            if !self.settled.contains(&Step::Operation(op.node_id.clone())) {
                report.add_cancelled(op.node_id.clone());
            }
        }
        for id in self.pending.into_keys() {
            report.add_cancelled(id);
        }
    }
}

fn record_success(report: &mut ApplyReport, id: &str, outcome: WorkOutcome) {
    if outcome.changed {
        info!(node = %id, operation = %outcome.kind, "Operation succeeded");
        report.add_success(id.to_string(), outcome.kind, outcome.message);
    } else {
        report.add_unchanged(id.to_string());
    }
}

/// Per-operation executor shared by all workers
#[derive(Clone)]
struct Worker {
    provider: Arc<dyn Provider>,
    state: Arc<dyn StateStore>,
    ctx: ProviderContext,
    config: EngineConfig,
    waiter: ValidationWaiter,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(&self, op: Operation, node: Option<ResourceNode>) -> Result<WorkOutcome> {
        match (op.kind, node) {
            (OperationKind::Delete, _) => self.delete(&op).await,
            (_, Some(node)) => self.converge(&node).await,
            (_, None) => Err(CloudError::InvalidConfig(format!(
                "{} is not part of the desired graph",
                op.node_id
            ))),
        }
    }

    /// Create, update or keep a node.
    ///
    /// A state conflict means someone else wrote the record in between; the
    /// whole decision is made again against the record as it is now.
    async fn converge(&self, node: &ResourceNode) -> Result<WorkOutcome> {
        let mut performed = None;
        let mut conflicts = 0;
        loop {
            match self.converge_once(node, &mut performed).await {
                Err(CloudError::StateConflict { actual, .. })
                    if conflicts < self.config.state_conflict_retries =>
                {
                    conflicts += 1;
                    warn!(node = %node.id, attempt = conflicts, actual, "State changed underneath, re-evaluating");
                }
                Ok(outcome) if !outcome.changed => return Ok(performed.unwrap_or(outcome)),
                other => return other,
            }
        }
    }

    /// One pass of `converge`, re-resolving references against the
    /// upstream records as they are now
    async fn converge_once(
        &self,
        node: &ResourceNode,
        performed: &mut Option<WorkOutcome>,
    ) -> Result<WorkOutcome> {
        let id = node.id.as_str();

        let mut upstream = HashMap::new();
        for dependency in &node.dependencies {
            if let Some(record) = self.state.get(dependency).await? {
                upstream.insert(dependency.clone(), record);
            }
        }
        let resolved = resolve_attributes(&node.attributes, &|r| {
            upstream
                .get(&r.node)
                .and_then(|rec: &StateRecord| rec.output(&r.output))
                .cloned()
        })
        .map_err(|reference| CloudError::UnresolvedReference {
            node: id.to_string(),
            reference: reference.to_string(),
        })?;

        let desired_hash = hash_attributes(&resolved);
        let current = self.state.get(id).await?;
        if let Some(record) = &current {
            if record.kind != node.kind {
                return Err(CloudError::KindChanged {
                    node: id.to_string(),
                    from: record.kind.to_string(),
                    to: node.kind.to_string(),
                });
            }
            if record.status == RecordStatus::Active && record.desired_hash == desired_hash {
                debug!(node = %id, "Up to date");
                return Ok(WorkOutcome::unchanged());
            }
        }

        let ctx = self.ctx.for_attributes(&resolved);
        let retry = &self.config.retry;
        let kind = node.kind;

        let (operation, outputs) = if current.is_some() {
            info!(node = %id, kind = %kind, "Updating");
            let outputs = retry_provider_call(retry, &format!("update {}", id), &self.cancel, || {
                self.provider.update(&ctx, kind, id, &resolved)
            })
            .await
            .map_err(|source| provider_error(id, source))?;
            (OperationKind::Update, outputs)
        } else {
            let existing = retry_provider_call(retry, &format!("read {}", id), &self.cancel, || {
                self.provider.read(&ctx, kind, id)
            })
            .await
            .map_err(|source| provider_error(id, source))?;

            match existing {
                Some(outputs) if reflects(&outputs, &resolved) => {
                    info!(node = %id, kind = %kind, "Adopting existing resource");
                    (OperationKind::Create, outputs)
                }
                Some(_) => {
                    info!(node = %id, kind = %kind, "Converging existing resource");
                    let outputs =
                        retry_provider_call(retry, &format!("update {}", id), &self.cancel, || {
                            self.provider.update(&ctx, kind, id, &resolved)
                        })
                        .await
                        .map_err(|source| provider_error(id, source))?;
                    (OperationKind::Create, outputs)
                }
                None => {
                    info!(node = %id, kind = %kind, "Creating");
                    let outputs =
                        retry_provider_call(retry, &format!("create {}", id), &self.cancel, || {
                            self.provider.create(&ctx, kind, id, &resolved)
                        })
                        .await
                        .map_err(|source| provider_error(id, source))?;
                    (OperationKind::Create, outputs)
                }
            }
        };

        // A create that lost its write and was redone is still a create
        let operation = match performed {
            Some(earlier) if earlier.kind == OperationKind::Create => OperationKind::Create,
            _ => operation,
        };
        let verb = match operation {
            OperationKind::Create => "created",
            _ => "updated",
        };
        let outcome = WorkOutcome::changed(operation, format!("{} {}", kind, verb));
        *performed = Some(outcome.clone());

        let record = StateRecord::new(
            kind,
            resolved,
            outputs,
            node.dependencies.iter().cloned().collect(),
        );
        let expected = current.map(|r| r.version).unwrap_or(0);
        self.state.put(id, record, expected).await?;
        Ok(outcome)
    }

    /// Wait for a recorded node's readiness condition and record the
    /// outputs it was satisfied with
    async fn validate(&self, node: ResourceNode) -> Result<WorkOutcome> {
        let id = node.id.as_str();
        let Some(readiness) = node.kind.readiness() else {
            return Ok(WorkOutcome::unchanged());
        };
        let Some(record) = self.state.get(id).await? else {
            return Err(CloudError::StateError(format!("{} has no record to validate", id)));
        };
        if is_ready(&record.outputs, &readiness) {
            debug!(node = %id, "Already ready");
            return Ok(WorkOutcome::unchanged());
        }

        let ctx = self.ctx.for_attributes(&record.desired);
        let outputs = self.await_ready(&node, &ctx, readiness).await?;
        self.record_outputs(id, outputs).await?;

        info!(node = %id, kind = %node.kind, "Ready");
        Ok(WorkOutcome::changed(
            OperationKind::Update,
            format!("{} {} == {}", node.kind, readiness.output, readiness.expected),
        ))
    }

    /// Poll the provider until the readiness condition holds
    async fn await_ready(
        &self,
        node: &ResourceNode,
        ctx: &ProviderContext,
        readiness: Readiness,
    ) -> Result<Outputs> {
        let id = node.id.as_str();
        let condition = format!("{} == {}", readiness.output, readiness.expected);
        let mut task = ValidationTask::new(id, condition.clone(), self.config.validation_timeout);

        let provider = &self.provider;
        let kind = node.kind;
        let state = self
            .waiter
            .wait(&mut task, &self.cancel, move || async move {
                let outputs = provider.read(ctx, kind, id).await?;
                Ok(outputs.is_some_and(|o| is_ready(&o, &readiness)))
            })
            .await;

        if state != ValidationState::Satisfied {
            if self.cancel.is_cancelled() {
                return Err(CloudError::Cancelled(format!(
                    "validation of {} interrupted",
                    id
                )));
            }
            return Err(CloudError::ValidationTimeout {
                node: id.to_string(),
                condition,
            });
        }

        let outputs = retry_provider_call(
            &self.config.retry,
            &format!("read {}", id),
            &self.cancel,
            || self.provider.read(ctx, node.kind, id),
        )
        .await
        .map_err(|source| provider_error(id, source))?;

        outputs.ok_or_else(|| {
            provider_error(
                id,
                crate::provider::ProviderError::permanent("resource disappeared after validation"),
            )
        })
    }

    /// Replace the outputs of the current record, keeping everything else
    async fn record_outputs(&self, id: &str, outputs: Outputs) -> Result<()> {
        let mut conflicts = 0;
        loop {
            let Some(current) = self.state.get(id).await? else {
                return Err(CloudError::StateError(format!("{} disappeared from state", id)));
            };
            if current.outputs == outputs {
                return Ok(());
            }
            let expected = current.version;
            let mut record = current;
            record.outputs = outputs.clone();
            match self.state.put(id, record, expected).await {
                Ok(_) => return Ok(()),
                Err(CloudError::StateConflict { actual, .. })
                    if conflicts < self.config.state_conflict_retries =>
                {
                    conflicts += 1;
                    warn!(node = %id, attempt = conflicts, actual, "State conflict, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete(&self, op: &Operation) -> Result<WorkOutcome> {
        let id = op.node_id.as_str();

        let mut conflicts = 0;
        let (current, version) = loop {
            let Some(current) = self.state.get(id).await? else {
                return Ok(WorkOutcome::changed(OperationKind::Delete, "already absent"));
            };

            let snapshot = self.state.snapshot().await?;
            let still_required: Vec<String> = snapshot
                .resources
                .iter()
                .filter(|(other, r)| other.as_str() != id && r.dependencies.iter().any(|d| d == id))
                .map(|(other, _)| other.clone())
                .collect();
            if !still_required.is_empty() {
                return Err(CloudError::DependencyViolation {
                    node: id.to_string(),
                    dependents: still_required,
                });
            }

            let expected = current.version;
            let deleting = current.clone().with_status(RecordStatus::Deleting);
            match self.state.put(id, deleting, expected).await {
                Ok(version) => break (current, version),
                Err(CloudError::StateConflict { actual, .. })
                    if conflicts < self.config.state_conflict_retries =>
                {
                    conflicts += 1;
                    warn!(node = %id, attempt = conflicts, actual, "State changed underneath, re-evaluating");
                }
                Err(e) => return Err(e),
            }
        };

        let kind = current.kind;
        let ctx = self.ctx.for_attributes(&current.desired);

        info!(node = %id, kind = %kind, "Deleting");
        retry_provider_call(
            &self.config.retry,
            &format!("delete {}", id),
            &self.cancel,
            || self.provider.delete(&ctx, kind, id),
        )
        .await
        .map_err(|source| provider_error(id, source))?;

        self.remove_record(id, version).await?;
        Ok(WorkOutcome::changed(
            OperationKind::Delete,
            format!("{} deleted", kind),
        ))
    }

    /// Remove the record unless someone else brought it back to life
    async fn remove_record(&self, id: &str, expected: u64) -> Result<()> {
        let mut expected = expected;
        let mut conflicts = 0;
        loop {
            match self.state.remove(id, expected).await {
                Ok(()) => return Ok(()),
                Err(e @ CloudError::StateConflict { .. }) => {
                    let current = self.state.get(id).await?;
                    match current {
                        None => return Ok(()),
                        Some(record)
                            if record.status == RecordStatus::Deleting
                                && conflicts < self.config.state_conflict_retries =>
                        {
                            conflicts += 1;
                            expected = record.version;
                        }
                        Some(_) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn provider_error(node: &str, source: crate::provider::ProviderError) -> CloudError {
    CloudError::Provider {
        node: node.to_string(),
        source,
    }
}

fn failure_class(err: &CloudError) -> FailureClass {
    match err {
        CloudError::Provider { .. } => FailureClass::Provider,
        CloudError::ValidationTimeout { .. } => FailureClass::ValidationTimeout,
        CloudError::StateConflict { .. } => FailureClass::StateConflict,
        CloudError::DependencyViolation { .. } => FailureClass::DependencyViolation,
        CloudError::UnresolvedReference { .. } => FailureClass::UnresolvedReference,
        CloudError::Cancelled(_) => FailureClass::Cancelled,
        _ => FailureClass::Internal,
    }
}

fn is_ready(outputs: &Outputs, readiness: &Readiness) -> bool {
    outputs.get(readiness.output).and_then(Value::as_str) == Some(readiness.expected)
}

/// Whether an existing instance already carries the desired attributes
fn reflects(outputs: &Outputs, desired: &ResolvedAttributes) -> bool {
    desired
        .iter()
        .all(|(name, value)| outputs.get(name) == Some(value))
}

/// Resolve attributes with recorded outputs, deferring what is not known yet
fn planned_attributes(
    node: &ResourceNode,
    snapshot: &StateSnapshot,
) -> BTreeMap<String, PlannedValue> {
    node.attributes
        .iter()
        .map(|(name, value)| {
            let planned = match value.resolve(&|r| snapshot.lookup(r)) {
                Ok(v) => PlannedValue::Known(v),
                Err(reference) => PlannedValue::Deferred(reference.to_string()),
            };
            (name.clone(), planned)
        })
        .collect()
}

/// Hash of planned attributes, if all are known
fn known_hash(planned: &BTreeMap<String, PlannedValue>) -> Option<String> {
    let mut resolved = ResolvedAttributes::new();
    for (name, value) in planned {
        match value {
            PlannedValue::Known(v) => {
                resolved.insert(name.clone(), v.clone());
            }
            PlannedValue::Deferred(_) => return None,
        }
    }
    Some(hash_attributes(&resolved))
}

fn attribute_diff(
    before: Option<&ResolvedAttributes>,
    after: &BTreeMap<String, PlannedValue>,
) -> Vec<AttrChange> {
    let names: BTreeSet<&String> = before
        .into_iter()
        .flat_map(|b| b.keys())
        .chain(after.keys())
        .collect();

    names
        .into_iter()
        .filter_map(|name| {
            let old = before.and_then(|b| b.get(name));
            let new = after.get(name);
            let unchanged = matches!((old, new), (Some(o), Some(PlannedValue::Known(n))) if o == n);
            (!unchanged).then(|| AttrChange {
                name: name.clone(),
                before: old.cloned(),
                after: new.cloned(),
            })
        })
        .collect()
}

/// Delete operations for `candidates` (in preferred order), each waiting for
/// the recorded dependents that are deleted or updated before it
fn delete_operations(candidates: Vec<String>, snapshot: &StateSnapshot) -> Vec<Operation> {
    let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let dependents_of = |id: &str| -> Vec<String> {
        snapshot
            .resources
            .iter()
            .filter(|(other, r)| other.as_str() != id && r.dependencies.iter().any(|d| d == id))
            .map(|(other, _)| other.clone())
            .collect()
    };

    let mut remaining = candidates.clone();
    let mut emitted: HashSet<String> = HashSet::new();
    let mut operations = Vec::new();

    while !remaining.is_empty() {
        let position = remaining
            .iter()
            .position(|id| {
                dependents_of(id)
                    .iter()
                    .all(|d| !candidate_set.contains(d.as_str()) || emitted.contains(d))
            })
            .unwrap_or(0);
        let id = remaining.remove(position);

        let Some(record) = snapshot.get(&id) else {
            continue;
        };
        let before = AttrChange {
            name: "*".into(),
            before: Some(Value::Object(record.desired.clone().into_iter().collect())),
            after: None,
        };
        operations.push(
            Operation::new(OperationKind::Delete, id.clone(), record.kind)
                .with_diff(vec![before])
                .with_wait_for(dependents_of(&id)),
        );
        emitted.insert(id);
    }
    operations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedProvider;
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use siteflow_core::{DesiredSpec, ResourceDecl};

    fn engine() -> ConvergenceEngine {
        ConvergenceEngine::new(
            Arc::new(SimulatedProvider::new()),
            Arc::new(MemoryStateStore::new()),
            ProviderContext::new(),
            EngineConfig::default(),
        )
    }

    fn two_node_spec(error_document: &str) -> DesiredSpec {
        DesiredSpec::new("docs")
            .with_resource(
                "bucket",
                ResourceDecl::new(ResourceKind::ObjectStore)
                    .try_attr("index_document", json!("index.html"))
                    .unwrap()
                    .try_attr("error_document", json!(error_document))
                    .unwrap(),
            )
            .with_resource(
                "cdn",
                ResourceDecl::new(ResourceKind::CdnDistribution)
                    .try_attr("origin_domain", json!("${bucket.regional_domain_name}"))
                    .unwrap()
                    .try_attr("default_root_object", json!("index.html"))
                    .unwrap(),
            )
    }

    #[test]
    fn test_plan_from_empty_state_creates_in_order() {
        let graph = ResourceGraph::build(&two_node_spec("error.html")).unwrap();
        let plan = engine().plan(&graph, &StateSnapshot::new()).unwrap();

        let ids: Vec<_> = plan.operations.iter().map(|o| o.node_id.as_str()).collect();
        assert_eq!(ids, vec!["bucket", "cdn"]);
        assert_eq!(plan.summary().create, 2);

        let cdn = plan.operation("cdn").unwrap();
        assert_eq!(cdn.wait_for, vec!["bucket"]);
        let origin = cdn.diff.iter().find(|c| c.name == "origin_domain").unwrap();
        assert_eq!(
            origin.after,
            Some(PlannedValue::Deferred("${bucket.regional_domain_name}".into()))
        );
    }

    fn certificate_plan() -> Plan {
        Plan::new(vec![
            Operation::new(OperationKind::Create, "certificate", ResourceKind::Certificate),
            Operation::new(OperationKind::Create, "validation", ResourceKind::ValidationRecord)
                .with_wait_for(vec!["certificate".into()]),
            Operation::new(OperationKind::Create, "record", ResourceKind::DnsRecord)
                .with_wait_for(vec!["certificate".into()]),
        ])
    }

    fn created() -> Result<WorkOutcome> {
        Ok(WorkOutcome::changed(OperationKind::Create, "created"))
    }

    #[test]
    fn test_validation_records_run_before_readiness_wait() {
        let plan = certificate_plan();
        let mut schedule = Schedule::new(&plan);
        let mut report = ApplyReport::new();

        let certificate = Step::Operation("certificate".into());
        assert_eq!(schedule.ready.pop_front(), Some(certificate.clone()));
        assert!(schedule.ready.is_empty());

        schedule.settle(certificate, created(), &mut report);
        // Only the validation record is released, and the certificate is not reported yet
        assert_eq!(
            schedule.ready.pop_front(),
            Some(Step::Operation("validation".into()))
        );
        assert!(schedule.ready.is_empty());
        assert!(report.applied.is_empty());

        schedule.settle(Step::Operation("validation".into()), created(), &mut report);
        assert_eq!(
            schedule.ready.pop_front(),
            Some(Step::Readiness("certificate".into()))
        );

        let issued = WorkOutcome::changed(OperationKind::Update, "issued");
        schedule.settle(Step::Readiness("certificate".into()), Ok(issued), &mut report);
        assert_eq!(schedule.ready.pop_front(), Some(Step::Operation("record".into())));

        let certificate = report.applied.iter().find(|r| r.node_id == "certificate").unwrap();
        assert_eq!(certificate.operation, OperationKind::Create);
    }

    #[test]
    fn test_failed_readiness_fails_node_and_dependents() {
        let plan = certificate_plan();
        let mut schedule = Schedule::new(&plan);
        let mut report = ApplyReport::new();

        schedule.settle(Step::Operation("certificate".into()), created(), &mut report);
        schedule.settle(Step::Operation("validation".into()), created(), &mut report);
        schedule.settle(
            Step::Readiness("certificate".into()),
            Err(CloudError::ValidationTimeout {
                node: "certificate".into(),
                condition: "status == ISSUED".into(),
            }),
            &mut report,
        );

        assert_eq!(
            report.failure("certificate").unwrap().failure,
            Some(FailureClass::ValidationTimeout)
        );
        assert_eq!(
            report.failure("record").unwrap().failure,
            Some(FailureClass::UpstreamFailed)
        );
        assert!(report.applied.iter().any(|r| r.node_id == "validation"));

        schedule.finish(&plan, &mut report);
        assert!(report.cancelled.is_empty());
    }

    #[test]
    fn test_cancelled_before_readiness_is_reported() {
        let plan = certificate_plan();
        let mut schedule = Schedule::new(&plan);
        let mut report = ApplyReport::new();

        schedule.settle(Step::Operation("certificate".into()), created(), &mut report);
        schedule.finish(&plan, &mut report);

        assert_eq!(report.cancelled, vec!["validation", "record", "certificate"]);
    }

    #[test]
    fn test_reflects_requires_every_attribute() {
        let mut desired = ResolvedAttributes::new();
        desired.insert("domain_name".into(), json!("www.example.com"));
        let mut outputs = Outputs::new();
        outputs.insert("domain_name".into(), json!("www.example.com"));
        outputs.insert("status".into(), json!("ISSUED"));
        assert!(reflects(&outputs, &desired));

        desired.insert("region".into(), json!("us-east-1"));
        assert!(!reflects(&outputs, &desired));
    }

    #[tokio::test]
    async fn test_apply_then_replan_is_noop() {
        let engine = engine();
        let graph = ResourceGraph::build(&two_node_spec("error.html")).unwrap();

        let plan = engine
            .plan(&graph, &engine.state().snapshot().await.unwrap())
            .unwrap();
        let report = engine.apply(&graph, &plan, &CancellationToken::new()).await;
        assert!(report.fully_applied(), "{:?}", report.failed);
        assert_eq!(report.applied.len(), 2);

        let snapshot = engine.state().snapshot().await.unwrap();
        let second = engine.plan(&graph, &snapshot).unwrap();
        assert!(!second.has_changes);
        assert_eq!(second.summary().no_change, 2);
    }

    #[tokio::test]
    async fn test_removed_node_is_deleted() {
        let engine = engine();
        let graph = ResourceGraph::build(&two_node_spec("error.html")).unwrap();
        let plan = engine.plan(&graph, &StateSnapshot::new()).unwrap();
        engine.apply(&graph, &plan, &CancellationToken::new()).await;

        let mut spec = two_node_spec("error.html");
        spec.remove("cdn");
        let graph = ResourceGraph::build(&spec).unwrap();
        let snapshot = engine.state().snapshot().await.unwrap();
        let plan = engine.plan(&graph, &snapshot).unwrap();
        assert_eq!(plan.summary().delete, 1);
        assert_eq!(plan.operation("cdn").unwrap().kind, OperationKind::Delete);

        let report = engine.apply(&graph, &plan, &CancellationToken::new()).await;
        assert!(report.fully_applied());
        assert!(engine.state().get("cdn").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removing_a_required_node_is_rejected() {
        let engine = engine();
        let graph = ResourceGraph::build(&two_node_spec("error.html")).unwrap();
        let plan = engine.plan(&graph, &StateSnapshot::new()).unwrap();
        engine.apply(&graph, &plan, &CancellationToken::new()).await;

        // cdn stays as is, but its applied record still depends on bucket
        let mut spec = two_node_spec("error.html");
        spec.remove("bucket");
        spec.get_mut("cdn").unwrap().attributes.insert(
            "origin_domain".into(),
            siteflow_core::AttrValue::literal(
                engine.state().get("cdn").await.unwrap().unwrap().desired["origin_domain"].clone(),
            ),
        );
        let graph = ResourceGraph::build(&spec).unwrap();
        let snapshot = engine.state().snapshot().await.unwrap();

        let err = engine.plan(&graph, &snapshot).unwrap_err();
        assert!(matches!(err, CloudError::DependencyViolation { ref node, .. } if node == "bucket"));
    }

    #[tokio::test]
    async fn test_kind_change_is_rejected() {
        let engine = engine();
        let graph = ResourceGraph::build(&two_node_spec("error.html")).unwrap();
        let plan = engine.plan(&graph, &StateSnapshot::new()).unwrap();
        engine.apply(&graph, &plan, &CancellationToken::new()).await;

        let spec = DesiredSpec::new("docs").with_resource(
            "bucket",
            ResourceDecl::new(ResourceKind::Certificate)
                .try_attr("domain_name", json!("www.example.com"))
                .unwrap(),
        );
        let graph = ResourceGraph::build(&spec).unwrap();
        let snapshot = engine.state().snapshot().await.unwrap();
        assert!(matches!(
            engine.plan(&graph, &snapshot),
            Err(CloudError::KindChanged { .. })
        ));
    }

    #[tokio::test]
    async fn test_plan_destroy_deletes_dependents_first() {
        let engine = engine();
        let graph = ResourceGraph::build(&two_node_spec("error.html")).unwrap();
        let plan = engine.plan(&graph, &StateSnapshot::new()).unwrap();
        engine.apply(&graph, &plan, &CancellationToken::new()).await;

        let snapshot = engine.state().snapshot().await.unwrap();
        let destroy = engine.plan_destroy(&graph, &snapshot);
        let ids: Vec<_> = destroy.operations.iter().map(|o| o.node_id.as_str()).collect();
        assert_eq!(ids, vec!["cdn", "bucket"]);
        assert_eq!(destroy.operation("bucket").unwrap().wait_for, vec!["cdn"]);
    }
}
