//! Plan and apply result types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use siteflow_core::ResourceKind;
use std::collections::BTreeMap;

/// Kind of operation planned for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a new resource
    Create,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
            OperationKind::NoOp => write!(f, "no-op"),
        }
    }
}

/// Attribute value as known at plan time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum PlannedValue {
    Known(Value),
    /// Depends on an upstream output that does not exist yet
    Deferred(String),
}

impl std::fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannedValue::Known(v) => write!(f, "{}", v),
            PlannedValue::Deferred(reference) => write!(f, "(known after apply: {})", reference),
        }
    }
}

/// One changed attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrChange {
    pub name: String,
    pub before: Option<Value>,
    pub after: Option<PlannedValue>,
}

/// Represents a planned operation on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Type of operation to perform
    pub kind: OperationKind,

    /// Target node id
    pub node_id: String,

    /// Resource kind of the target
    pub resource_kind: ResourceKind,

    /// Attribute diff against the last applied state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<AttrChange>,

    /// Operations in this plan that must finish successfully first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<String>,

    /// Description of the operation
    pub description: String,
}

impl Operation {
    pub fn new(kind: OperationKind, node_id: impl Into<String>, resource_kind: ResourceKind) -> Self {
        let node_id = node_id.into();
        let description = format!("{} {} ({})", kind, node_id, resource_kind);
        Self {
            kind,
            node_id,
            resource_kind,
            diff: Vec::new(),
            wait_for: Vec::new(),
            description,
        }
    }

    pub fn with_diff(mut self, diff: Vec<AttrChange>) -> Self {
        self.diff = diff;
        self
    }

    pub fn with_wait_for(mut self, wait_for: Vec<String>) -> Self {
        self.wait_for = wait_for;
        self
    }
}

/// Plan containing all operations, ordered so every operation comes after
/// the operations it waits for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// List of operations to perform
    pub operations: Vec<Operation>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(operations: Vec<Operation>) -> Self {
        let has_changes = operations.iter().any(|o| o.kind != OperationKind::NoOp);
        Self {
            operations,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self {
            operations: Vec::new(),
            has_changes: false,
        }
    }

    /// Get operations by kind
    pub fn operations_by_kind(&self, kind: OperationKind) -> Vec<&Operation> {
        self.operations.iter().filter(|o| o.kind == kind).collect()
    }

    /// Operation targeting a node
    pub fn operation(&self, node_id: &str) -> Option<&Operation> {
        self.operations.iter().find(|o| o.node_id == node_id)
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.operations_by_kind(OperationKind::Create).len(),
            update: self.operations_by_kind(OperationKind::Update).len(),
            delete: self.operations_by_kind(OperationKind::Delete).len(),
            no_change: self.operations_by_kind(OperationKind::NoOp).len(),
        }
    }
}

/// Summary of planned operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )
    }
}

/// Runtime status of a node during apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Creating,
    Active,
    Updating,
    Deleting,
    Failed,
    Deleted,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Creating => "creating",
            NodeStatus::Active => "active",
            NodeStatus::Updating => "updating",
            NodeStatus::Deleting => "deleting",
            NodeStatus::Failed => "failed",
            NodeStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// Why a node failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Provider rejected the call (or transient retries were exhausted)
    Provider,
    /// Readiness condition not met before the deadline
    ValidationTimeout,
    /// Concurrent state writer kept winning
    StateConflict,
    /// Deletion still referenced by another node
    DependencyViolation,
    /// A prerequisite node failed
    UpstreamFailed,
    /// Reference could not be resolved
    UnresolvedReference,
    /// Interrupted by cancellation or the plan deadline
    Cancelled,
    /// Anything else (I/O, serialization)
    Internal,
}

/// Outcome of a single operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    /// Target node id
    pub node_id: String,

    /// Operation that ran
    pub operation: OperationKind,

    /// Success message
    pub message: String,

    /// Failure classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Post-apply security assertion failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Violated rule
    pub rule: String,

    /// Offending node
    pub node_id: String,

    /// Human-readable detail
    pub message: String,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.rule, self.node_id, self.message)
    }
}

/// Exit semantics surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Some nodes failed or were cancelled but the plan otherwise progressed
    PartialFailure,
    /// Apply succeeded but security assertions failed
    InvariantFailure,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::PartialFailure => write!(f, "partial failure"),
            Outcome::InvariantFailure => write!(f, "invariant failure"),
        }
    }
}

/// Result of applying a plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Operations that changed something
    pub applied: Vec<NodeResult>,

    /// Nodes left untouched
    pub unchanged: Vec<String>,

    /// Failed operations
    pub failed: Vec<NodeResult>,

    /// Operations never started because of cancellation or timeout
    pub cancelled: Vec<String>,

    /// Security assertions that failed after a full apply
    pub invariant_violations: Vec<InvariantViolation>,

    /// Final status per node
    pub statuses: BTreeMap<String, NodeStatus>,

    /// Whether the plan-level timeout expired
    pub timed_out: bool,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl ApplyReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == Outcome::Success
    }

    /// Whether every operation finished successfully
    pub fn fully_applied(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn outcome(&self) -> Outcome {
        if !self.fully_applied() {
            Outcome::PartialFailure
        } else if !self.invariant_violations.is_empty() {
            Outcome::InvariantFailure
        } else {
            Outcome::Success
        }
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.get(node_id).copied()
    }

    pub fn add_success(&mut self, node_id: String, operation: OperationKind, message: String) {
        let status = match operation {
            OperationKind::Delete => NodeStatus::Deleted,
            _ => NodeStatus::Active,
        };
        self.statuses.insert(node_id.clone(), status);
        self.applied.push(NodeResult {
            node_id,
            operation,
            message,
            failure: None,
            error: None,
        });
    }

    pub fn add_unchanged(&mut self, node_id: String) {
        self.statuses.insert(node_id.clone(), NodeStatus::Active);
        self.unchanged.push(node_id);
    }

    pub fn add_failure(
        &mut self,
        node_id: String,
        operation: OperationKind,
        failure: FailureClass,
        error: String,
    ) {
        self.statuses.insert(node_id.clone(), NodeStatus::Failed);
        self.failed.push(NodeResult {
            node_id,
            operation,
            message: String::new(),
            failure: Some(failure),
            error: Some(error),
        });
    }

    pub fn add_cancelled(&mut self, node_id: String) {
        self.statuses.insert(node_id.clone(), NodeStatus::Pending);
        self.cancelled.push(node_id);
    }

    /// Failure entry for a node
    pub fn failure(&self, node_id: &str) -> Option<&NodeResult> {
        self.failed.iter().find(|r| r.node_id == node_id)
    }
}
