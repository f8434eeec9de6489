//! Command surface: plan, apply, destroy and drift inspection of a desired spec

use crate::action::{ApplyReport, Plan};
use crate::config::EngineConfig;
use crate::engine::ConvergenceEngine;
use crate::error::Result;
use crate::provider::{Provider, ProviderContext};
use crate::security::SecurityPolicyEnforcer;
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siteflow_core::{DesiredSpec, ResourceGraph};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Difference between recorded and observed state of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DriftKind {
    /// Recorded but gone at the provider
    Missing,
    /// Output differs from what was recorded
    Changed {
        output: String,
        recorded: Value,
        observed: Option<Value>,
    },
    /// Recorded but no longer declared
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub node_id: String,
    #[serde(flatten)]
    pub kind: DriftKind,
}

/// Result of drift inspection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn for_node(&self, node_id: &str) -> Vec<&DriftEntry> {
        self.entries.iter().filter(|e| e.node_id == node_id).collect()
    }
}

/// Entry point used by the CLI
pub struct Deployer {
    engine: ConvergenceEngine,
    enforcer: SecurityPolicyEnforcer,
}

impl Deployer {
    pub fn new(
        provider: Arc<dyn Provider>,
        state: Arc<dyn StateStore>,
        ctx: ProviderContext,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine: ConvergenceEngine::new(provider, state, ctx, config),
            enforcer: SecurityPolicyEnforcer::new(),
        }
    }

    pub fn engine(&self) -> &ConvergenceEngine {
        &self.engine
    }

    /// Plan against the current state
    pub async fn plan(&self, spec: &DesiredSpec) -> Result<Plan> {
        let graph = ResourceGraph::build(spec)?;
        let snapshot = self.engine.state().snapshot().await?;
        self.engine.plan(&graph, &snapshot)
    }

    /// Plan and apply; security assertions run once everything applied.
    ///
    /// A malformed spec (cycle, schema error) fails before any provider call.
    pub async fn apply(&self, spec: &DesiredSpec, cancel: &CancellationToken) -> Result<ApplyReport> {
        let graph = ResourceGraph::build(spec)?;
        let snapshot = self.engine.state().snapshot().await?;
        let plan = self.engine.plan(&graph, &snapshot)?;
        info!(site = %spec.name, summary = %plan.summary(), "Plan ready");

        let mut report = self.engine.apply(&graph, &plan, cancel).await;
        if report.fully_applied() {
            let snapshot = self.engine.state().snapshot().await?;
            report.invariant_violations = self.enforcer.check(&graph, &snapshot);
        }
        Ok(report)
    }

    /// Plan deletion of everything recorded
    pub async fn plan_destroy(&self, spec: &DesiredSpec) -> Result<Plan> {
        let graph = ResourceGraph::build(spec)?;
        let snapshot = self.engine.state().snapshot().await?;
        Ok(self.engine.plan_destroy(&graph, &snapshot))
    }

    /// Delete every recorded node, dependents first
    pub async fn destroy(&self, spec: &DesiredSpec, cancel: &CancellationToken) -> Result<ApplyReport> {
        let graph = ResourceGraph::build(spec)?;
        let snapshot = self.engine.state().snapshot().await?;
        let plan = self.engine.plan_destroy(&graph, &snapshot);
        info!(site = %spec.name, summary = %plan.summary(), "Destroy plan ready");
        Ok(self.engine.apply(&graph, &plan, cancel).await)
    }

    /// Compare recorded outputs with what the provider reports now
    pub async fn drift(&self, spec: &DesiredSpec) -> Result<DriftReport> {
        let snapshot = self.engine.state().snapshot().await?;
        let provider = self.engine.provider();
        let mut report = DriftReport::default();

        for (id, record) in &snapshot.resources {
            if !spec.resources.contains_key(id) {
                report.entries.push(DriftEntry {
                    node_id: id.clone(),
                    kind: DriftKind::Orphaned,
                });
            }

            let ctx = self.engine.context().for_attributes(&record.desired);
            let observed = provider
                .read(&ctx, record.kind, id)
                .await
                .map_err(|source| crate::error::CloudError::Provider {
                    node: id.clone(),
                    source,
                })?;

            let Some(observed) = observed else {
                report.entries.push(DriftEntry {
                    node_id: id.clone(),
                    kind: DriftKind::Missing,
                });
                continue;
            };

            for (output, recorded) in &record.outputs {
                let current = observed.get(output);
                if current != Some(recorded) {
                    report.entries.push(DriftEntry {
                        node_id: id.clone(),
                        kind: DriftKind::Changed {
                            output: output.clone(),
                            recorded: recorded.clone(),
                            observed: current.cloned(),
                        },
                    });
                }
            }
        }
        Ok(report)
    }
}
