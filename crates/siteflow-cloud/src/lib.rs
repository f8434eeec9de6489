//! SiteFlow deployment engine
//!
//! Converges a static-site stack (origin store, access policy, CDN,
//! certificate, DNS) to its declared desired spec and checks the security
//! invariants of the result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   SiteFlow CLI                   │
//! │            (site plan/apply/destroy)             │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 siteflow-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │               Deployer                    │   │
//! │  │   ConvergenceEngine  SecurityPolicy       │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │  Validation  │  │  StateStore  │            │
//! │  │   Waiter     │  │ (memory/file)│            │
//! │  └──────────────┘  └──────────────┘            │
//! └───────┬─────────────────────────────────────────┘
//!         │  trait Provider { create/read/update/delete }
//! ┌───────▼───────┐ ┌───────────────┐
//! │   simulated   │ │ cloud-specific│
//! │   provider    │ │   providers   │
//! └───────────────┘ └───────────────┘
//! ```

pub mod action;
pub mod config;
pub mod deployer;
pub mod engine;
pub mod error;
pub mod provider;
pub mod retry;
pub mod security;
pub mod simulated;
pub mod state;
pub mod waiter;

// Re-exports
pub use action::{
    ApplyReport, AttrChange, FailureClass, InvariantViolation, NodeResult, NodeStatus, Operation,
    OperationKind, Outcome, Plan, PlanSummary, PlannedValue,
};
pub use config::EngineConfig;
pub use deployer::{Deployer, DriftEntry, DriftKind, DriftReport};
pub use engine::ConvergenceEngine;
pub use error::{CloudError, Result};
pub use provider::{ErrorClass, Outputs, Provider, ProviderContext, ProviderError, ProviderResult};
pub use retry::{RetryConfig, retry_provider_call};
pub use security::{
    ACCESS_DENIED_STATUS, NOT_FOUND_STATUS, OriginAccessMode, Rule, SecurityPolicyEnforcer,
};
pub use simulated::{CallKind, ProviderCall, SimulatedProvider};
pub use state::{
    FileStateStore, MemoryStateStore, RecordStatus, StateRecord, StateSnapshot, StateStore,
    hash_attributes,
};
pub use tokio_util::sync::CancellationToken;
pub use waiter::{ValidationState, ValidationTask, ValidationWaiter};
