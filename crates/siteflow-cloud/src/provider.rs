//! Provider API abstraction
//!
//! A provider performs create/read/update/delete of one resource instance
//! and returns its observed outputs. Calls are keyed by the stable node id
//! and are expected to be upsert-style, so re-issuing them after a partial
//! failure is safe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siteflow_core::{ResolvedAttributes, ResourceKind};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Observed outputs of a resource instance
pub type Outputs = BTreeMap<String, Value>;

/// Cloud provider abstraction trait
///
/// Concrete cloud integrations implement this trait; the engine never talks
/// to a cloud API directly.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name (e.g., "aws", "simulated")
    fn name(&self) -> &str;

    /// Create a resource, returning its outputs
    async fn create(
        &self,
        ctx: &ProviderContext,
        kind: ResourceKind,
        id: &str,
        attributes: &ResolvedAttributes,
    ) -> ProviderResult<Outputs>;

    /// Read a resource; `None` means it does not exist
    async fn read(
        &self,
        ctx: &ProviderContext,
        kind: ResourceKind,
        id: &str,
    ) -> ProviderResult<Option<Outputs>>;

    /// Update an existing resource in place
    async fn update(
        &self,
        ctx: &ProviderContext,
        kind: ResourceKind,
        id: &str,
        attributes: &ResolvedAttributes,
    ) -> ProviderResult<Outputs>;

    /// Delete a resource; deleting an absent resource succeeds
    async fn delete(&self, ctx: &ProviderContext, kind: ResourceKind, id: &str)
    -> ProviderResult<()>;
}

/// Explicit per-call context (region, profile, tags)
///
/// Passed to every provider call instead of relying on ambient session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderContext {
    /// Default region for calls
    pub region: Option<String>,

    /// Named credential profile (resolved by the provider, never by the engine)
    pub profile: Option<String>,

    /// Tags applied to every created resource
    pub tags: BTreeMap<String, String>,
}

impl ProviderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Derive the context for one resource: a `region` attribute overrides
    /// the default region (certificates for CDNs must live in us-east-1).
    pub fn for_attributes(&self, attributes: &ResolvedAttributes) -> Self {
        match attributes.get("region").and_then(Value::as_str) {
            Some(region) => self.clone().with_region(region),
            None => self.clone(),
        }
    }

    /// Region to use, falling back to us-east-1
    pub fn region_or_default(&self) -> &str {
        self.region.as_deref().unwrap_or("us-east-1")
    }
}

/// Whether a provider failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Throttling, network blips, eventual consistency
    Transient,
    /// Invalid input, missing permissions, quota exhausted
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Provider call failure tagged with its retry class
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{class} provider error: {message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    /// Escalate to permanent (used once retries are exhausted)
    pub fn escalate(self, attempts: u32) -> Self {
        Self::permanent(format!(
            "{} (gave up after {} attempts)",
            self.message, attempts
        ))
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_region_override_from_attributes() {
        let ctx = ProviderContext::new()
            .with_region("ap-northeast-1")
            .with_profile("deploy");

        let mut attributes = ResolvedAttributes::new();
        attributes.insert("domain_name".into(), json!("www.example.com"));
        assert_eq!(ctx.for_attributes(&attributes).region_or_default(), "ap-northeast-1");

        attributes.insert("region".into(), json!("us-east-1"));
        let derived = ctx.for_attributes(&attributes);
        assert_eq!(derived.region.as_deref(), Some("us-east-1"));
        assert_eq!(derived.profile.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_escalate_makes_error_permanent() {
        let err = ProviderError::transient("throttled").escalate(3);
        assert!(!err.is_transient());
        assert!(err.message.contains("3 attempts"));
    }
}
