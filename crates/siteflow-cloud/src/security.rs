//! Post-apply security assertions
//!
//! After a plan fully applies, the provisioned topology is checked against
//! the invariants of a private-origin static site:
//!
//! - the origin store grants access only to the CDN's access identity
//! - nothing grants public read on the store
//! - every access-denied status the origin can return is remapped by the CDN
//!   to a not-found response pointing at the store's error document
//! - the CDN has a default root object
//!
//! Violations are reported, never remediated.

use crate::action::InvariantViolation;
use crate::state::StateSnapshot;
use serde_json::Value;
use siteflow_core::{ResolvedAttributes, ResourceGraph, ResourceKind, ResourceNode};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Status returned to clients instead of access-denied
pub const NOT_FOUND_STATUS: u64 = 404;

/// How the CDN reaches its origin store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginAccessMode {
    /// Private bucket read through the CDN's access identity
    Identity,
    /// Public website endpoint of the store
    Website,
}

impl OriginAccessMode {
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("identity") => Some(OriginAccessMode::Identity),
            Some("website") => Some(OriginAccessMode::Website),
            Some(_) => None,
        }
    }
}

/// Access-denied statuses the origin returns for a missing key, per mode
pub const ACCESS_DENIED_STATUS: &[(OriginAccessMode, &[u64])] = &[
    (OriginAccessMode::Identity, &[403]),
    (OriginAccessMode::Website, &[404]),
];

/// Look up the access-denied statuses of a mode
pub fn access_denied_statuses(mode: OriginAccessMode) -> &'static [u64] {
    ACCESS_DENIED_STATUS
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, statuses)| *statuses)
        .unwrap_or(&[])
}

/// Checked rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    OriginGrantsCdnOnly,
    NoPublicRead,
    ErrorRemap,
    DefaultRootObject,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rule::OriginGrantsCdnOnly => "origin-grants-cdn-only",
            Rule::NoPublicRead => "no-public-read",
            Rule::ErrorRemap => "error-remap",
            Rule::DefaultRootObject => "default-root-object",
        };
        write!(f, "{}", s)
    }
}

const PUBLIC_PRINCIPALS: &[&str] = &["*", "public", "AllUsers", "allUsers"];

/// A provisioned node: applied attributes overlaid with observed outputs
#[derive(Debug, Clone)]
struct Provisioned<'a> {
    node: &'a ResourceNode,
    values: ResolvedAttributes,
}

impl Provisioned<'_> {
    /// Whether this CDN reads from `store`, by graph edge or by origin domain
    fn fronts(&self, store: &Provisioned<'_>) -> bool {
        self.node.dependencies.contains(&store.node.id)
            || self.str("origin_domain").is_some_and(|domain| {
                store.str("regional_domain_name") == Some(domain)
                    || store.str("bucket").is_some_and(|b| domain.starts_with(&format!("{}.", b)))
            })
    }

    /// Whether this policy governs `store`, by graph edge or by store name
    fn governs(&self, store: &Provisioned<'_>) -> bool {
        self.node.dependencies.contains(&store.node.id)
            || self
                .str("store")
                .is_some_and(|name| store.str("bucket") == Some(name) || store.node.id == name)
    }

    fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }

    fn objects(&self, name: &str) -> Vec<&serde_json::Map<String, Value>> {
        match self.values.get(name) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
            Some(Value::Object(item)) => vec![item],
            _ => Vec::new(),
        }
    }
}

/// Verifies cross-resource security invariants
#[derive(Debug, Default)]
pub struct SecurityPolicyEnforcer;

impl SecurityPolicyEnforcer {
    pub fn new() -> Self {
        Self
    }

    /// Run every assertion against the provisioned topology
    pub fn check(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Vec<InvariantViolation> {
        let provisioned: BTreeMap<&str, Provisioned<'_>> = graph
            .nodes()
            .filter_map(|node| {
                let record = snapshot.get(&node.id)?;
                let mut values = record.desired.clone();
                values.extend(record.outputs.clone());
                Some((node.id.as_str(), Provisioned { node, values }))
            })
            .collect();

        let mut violations = Vec::new();
        self.check_grants(&provisioned, &mut violations);
        self.check_public_read(&provisioned, &mut violations);
        self.check_distributions(&provisioned, &mut violations);

        for violation in &violations {
            warn!(rule = %violation.rule, node = %violation.node_id, "{}", violation.message);
        }
        debug!(violations = violations.len(), "Security assertions finished");
        violations
    }

    /// Rule: the store's grants name only CDN access identities, and every
    /// identity-mode CDN in front of the store is granted
    fn check_grants(
        &self,
        provisioned: &BTreeMap<&str, Provisioned<'_>>,
        violations: &mut Vec<InvariantViolation>,
    ) {
        let distributions: Vec<&Provisioned<'_>> = provisioned
            .values()
            .filter(|p| p.node.kind == ResourceKind::CdnDistribution)
            .collect();

        for store in provisioned.values().filter(|p| p.node.kind == ResourceKind::ObjectStore) {
            let policies: Vec<&Provisioned<'_>> = provisioned
                .values()
                .filter(|p| p.node.kind == ResourceKind::AccessPolicy && p.governs(store))
                .collect();

            let fronting: Vec<&Provisioned<'_>> = distributions
                .iter()
                .copied()
                .filter(|d| d.fronts(store))
                .collect();
            let identities: Vec<&str> = fronting
                .iter()
                .filter_map(|d| d.str("access_identity"))
                .collect();

            let mut granted = Vec::new();
            for policy in &policies {
                for grant in policy.objects("grants") {
                    let principal = grant.get("principal").and_then(Value::as_str).unwrap_or("");
                    if identities.contains(&principal) {
                        granted.push(principal.to_string());
                    } else if !PUBLIC_PRINCIPALS.contains(&principal) {
                        violations.push(InvariantViolation {
                            rule: Rule::OriginGrantsCdnOnly.to_string(),
                            node_id: policy.node.id.clone(),
                            message: format!(
                                "grant to '{}' on {} is not a CDN access identity",
                                principal, store.node.id
                            ),
                        });
                    }
                }
            }

            for cdn in fronting {
                let mode = OriginAccessMode::parse(cdn.str("origin_access_mode"));
                if mode != Some(OriginAccessMode::Identity) {
                    continue;
                }
                let identity = cdn.str("access_identity").unwrap_or("");
                if !granted.iter().any(|g| g == identity) {
                    violations.push(InvariantViolation {
                        rule: Rule::OriginGrantsCdnOnly.to_string(),
                        node_id: store.node.id.clone(),
                        message: format!(
                            "no grant allows {}'s access identity to read the store",
                            cdn.node.id
                        ),
                    });
                }
            }
        }
    }

    /// Rule: no public-read grant on the store
    fn check_public_read(
        &self,
        provisioned: &BTreeMap<&str, Provisioned<'_>>,
        violations: &mut Vec<InvariantViolation>,
    ) {
        for store in provisioned.values().filter(|p| p.node.kind == ResourceKind::ObjectStore) {
            if store.bool("public_read") == Some(true) {
                violations.push(InvariantViolation {
                    rule: Rule::NoPublicRead.to_string(),
                    node_id: store.node.id.clone(),
                    message: "store allows public read".into(),
                });
            }
            if store.bool("block_public_access") == Some(false) {
                violations.push(InvariantViolation {
                    rule: Rule::NoPublicRead.to_string(),
                    node_id: store.node.id.clone(),
                    message: "public access block is disabled".into(),
                });
            }
        }

        for policy in provisioned.values().filter(|p| p.node.kind == ResourceKind::AccessPolicy) {
            for grant in policy.objects("grants") {
                let principal = grant.get("principal").and_then(Value::as_str).unwrap_or("");
                if PUBLIC_PRINCIPALS.contains(&principal) {
                    violations.push(InvariantViolation {
                        rule: Rule::NoPublicRead.to_string(),
                        node_id: policy.node.id.clone(),
                        message: format!("public grant to '{}'", principal),
                    });
                }
            }
        }
    }

    /// Rules: error remap chain and default root object per distribution
    fn check_distributions(
        &self,
        provisioned: &BTreeMap<&str, Provisioned<'_>>,
        violations: &mut Vec<InvariantViolation>,
    ) {
        for cdn in provisioned
            .values()
            .filter(|p| p.node.kind == ResourceKind::CdnDistribution)
        {
            let id = cdn.node.id.clone();

            if cdn.str("default_root_object").is_none_or(str::is_empty) {
                violations.push(InvariantViolation {
                    rule: Rule::DefaultRootObject.to_string(),
                    node_id: id.clone(),
                    message: "no default root object".into(),
                });
            }

            let Some(mode) = OriginAccessMode::parse(cdn.str("origin_access_mode")) else {
                violations.push(InvariantViolation {
                    rule: Rule::ErrorRemap.to_string(),
                    node_id: id.clone(),
                    message: format!(
                        "unknown origin access mode '{}'",
                        cdn.str("origin_access_mode").unwrap_or_default()
                    ),
                });
                continue;
            };

            let origin = provisioned
                .values()
                .find(|p| p.node.kind == ResourceKind::ObjectStore && cdn.fronts(p));
            let Some(origin) = origin else {
                violations.push(InvariantViolation {
                    rule: Rule::ErrorRemap.to_string(),
                    node_id: id.clone(),
                    message: format!(
                        "origin store not resolvable from origin_domain '{}'",
                        cdn.str("origin_domain").unwrap_or_default()
                    ),
                });
                continue;
            };
            let Some(error_document) = origin.str("error_document") else {
                violations.push(InvariantViolation {
                    rule: Rule::ErrorRemap.to_string(),
                    node_id: id.clone(),
                    message: format!("origin store {} has no error document", origin.node.id),
                });
                continue;
            };
            let expected_page = format!("/{}", error_document.trim_start_matches('/'));

            let responses = cdn.objects("error_responses");
            for status in access_denied_statuses(mode) {
                let remapped = responses.iter().any(|r| {
                    as_status(r.get("error_code")) == Some(*status)
                        && as_status(r.get("response_code")) == Some(NOT_FOUND_STATUS)
                        && r.get("response_page_path").and_then(Value::as_str)
                            == Some(expected_page.as_str())
                });
                if !remapped {
                    violations.push(InvariantViolation {
                        rule: Rule::ErrorRemap.to_string(),
                        node_id: id.clone(),
                        message: format!(
                            "origin status {} is not remapped to {} {}",
                            status, NOT_FOUND_STATUS, expected_page
                        ),
                    });
                }
            }
        }
    }
}

/// Status codes may be numbers or numeric strings
fn as_status(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
