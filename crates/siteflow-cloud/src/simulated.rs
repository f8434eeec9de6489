//! In-memory provider
//!
//! Fabricates realistic outputs (ARNs, CDN domain, access identity,
//! certificate validation records) deterministically from the node id, and
//! supports fault injection, certificate issuance holds and artificial
//! latency. Every call is logged with start and finish sequence numbers so
//! tests can check ordering and parallelism.

use crate::provider::{ErrorClass, Outputs, Provider, ProviderContext, ProviderError, ProviderResult};
use crate::state::StateSnapshot;
use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use siteflow_core::{ResolvedAttributes, ResourceKind};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const CDN_HOSTED_ZONE_ID: &str = "Z2FDTNDATAQYW2";
const ACCOUNT_ID: &str = "000000000000";

/// Provider call type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallKind::Create => "create",
            CallKind::Read => "read",
            CallKind::Update => "update",
            CallKind::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// One logged provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub kind: CallKind,
    pub node_id: String,
    /// Sequence number taken when the call started
    pub started: u64,
    /// Sequence number taken when the call returned
    pub finished: u64,
}

#[derive(Debug)]
struct Fault {
    call: Option<CallKind>,
    remaining: u32,
    class: ErrorClass,
}

#[derive(Debug, Clone)]
struct SimResource {
    kind: ResourceKind,
    outputs: Outputs,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, SimResource>,
    faults: HashMap<String, Vec<Fault>>,
    held: HashSet<String>,
    calls: Vec<ProviderCall>,
}

impl Inner {
    /// Whether a certificate's validation can complete. DNS validation
    /// needs the published record it asked for.
    fn validated(&self, certificate: &Outputs) -> bool {
        if certificate.get("validation_method").and_then(Value::as_str) != Some("DNS") {
            return true;
        }
        let wanted = (
            certificate.get("validation_record_name"),
            certificate.get("validation_record_value"),
        );
        self.resources.values().any(|r| {
            r.kind == ResourceKind::ValidationRecord
                && (r.outputs.get("name"), r.outputs.get("value")) == wanted
        })
    }
}

/// Provider backed by process memory
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    inner: Mutex<Inner>,
    sequence: AtomicU64,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Start with every recorded resource already present
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let resources = snapshot
            .resources
            .iter()
            .map(|(id, record)| {
                let mut outputs = record.desired.clone();
                outputs.extend(record.outputs.clone());
                (
                    id.clone(),
                    SimResource {
                        kind: record.kind,
                        outputs,
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                resources,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Fail the next `times` calls on a node with a transient error
    pub async fn fail_transient(&self, node_id: &str, call: CallKind, times: u32) {
        self.add_fault(node_id, Some(call), times, ErrorClass::Transient)
            .await;
    }

    /// Fail every call of a kind (or every call when `None`) on a node
    pub async fn fail_permanent(&self, node_id: &str, call: Option<CallKind>) {
        self.add_fault(node_id, call, u32::MAX, ErrorClass::Permanent)
            .await;
    }

    /// Clear injected faults on a node
    pub async fn clear_faults(&self, node_id: &str) {
        self.inner.lock().await.faults.remove(node_id);
    }

    /// Keep a certificate pending validation
    pub async fn hold_issuance(&self, node_id: &str) {
        self.inner.lock().await.held.insert(node_id.to_string());
    }

    /// Let a held certificate be issued once its validation completes
    pub async fn release_issuance(&self, node_id: &str) {
        self.inner.lock().await.held.remove(node_id);
    }

    /// Remove a resource behind the engine's back
    pub async fn remove_resource(&self, node_id: &str) {
        self.inner.lock().await.resources.remove(node_id);
    }

    /// Change an output behind the engine's back
    pub async fn set_output(&self, node_id: &str, name: &str, value: Value) {
        if let Some(resource) = self.inner.lock().await.resources.get_mut(node_id) {
            resource.outputs.insert(name.to_string(), value);
        }
    }

    /// Current outputs of a resource
    pub async fn resource(&self, node_id: &str) -> Option<Outputs> {
        self.inner
            .lock()
            .await
            .resources
            .get(node_id)
            .map(|r| r.outputs.clone())
    }

    /// Every call made so far
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Nodes that received a call of `kind`, in call order
    pub async fn calls_of(&self, kind: CallKind) -> Vec<String> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.node_id.clone())
            .collect()
    }

    /// Forget the call log
    pub async fn reset_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Highest number of calls observed running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn add_fault(&self, node_id: &str, call: Option<CallKind>, times: u32, class: ErrorClass) {
        self.inner
            .lock()
            .await
            .faults
            .entry(node_id.to_string())
            .or_default()
            .push(Fault {
                call,
                remaining: times,
                class,
            });
    }

    async fn call<T, F>(&self, kind: CallKind, node_id: &str, f: F) -> ProviderResult<T>
    where
        F: FnOnce(&mut Inner) -> ProviderResult<T>,
    {
        let started = self.sequence.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut inner = self.inner.lock().await;
        let result = match take_fault(&mut inner, kind, node_id) {
            Some(err) => Err(err),
            None => f(&mut inner),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let finished = self.sequence.fetch_add(1, Ordering::SeqCst);
        inner.calls.push(ProviderCall {
            kind,
            node_id: node_id.to_string(),
            started,
            finished,
        });
        tracing::trace!(call = %kind, node = %node_id, ok = result.is_ok(), "Simulated call");
        result
    }
}

fn take_fault(inner: &mut Inner, kind: CallKind, node_id: &str) -> Option<ProviderError> {
    let faults = inner.faults.get_mut(node_id)?;
    let fault = faults
        .iter_mut()
        .find(|f| f.remaining > 0 && f.call.is_none_or(|c| c == kind))?;
    if fault.remaining != u32::MAX {
        fault.remaining -= 1;
    }
    let message = format!("injected {} failure on {}", kind, node_id);
    Some(match fault.class {
        ErrorClass::Transient => ProviderError::transient(message),
        ErrorClass::Permanent => ProviderError::permanent(message),
    })
}

fn digest(seed: &str) -> String {
    hex::encode(Sha256::digest(seed.as_bytes()))
}

fn str_attr<'a>(attributes: &'a ResolvedAttributes, name: &str) -> Option<&'a str> {
    attributes.get(name).and_then(Value::as_str)
}

/// Input attributes echoed back plus computed outputs
fn fabricate(
    ctx: &ProviderContext,
    kind: ResourceKind,
    id: &str,
    attributes: &ResolvedAttributes,
    previous: Option<&Outputs>,
) -> Outputs {
    let mut outputs = attributes.clone();
    let hash = digest(id);
    let region = ctx.region_or_default();

    match kind {
        ResourceKind::ObjectStore => {
            let bucket = str_attr(attributes, "bucket_name")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}-{}", id, &hash[..8]));
            outputs.insert("arn".into(), json!(format!("arn:aws:s3:::{}", bucket)));
            outputs.insert(
                "regional_domain_name".into(),
                json!(format!("{}.s3.{}.amazonaws.com", bucket, region)),
            );
            outputs.insert("bucket".into(), json!(bucket));
        }
        ResourceKind::AccessPolicy => {
            outputs.insert("policy_id".into(), json!(format!("policy-{}", &hash[..12])));
        }
        ResourceKind::CdnDistribution => {
            let distribution_id = format!("E{}", hash[..13].to_uppercase());
            let identity_id = format!("E{}", hash[13..26].to_uppercase());
            outputs.insert("distribution_id".into(), json!(distribution_id));
            outputs.insert(
                "domain_name".into(),
                json!(format!("d{}.cloudfront.net", &hash[..14])),
            );
            outputs.insert("hosted_zone_id".into(), json!(CDN_HOSTED_ZONE_ID));
            outputs.insert(
                "access_identity".into(),
                json!(format!(
                    "arn:aws:iam::cloudfront:user/CloudFront Origin Access Identity {}",
                    identity_id
                )),
            );
            outputs.insert(
                "access_identity_path".into(),
                json!(format!("origin-access-identity/cloudfront/{}", identity_id)),
            );
        }
        ResourceKind::Certificate => {
            let domain = str_attr(attributes, "domain_name").unwrap_or(id);
            let status = previous
                .and_then(|p| p.get("status"))
                .cloned()
                .unwrap_or_else(|| json!("PENDING_VALIDATION"));
            outputs.insert(
                "arn".into(),
                json!(format!(
                    "arn:aws:acm:{}:{}:certificate/{}",
                    region,
                    ACCOUNT_ID,
                    &hash[..32]
                )),
            );
            outputs.insert("status".into(), status);
            outputs.insert(
                "validation_record_name".into(),
                json!(format!("_{}.{}.", &hash[..16], domain)),
            );
            outputs.insert(
                "validation_record_value".into(),
                json!(format!("_{}.acm-validations.aws.", &hash[16..48])),
            );
            outputs.insert("validation_record_type".into(), json!("CNAME"));
        }
        ResourceKind::DnsRecord | ResourceKind::ValidationRecord => {
            let name = str_attr(attributes, "name").unwrap_or(id);
            outputs.insert("fqdn".into(), json!(name.trim_end_matches('.')));
        }
    }
    outputs
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn create(
        &self,
        ctx: &ProviderContext,
        kind: ResourceKind,
        id: &str,
        attributes: &ResolvedAttributes,
    ) -> ProviderResult<Outputs> {
        self.call(CallKind::Create, id, |inner| {
            if inner.resources.contains_key(id) {
                return Err(ProviderError::permanent(format!("{} already exists", id)));
            }
            let outputs = fabricate(ctx, kind, id, attributes, None);
            inner.resources.insert(
                id.to_string(),
                SimResource {
                    kind,
                    outputs: outputs.clone(),
                },
            );
            Ok(outputs)
        })
        .await
    }

    async fn read(
        &self,
        _ctx: &ProviderContext,
        kind: ResourceKind,
        id: &str,
    ) -> ProviderResult<Option<Outputs>> {
        self.call(CallKind::Read, id, |inner| {
            let issuable = !inner.held.contains(id)
                && inner
                    .resources
                    .get(id)
                    .is_some_and(|r| r.kind == ResourceKind::Certificate && inner.validated(&r.outputs));
            let Some(resource) = inner.resources.get_mut(id) else {
                return Ok(None);
            };
            if resource.kind != kind {
                return Err(ProviderError::permanent(format!(
                    "{} is a {}, not a {}",
                    id, resource.kind, kind
                )));
            }
            if issuable {
                resource.outputs.insert("status".into(), json!("ISSUED"));
            }
            Ok(Some(resource.outputs.clone()))
        })
        .await
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        kind: ResourceKind,
        id: &str,
        attributes: &ResolvedAttributes,
    ) -> ProviderResult<Outputs> {
        self.call(CallKind::Update, id, |inner| {
            let previous = inner.resources.get(id).map(|r| r.outputs.clone());
            let outputs = fabricate(ctx, kind, id, attributes, previous.as_ref());
            inner.resources.insert(
                id.to_string(),
                SimResource {
                    kind,
                    outputs: outputs.clone(),
                },
            );
            Ok(outputs)
        })
        .await
    }

    async fn delete(
        &self,
        _ctx: &ProviderContext,
        _kind: ResourceKind,
        id: &str,
    ) -> ProviderResult<()> {
        self.call(CallKind::Delete, id, |inner| {
            inner.resources.remove(id);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> ResolvedAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_outputs_are_deterministic() {
        let ctx = ProviderContext::new().with_region("ap-northeast-1");
        let a = SimulatedProvider::new();
        let b = SimulatedProvider::new();
        let input = attrs(&[("index_document", json!("index.html"))]);

        let first = a.create(&ctx, ResourceKind::ObjectStore, "bucket", &input).await.unwrap();
        let second = b.create(&ctx, ResourceKind::ObjectStore, "bucket", &input).await.unwrap();
        assert_eq!(first, second);
        assert!(first["regional_domain_name"]
            .as_str()
            .unwrap()
            .ends_with(".s3.ap-northeast-1.amazonaws.com"));
        assert_eq!(first["index_document"], json!("index.html"));
    }

    #[tokio::test]
    async fn test_access_identity_survives_update() {
        let ctx = ProviderContext::new();
        let provider = SimulatedProvider::new();
        let created = provider
            .create(&ctx, ResourceKind::CdnDistribution, "cdn", &attrs(&[("default_root_object", json!("index.html"))]))
            .await
            .unwrap();
        let updated = provider
            .update(&ctx, ResourceKind::CdnDistribution, "cdn", &attrs(&[("default_root_object", json!("home.html"))]))
            .await
            .unwrap();
        assert_eq!(created["access_identity"], updated["access_identity"]);
        assert_eq!(updated["default_root_object"], json!("home.html"));
    }

    #[tokio::test]
    async fn test_certificate_issuance_hold() {
        let ctx = ProviderContext::new();
        let provider = SimulatedProvider::new();
        provider.hold_issuance("certificate").await;

        let created = provider
            .create(&ctx, ResourceKind::Certificate, "certificate", &attrs(&[("domain_name", json!("www.example.com"))]))
            .await
            .unwrap();
        assert_eq!(created["status"], json!("PENDING_VALIDATION"));

        let read = provider.read(&ctx, ResourceKind::Certificate, "certificate").await.unwrap().unwrap();
        assert_eq!(read["status"], json!("PENDING_VALIDATION"));

        provider.release_issuance("certificate").await;
        let read = provider.read(&ctx, ResourceKind::Certificate, "certificate").await.unwrap().unwrap();
        assert_eq!(read["status"], json!("ISSUED"));
    }

    #[tokio::test]
    async fn test_dns_certificate_waits_for_validation_record() {
        let ctx = ProviderContext::new();
        let provider = SimulatedProvider::new();
        let created = provider
            .create(
                &ctx,
                ResourceKind::Certificate,
                "certificate",
                &attrs(&[
                    ("domain_name", json!("www.example.com")),
                    ("validation_method", json!("DNS")),
                ]),
            )
            .await
            .unwrap();

        let read = provider.read(&ctx, ResourceKind::Certificate, "certificate").await.unwrap().unwrap();
        assert_eq!(read["status"], json!("PENDING_VALIDATION"));

        // A record with the wrong value does not count
        provider
            .create(
                &ctx,
                ResourceKind::ValidationRecord,
                "stale",
                &attrs(&[
                    ("zone", json!("example.com")),
                    ("name", created["validation_record_name"].clone()),
                    ("record_type", json!("CNAME")),
                    ("value", json!("_old.acm-validations.aws.")),
                ]),
            )
            .await
            .unwrap();
        let read = provider.read(&ctx, ResourceKind::Certificate, "certificate").await.unwrap().unwrap();
        assert_eq!(read["status"], json!("PENDING_VALIDATION"));

        provider
            .create(
                &ctx,
                ResourceKind::ValidationRecord,
                "validation",
                &attrs(&[
                    ("zone", json!("example.com")),
                    ("name", created["validation_record_name"].clone()),
                    ("record_type", created["validation_record_type"].clone()),
                    ("value", created["validation_record_value"].clone()),
                ]),
            )
            .await
            .unwrap();
        let read = provider.read(&ctx, ResourceKind::Certificate, "certificate").await.unwrap().unwrap();
        assert_eq!(read["status"], json!("ISSUED"));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let ctx = ProviderContext::new();
        let provider = SimulatedProvider::new();
        provider.fail_transient("bucket", CallKind::Create, 1).await;

        let input = attrs(&[]);
        let err = provider
            .create(&ctx, ResourceKind::ObjectStore, "bucket", &input)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(provider.create(&ctx, ResourceKind::ObjectStore, "bucket", &input).await.is_ok());

        let calls = provider.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].started < calls[0].finished);
        assert!(calls[0].finished < calls[1].started);
    }
}
