#![allow(dead_code)]

use serde_json::json;
use siteflow_cloud::{
    Deployer, EngineConfig, MemoryStateStore, ProviderContext, RetryConfig, SimulatedProvider,
    StateStore,
};
use siteflow_core::{DesiredSpec, ResourceDecl, ResourceKind};
use std::sync::Arc;
use std::time::Duration;

pub const NODES: [&str; 6] = [
    "bucket",
    "cdn",
    "policy",
    "certificate",
    "validation",
    "record",
];

/// Millisecond-scale engine settings
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_max_parallel(4)
        .with_retry(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: true,
        })
        .with_validation(Duration::from_millis(5), Duration::from_millis(200))
        .with_plan_timeout(Duration::from_secs(30))
}

/// Six-node static site: store, distribution, policy, certificate with its
/// DNS validation record, alias record
pub fn site_spec(error_document: &str) -> DesiredSpec {
    DesiredSpec::new("docs")
        .with_resource(
            "bucket",
            ResourceDecl::new(ResourceKind::ObjectStore)
                .try_attr("index_document", json!("index.html"))
                .unwrap()
                .try_attr("error_document", json!(error_document))
                .unwrap()
                .try_attr("object_ownership", json!("BucketOwnerEnforced"))
                .unwrap()
                .try_attr("block_public_access", json!(true))
                .unwrap(),
        )
        .with_resource(
            "cdn",
            ResourceDecl::new(ResourceKind::CdnDistribution)
                .try_attr("origin_domain", json!("${bucket.regional_domain_name}"))
                .unwrap()
                .try_attr("default_root_object", json!("index.html"))
                .unwrap()
                .try_attr(
                    "error_responses",
                    json!([{
                        "error_code": 403,
                        "response_code": 404,
                        "response_page_path": "/${bucket.error_document}"
                    }]),
                )
                .unwrap()
                .try_attr("viewer_protocol_policy", json!("redirect-to-https"))
                .unwrap()
                .try_attr("price_class", json!("PriceClass_100"))
                .unwrap(),
        )
        .with_resource(
            "policy",
            ResourceDecl::new(ResourceKind::AccessPolicy)
                .try_attr("store", json!("${bucket.bucket}"))
                .unwrap()
                .try_attr(
                    "grants",
                    json!([{
                        "principal": "${cdn.access_identity}",
                        "actions": ["s3:GetObject"],
                        "resource": "${bucket.arn}/*"
                    }]),
                )
                .unwrap(),
        )
        .with_resource(
            "certificate",
            ResourceDecl::new(ResourceKind::Certificate)
                .try_attr("domain_name", json!("www.example.com"))
                .unwrap()
                .try_attr("validation_method", json!("DNS"))
                .unwrap()
                .try_attr("region", json!("us-east-1"))
                .unwrap(),
        )
        .with_resource(
            "validation",
            ResourceDecl::new(ResourceKind::ValidationRecord)
                .try_attr("zone", json!("example.com"))
                .unwrap()
                .try_attr("name", json!("${certificate.validation_record_name}"))
                .unwrap()
                .try_attr("record_type", json!("${certificate.validation_record_type}"))
                .unwrap()
                .try_attr("value", json!("${certificate.validation_record_value}"))
                .unwrap(),
        )
        .with_resource(
            "record",
            ResourceDecl::new(ResourceKind::DnsRecord)
                .try_attr("zone", json!("example.com"))
                .unwrap()
                .try_attr("name", json!("www.example.com"))
                .unwrap()
                .try_attr("record_type", json!("A"))
                .unwrap()
                .try_attr("alias_name", json!("${cdn.domain_name}"))
                .unwrap()
                .try_attr("alias_zone_id", json!("${cdn.hosted_zone_id}"))
                .unwrap()
                .depends_on("certificate"),
        )
}

pub struct Harness {
    pub provider: Arc<SimulatedProvider>,
    pub state: Arc<dyn StateStore>,
    pub deployer: Deployer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(SimulatedProvider::new(), fast_config())
    }

    pub fn with(provider: SimulatedProvider, config: EngineConfig) -> Self {
        Self::with_state(provider, Arc::new(MemoryStateStore::new()), config)
    }

    pub fn with_state(
        provider: SimulatedProvider,
        state: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        let provider = Arc::new(provider);
        let deployer = Deployer::new(
            provider.clone(),
            state.clone(),
            ProviderContext::new().with_region("ap-northeast-1"),
            config,
        );
        Self {
            provider,
            state,
            deployer,
        }
    }
}
