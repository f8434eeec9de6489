use super::*;
use crate::graph::ResourceGraph;
use crate::model::{AttrValue, ResourceKind};
use serde_json::json;

const STATIC_SITE: &str = r#"
    site "docs"

    variables {
        domain "example.com"
        subdomain "www"
    }

    resource "bucket" kind="object-store" {
        index_document "index.html"
        error_document "error.html"
        object_ownership "BucketOwnerEnforced"
        block_public_access #true
    }

    resource "cdn" kind="cdn-distribution" {
        origin_domain "${bucket.regional_domain_name}"
        origin_id "${bucket.arn}"
        default_root_object "index.html"
        viewer_protocol_policy "redirect-to-https"
        allowed_methods "GET" "HEAD"
        default_ttl 600
        error_response error_code=403 response_code=404 response_page_path="/${bucket.error_document}"
        aliases "{{ subdomain }}.{{ domain }}"
    }

    resource "policy" kind="access-policy" {
        store "${bucket.bucket}"
        grant principal="${cdn.access_identity}" actions="s3:GetObject" resource="${bucket.arn}/*"
    }

    resource "certificate" kind="certificate" {
        domain_name "{{ subdomain }}.{{ domain }}"
        validation_method "DNS"
        region "us-east-1"
    }

    resource "site-record" kind="dns-record" {
        depends_on "certificate"
        zone "{{ domain }}"
        name "{{ subdomain }}"
        record_type "A"
        alias_name "${cdn.domain_name}"
        alias_zone_id "${cdn.hosted_zone_id}"
        evaluate_target_health #true
    }
"#;

#[test]
fn test_parse_static_site() {
    let spec = parse_kdl_string(STATIC_SITE, "fallback".to_string()).unwrap();
    assert_eq!(spec.name, "docs");
    assert_eq!(spec.len(), 5);

    let ids: Vec<_> = spec.resources.keys().cloned().collect();
    assert_eq!(
        ids,
        vec!["bucket", "cdn", "policy", "certificate", "site-record"]
    );

    let bucket = spec.get("bucket").unwrap();
    assert_eq!(bucket.kind, ResourceKind::ObjectStore);
    assert_eq!(
        bucket.attributes["block_public_access"],
        AttrValue::Literal(json!(true))
    );
}

#[test]
fn test_variables_are_rendered() {
    let spec = parse_kdl_string(STATIC_SITE, "fallback".to_string()).unwrap();
    let certificate = spec.get("certificate").unwrap();
    assert_eq!(
        certificate.attributes["domain_name"],
        AttrValue::Literal(json!("www.example.com"))
    );
    let cdn = spec.get("cdn").unwrap();
    assert_eq!(
        cdn.attributes["aliases"],
        AttrValue::Literal(json!(["www.example.com"]))
    );
}

#[test]
fn test_repeated_items_become_object_list() {
    let spec = parse_kdl_string(STATIC_SITE, "fallback".to_string()).unwrap();
    let cdn = spec.get("cdn").unwrap();
    let responses = cdn.attributes["error_responses"].clone().into_json();
    assert_eq!(
        responses,
        json!([{
            "error_code": 403,
            "response_code": 404,
            "response_page_path": "/${bucket.error_document}"
        }])
    );
    assert_eq!(cdn.attributes["default_ttl"], AttrValue::Literal(json!(600)));
    assert_eq!(
        cdn.attributes["allowed_methods"],
        AttrValue::Literal(json!(["GET", "HEAD"]))
    );
}

#[test]
fn test_parsed_spec_builds_graph() {
    let spec = parse_kdl_string(STATIC_SITE, "fallback".to_string()).unwrap();
    let graph = ResourceGraph::build(&spec).unwrap();

    let record = graph.node("site-record").unwrap();
    assert!(record.dependencies.contains("certificate"));
    assert!(record.dependencies.contains("cdn"));

    let order = graph.topological_order();
    let position = |id: &str| order.iter().position(|n| n == id).unwrap();
    assert!(position("bucket") < position("cdn"));
    assert!(position("cdn") < position("policy"));
    assert!(position("certificate") < position("site-record"));
}

#[test]
fn test_unknown_kind_is_error() {
    let kdl = r#"
        resource "lb" kind="load-balancer" {
            port 443
        }
    "#;
    assert!(parse_kdl_string(kdl, "test".to_string()).is_err());
}

#[test]
fn test_unknown_attribute_is_error() {
    let kdl = r#"
        resource "bucket" kind="object-store" {
            index_document "index.html"
            error_document "error.html"
            versioning #true
        }
    "#;
    let err = parse_kdl_string(kdl, "test".to_string()).unwrap_err();
    assert!(matches!(err, SiteError::UnknownAttribute { .. }));
}

#[test]
fn test_duplicate_resource_is_error() {
    let kdl = r#"
        resource "a" kind="validation-record" {
            zone "example.com"
            name "_x"
            record_type "CNAME"
            value "y"
        }
        resource "a" kind="validation-record" {
            zone "example.com"
            name "_x"
            record_type "CNAME"
            value "y"
        }
    "#;
    assert!(parse_kdl_string(kdl, "test".to_string()).is_err());
}

#[test]
fn test_parse_kdl_file_uses_directory_name() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("my-site");
    std::fs::create_dir(&project).unwrap();
    let path = project.join("site.kdl");
    std::fs::write(
        &path,
        r#"
        resource "certificate" kind="certificate" {
            domain_name "www.example.com"
        }
        "#,
    )
    .unwrap();

    let spec = parse_kdl_file(&path).unwrap();
    assert_eq!(spec.name, "my-site");
    assert_eq!(spec.len(), 1);
}
