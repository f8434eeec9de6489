//! リソース種別とスキーマ
//!
//! SiteFlowが扱うリソースは閉じた集合（ストレージ、アクセスポリシー、CDN、
//! 証明書、DNSレコード、検証レコード）で、種別ごとに属性スキーマと
//! 出力名が静的に定義されています。

use crate::error::SiteError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// リソース種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// オリジンとなるオブジェクトストレージ（バケット）
    ObjectStore,
    /// オブジェクトストレージへのアクセスポリシー
    AccessPolicy,
    /// CDNディストリビューション
    CdnDistribution,
    /// TLS証明書
    Certificate,
    /// DNSレコード（エイリアス等）
    DnsRecord,
    /// 証明書のDNS検証レコード
    ValidationRecord,
}

/// 属性値の形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrShape {
    /// 単一の値
    Scalar,
    /// 値のリスト
    List,
    /// オブジェクトのリスト（KDLでは同名ノードの繰り返し）
    Objects,
}

/// 属性スキーマの1エントリ
#[derive(Debug, Clone, Copy)]
pub struct AttrSchema {
    pub name: &'static str,
    pub shape: AttrShape,
    pub required: bool,
    /// KDLで要素を1つずつ書く場合のノード名（例: `grant` → `grants`）
    pub item: Option<&'static str>,
}

const fn scalar(name: &'static str) -> AttrSchema {
    AttrSchema {
        name,
        shape: AttrShape::Scalar,
        required: false,
        item: None,
    }
}

const fn required(name: &'static str) -> AttrSchema {
    AttrSchema {
        name,
        shape: AttrShape::Scalar,
        required: true,
        item: None,
    }
}

const fn list(name: &'static str) -> AttrSchema {
    AttrSchema {
        name,
        shape: AttrShape::List,
        required: false,
        item: None,
    }
}

const fn objects(name: &'static str, item: &'static str, required: bool) -> AttrSchema {
    AttrSchema {
        name,
        shape: AttrShape::Objects,
        required,
        item: Some(item),
    }
}

const OBJECT_STORE_ATTRS: &[AttrSchema] = &[
    scalar("bucket_name"),
    required("index_document"),
    required("error_document"),
    scalar("object_ownership"),
    scalar("block_public_access"),
    scalar("public_read"),
    list("tags"),
];

const ACCESS_POLICY_ATTRS: &[AttrSchema] = &[
    required("store"),
    objects("grants", "grant", true),
];

const CDN_DISTRIBUTION_ATTRS: &[AttrSchema] = &[
    required("origin_domain"),
    scalar("origin_id"),
    scalar("origin_access_mode"),
    required("default_root_object"),
    objects("error_responses", "error_response", false),
    list("aliases"),
    scalar("certificate_arn"),
    scalar("viewer_protocol_policy"),
    list("allowed_methods"),
    list("cached_methods"),
    scalar("default_ttl"),
    scalar("min_ttl"),
    scalar("max_ttl"),
    scalar("price_class"),
    scalar("geo_restriction"),
    scalar("enabled"),
];

const CERTIFICATE_ATTRS: &[AttrSchema] = &[
    required("domain_name"),
    scalar("validation_method"),
    scalar("region"),
    list("subject_alternative_names"),
];

const DNS_RECORD_ATTRS: &[AttrSchema] = &[
    required("zone"),
    required("name"),
    required("record_type"),
    list("records"),
    scalar("ttl"),
    scalar("alias_name"),
    scalar("alias_zone_id"),
    scalar("evaluate_target_health"),
];

const VALIDATION_RECORD_ATTRS: &[AttrSchema] = &[
    required("zone"),
    required("name"),
    required("record_type"),
    required("value"),
    scalar("ttl"),
];

/// 外部の完了待ちが必要なリソースの準備完了条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// 監視する出力名
    pub output: &'static str,
    /// 準備完了とみなす値
    pub expected: &'static str,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::ObjectStore,
        ResourceKind::AccessPolicy,
        ResourceKind::CdnDistribution,
        ResourceKind::Certificate,
        ResourceKind::DnsRecord,
        ResourceKind::ValidationRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ObjectStore => "object-store",
            ResourceKind::AccessPolicy => "access-policy",
            ResourceKind::CdnDistribution => "cdn-distribution",
            ResourceKind::Certificate => "certificate",
            ResourceKind::DnsRecord => "dns-record",
            ResourceKind::ValidationRecord => "validation-record",
        }
    }

    /// 属性スキーマ
    pub fn schema(&self) -> &'static [AttrSchema] {
        match self {
            ResourceKind::ObjectStore => OBJECT_STORE_ATTRS,
            ResourceKind::AccessPolicy => ACCESS_POLICY_ATTRS,
            ResourceKind::CdnDistribution => CDN_DISTRIBUTION_ATTRS,
            ResourceKind::Certificate => CERTIFICATE_ATTRS,
            ResourceKind::DnsRecord => DNS_RECORD_ATTRS,
            ResourceKind::ValidationRecord => VALIDATION_RECORD_ATTRS,
        }
    }

    /// プロバイダーが適用後に返す計算済み出力
    pub fn computed_outputs(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::ObjectStore => &["arn", "bucket", "regional_domain_name"],
            ResourceKind::AccessPolicy => &["policy_id"],
            ResourceKind::CdnDistribution => &[
                "distribution_id",
                "domain_name",
                "hosted_zone_id",
                "access_identity",
                "access_identity_path",
            ],
            ResourceKind::Certificate => &[
                "arn",
                "status",
                "validation_record_name",
                "validation_record_value",
                "validation_record_type",
            ],
            ResourceKind::DnsRecord | ResourceKind::ValidationRecord => &["fqdn"],
        }
    }

    /// 属性名（またはKDLの要素名）からスキーマを引く
    pub fn attribute(&self, name: &str) -> Option<&'static AttrSchema> {
        let normalized = name.replace('-', "_");
        self.schema()
            .iter()
            .find(|a| a.name == normalized || a.item == Some(normalized.as_str()))
    }

    /// 参照可能な出力かどうか（適用済み属性 + 計算済み出力）
    pub fn exposes(&self, output: &str) -> bool {
        self.computed_outputs().contains(&output) || self.schema().iter().any(|a| a.name == output)
    }

    /// 外部の完了待ち条件（証明書の発行など）
    pub fn readiness(&self) -> Option<Readiness> {
        match self {
            ResourceKind::Certificate => Some(Readiness {
                output: "status",
                expected: "ISSUED",
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = SiteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| SiteError::UnknownKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!(
            "cdn-distribution".parse::<ResourceKind>().unwrap(),
            ResourceKind::CdnDistribution
        );
        assert_eq!(
            "object_store".parse::<ResourceKind>().unwrap(),
            ResourceKind::ObjectStore
        );
        assert!("load-balancer".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_attribute_lookup_by_item_alias() {
        let schema = ResourceKind::AccessPolicy.attribute("grant").unwrap();
        assert_eq!(schema.name, "grants");
        assert_eq!(schema.shape, AttrShape::Objects);

        let schema = ResourceKind::CdnDistribution
            .attribute("default-root-object")
            .unwrap();
        assert_eq!(schema.name, "default_root_object");
    }

    #[test]
    fn test_exposes_attributes_and_computed_outputs() {
        assert!(ResourceKind::ObjectStore.exposes("arn"));
        assert!(ResourceKind::ObjectStore.exposes("error_document"));
        assert!(!ResourceKind::ObjectStore.exposes("access_identity"));
        assert!(ResourceKind::CdnDistribution.exposes("access_identity"));
    }

    #[test]
    fn test_only_certificates_wait_for_readiness() {
        assert!(ResourceKind::Certificate.readiness().is_some());
        assert!(ResourceKind::DnsRecord.readiness().is_none());
    }
}
