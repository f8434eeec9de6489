//! resource ノードのパース

use crate::error::{Result, SiteError};
use crate::model::{AttrShape, AttrValue, ResourceDecl, ResourceKind};
use kdl::{KdlEntry, KdlNode, KdlValue};
use serde_json::{Map, Value};

/// resource ノードをパース
///
/// ```kdl
/// resource "bucket" kind="object-store" {
///     index_document "index.html"
///     error_document "error.html"
/// }
/// ```
pub fn parse_resource(node: &KdlNode) -> Result<(String, ResourceDecl)> {
    let id = arguments(node)
        .first()
        .and_then(|v| v.as_string())
        .ok_or_else(|| SiteError::InvalidConfig("resource requires an id".to_string()))?
        .to_string();

    let kind_name = node
        .get("kind")
        .or_else(|| node.get("type"))
        .and_then(|v| v.as_string())
        .ok_or_else(|| {
            SiteError::InvalidConfig(format!("resource '{id}' requires kind=\"...\""))
        })?;
    let kind: ResourceKind = kind_name.parse()?;

    let mut decl = ResourceDecl::new(kind);
    let mut raw: Map<String, Value> = Map::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value();
            if matches!(name, "depends_on" | "depends-on" | "depends") {
                decl.depends_on.extend(
                    arguments(child)
                        .iter()
                        .filter_map(|v| v.as_string().map(|s| s.to_string())),
                );
                continue;
            }

            let schema = kind
                .attribute(name)
                .ok_or_else(|| SiteError::UnknownAttribute {
                    node: id.clone(),
                    kind: kind.to_string(),
                    attribute: name.to_string(),
                })?;

            match schema.shape {
                AttrShape::Scalar => {
                    raw.insert(schema.name.to_string(), node_value(child));
                }
                AttrShape::List => {
                    let items: Vec<Value> = arguments(child).iter().map(|v| to_json(v)).collect();
                    raw.insert(schema.name.to_string(), Value::Array(items));
                }
                AttrShape::Objects => {
                    let entry = raw
                        .entry(schema.name.to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = entry {
                        items.push(Value::Object(properties(child)));
                    }
                }
            }
        }
    }

    for (name, value) in raw {
        decl.attributes.insert(name, AttrValue::from_json(value)?);
    }

    Ok((id, decl))
}

/// 子ノードの値: 引数1つならスカラー、複数ならリスト、プロパティのみならオブジェクト
fn node_value(node: &KdlNode) -> Value {
    let args = arguments(node);
    match args.as_slice() {
        [] => Value::Object(properties(node)),
        [single] => to_json(single),
        many => Value::Array(many.iter().map(|v| to_json(v)).collect()),
    }
}

fn arguments(node: &KdlNode) -> Vec<&KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(KdlEntry::value)
        .collect()
}

fn properties(node: &KdlNode) -> Map<String, Value> {
    node.entries()
        .iter()
        .filter_map(|e| {
            e.name()
                .map(|name| (name.value().replace('-', "_"), to_json(e.value())))
        })
        .collect()
}

fn to_json(value: &KdlValue) -> Value {
    if let Some(s) = value.as_string() {
        Value::String(s.to_string())
    } else if let Some(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string()))
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else {
        Value::Null
    }
}
