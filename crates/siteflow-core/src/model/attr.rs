//! 属性値と参照
//!
//! 属性値はリテラルか、他リソースの出力への参照 `${node.output}` を含む値です。
//! 参照はグラフ構築時には解決されず、上流リソースの出力が
//! StateStoreに書き込まれた後、必要になった時点で解決されます。

use crate::error::{Result, SiteError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 他リソースの出力への参照
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub node: String,
    pub output: String,
}

impl Reference {
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }

    /// `node.output` 形式の式をパース
    fn parse_expr(expr: &str) -> Result<Self> {
        let (node, output) = expr
            .trim()
            .split_once('.')
            .ok_or_else(|| SiteError::InvalidReference(format!("${{{expr}}}")))?;
        if node.is_empty() || output.is_empty() || output.contains('.') {
            return Err(SiteError::InvalidReference(format!("${{{expr}}}")));
        }
        Ok(Self::new(node, output))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.node, self.output)
    }
}

/// 文字列補間の構成要素
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

/// 属性値
///
/// JSON値との相互変換で `${...}` を含む文字列は参照として扱われます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum AttrValue {
    /// 参照を含まない値
    Literal(Value),
    /// 文字列全体が1つの参照（参照先の値の型をそのまま引き継ぐ）
    Reference(Reference),
    /// 参照を含む文字列（例: `/${bucket.error_document}`）
    Interpolated(Vec<Segment>),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        AttrValue::Literal(value.into())
    }

    /// JSON値から属性値を構築（文字列中の参照を検出）
    pub fn from_json(value: Value) -> Result<Self> {
        let parsed = match value {
            Value::String(s) => Self::parse_str(&s)?,
            Value::Array(items) => {
                let items = items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>>>()?;
                if items.iter().all(|v| matches!(v, AttrValue::Literal(_))) {
                    AttrValue::Literal(Value::Array(
                        items.into_iter().map(AttrValue::into_json).collect(),
                    ))
                } else {
                    AttrValue::List(items)
                }
            }
            Value::Object(map) => {
                let entries = map
                    .into_iter()
                    .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                if entries.values().all(|v| matches!(v, AttrValue::Literal(_))) {
                    AttrValue::Literal(Value::Object(
                        entries.into_iter().map(|(k, v)| (k, v.into_json())).collect(),
                    ))
                } else {
                    AttrValue::Map(entries)
                }
            }
            other => AttrValue::Literal(other),
        };
        Ok(parsed)
    }

    fn parse_str(s: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = s;

        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| SiteError::InvalidReference(s.to_string()))?;
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            segments.push(Segment::Ref(Reference::parse_expr(&after[..end])?));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(match segments.as_slice() {
            [] => AttrValue::Literal(Value::String(String::new())),
            [Segment::Text(text)] => AttrValue::Literal(Value::String(text.clone())),
            [Segment::Ref(reference)] => AttrValue::Reference(reference.clone()),
            _ => AttrValue::Interpolated(segments),
        })
    }

    /// 含まれるすべての参照
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a Reference>) {
        match self {
            AttrValue::Literal(_) => {}
            AttrValue::Reference(r) => refs.push(r),
            AttrValue::Interpolated(segments) => {
                for segment in segments {
                    if let Segment::Ref(r) = segment {
                        refs.push(r);
                    }
                }
            }
            AttrValue::List(items) => items.iter().for_each(|v| v.collect_references(refs)),
            AttrValue::Map(map) => map.values().for_each(|v| v.collect_references(refs)),
        }
    }

    /// 参照を解決して具体的なJSON値を得る
    ///
    /// 解決できない参照があった場合はその参照を `Err` で返します。
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<Value, Reference>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            AttrValue::Literal(v) => Ok(v.clone()),
            AttrValue::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            AttrValue::Interpolated(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Ref(r) => match lookup(r).ok_or_else(|| r.clone())? {
                            Value::String(s) => out.push_str(&s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
            AttrValue::List(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            AttrValue::Map(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
                .collect::<std::result::Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
        }
    }

    /// 参照を `${...}` 文字列に戻したJSON表現
    pub fn into_json(self) -> Value {
        match self {
            AttrValue::Literal(v) => v,
            AttrValue::Reference(r) => Value::String(r.to_string()),
            AttrValue::Interpolated(segments) => Value::String(
                segments
                    .into_iter()
                    .map(|s| match s {
                        Segment::Text(text) => text,
                        Segment::Ref(r) => r.to_string(),
                    })
                    .collect(),
            ),
            AttrValue::List(items) => {
                Value::Array(items.into_iter().map(AttrValue::into_json).collect())
            }
            AttrValue::Map(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, v.into_json())).collect())
            }
        }
    }
}

impl TryFrom<Value> for AttrValue {
    type Error = SiteError;

    fn try_from(value: Value) -> Result<Self> {
        AttrValue::from_json(value)
    }
}

impl From<AttrValue> for Value {
    fn from(value: AttrValue) -> Self {
        value.into_json()
    }
}

/// 属性名 → 属性値
pub type Attributes = BTreeMap<String, AttrValue>;

/// 解決済み属性（プロバイダーに渡す形）
pub type ResolvedAttributes = BTreeMap<String, Value>;

/// すべての属性を解決
pub fn resolve_attributes<F>(
    attributes: &Attributes,
    lookup: &F,
) -> std::result::Result<ResolvedAttributes, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    attributes
        .iter()
        .map(|(name, value)| Ok((name.clone(), value.resolve(lookup)?)))
        .collect()
}
