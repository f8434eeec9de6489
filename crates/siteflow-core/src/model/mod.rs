//! モデル定義
//!
//! 望ましい状態（desired spec）を表すデータモデルを定義します。
//! 各モデルは機能ごとにモジュールに分離されています。

mod attr;
mod kind;

// Re-exports
pub use attr::*;
pub use kind::*;

use crate::error::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 宣言された1つのリソース
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// リソース種別
    #[serde(rename = "type", alias = "kind")]
    pub kind: ResourceKind,

    /// 属性（リテラルまたは参照）
    #[serde(default)]
    pub attributes: Attributes,

    /// 明示的な依存先
    #[serde(default, rename = "dependsOn", alias = "depends_on")]
    pub depends_on: Vec<String>,
}

impl ResourceDecl {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    /// JSON値から属性を設定（`${...}` は参照として扱う）
    pub fn try_attr(mut self, name: impl Into<String>, value: Value) -> Result<Self> {
        self.attributes
            .insert(name.into(), AttrValue::from_json(value)?);
        Ok(self)
    }

    pub fn depends_on(mut self, node: impl Into<String>) -> Self {
        self.depends_on.push(node.into());
        self
    }
}

/// 望ましい状態の定義
///
/// リソースは宣言順を保持します（トポロジカル順序のタイブレークに使用）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredSpec {
    /// サイト名
    #[serde(default)]
    pub name: String,

    /// ノードID → 宣言
    #[serde(default)]
    pub resources: IndexMap<String, ResourceDecl>,
}

impl DesiredSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: IndexMap::new(),
        }
    }

    /// `{ id: {type, attributes, dependsOn?} }` 形式のJSON値から構築
    pub fn from_value(name: impl Into<String>, value: Value) -> Result<Self> {
        let resources: IndexMap<String, ResourceDecl> = serde_json::from_value(value)?;
        Ok(Self {
            name: name.into(),
            resources,
        })
    }

    /// `{ id: {type, attributes, dependsOn?} }` 形式のJSON文字列から構築
    pub fn from_json_str(name: impl Into<String>, content: &str) -> Result<Self> {
        let resources: IndexMap<String, ResourceDecl> = serde_json::from_str(content)?;
        Ok(Self {
            name: name.into(),
            resources,
        })
    }

    pub fn insert(&mut self, id: impl Into<String>, decl: ResourceDecl) {
        self.resources.insert(id.into(), decl);
    }

    pub fn with_resource(mut self, id: impl Into<String>, decl: ResourceDecl) -> Self {
        self.insert(id, decl);
        self
    }

    /// 宣言を削除（宣言順は維持）
    pub fn remove(&mut self, id: &str) -> Option<ResourceDecl> {
        self.resources.shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceDecl> {
        self.resources.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ResourceDecl> {
        self.resources.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
