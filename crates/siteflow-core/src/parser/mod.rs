//! KDLパーサー
//!
//! SiteFlowのdesired spec（site.kdl）をパースします。
//! 各ノードタイプのパース処理はモジュールに分離されています。

mod resource;

pub use resource::parse_resource;

use crate::error::{Result, SiteError};
use crate::model::DesiredSpec;
use crate::template::{TemplateProcessor, Variables, has_template_syntax};
use kdl::KdlDocument;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// KDLファイルをパースしてDesiredSpecを生成
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<DesiredSpec> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| SiteError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let name = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    parse_kdl_string(&content, name)
}

/// KDL文字列をパース
///
/// `variables` ブロックがあれば、その値と `SITE_*` 環境変数で
/// `{{ ... }}` を展開してから再パースします。
pub fn parse_kdl_string(content: &str, default_name: String) -> Result<DesiredSpec> {
    let doc: KdlDocument = content.parse()?;

    if has_template_syntax(content) {
        let mut processor = TemplateProcessor::new();
        processor.add_env_variables();
        processor.add_variables(extract_variables(&doc));
        let rendered = processor.render_str(content)?;
        let doc: KdlDocument = rendered.parse()?;
        return build_spec(&doc, default_name);
    }

    build_spec(&doc, default_name)
}

fn build_spec(doc: &KdlDocument, default_name: String) -> Result<DesiredSpec> {
    let mut spec = DesiredSpec::new(default_name);

    for node in doc.nodes() {
        match node.name().value() {
            "site" => {
                if let Some(name) = node.entries().first().and_then(|e| e.value().as_string()) {
                    spec.name = name.to_string();
                }
            }
            "resource" => {
                let (id, decl) = parse_resource(node)?;
                if spec.get(&id).is_some() {
                    return Err(SiteError::InvalidConfig(format!(
                        "リソース '{id}' が重複して定義されています"
                    )));
                }
                spec.insert(id, decl);
            }
            "variables" => {
                // テンプレート展開で使用済み
            }
            other => {
                warn!(node = %other, "Unknown top-level node ignored");
            }
        }
    }

    debug!(site = %spec.name, resources = spec.len(), "Parsed desired spec");
    Ok(spec)
}

/// variables ブロックから変数を抽出
fn extract_variables(doc: &KdlDocument) -> Variables {
    let mut variables = Variables::new();
    for node in doc.nodes().iter().filter(|n| n.name().value() == "variables") {
        if let Some(children) = node.children() {
            for var in children.nodes() {
                let key = var.name().value().to_string();
                let value = var
                    .entries()
                    .first()
                    .and_then(|e| e.value().as_string())
                    .unwrap_or("")
                    .to_string();
                variables.insert(key, serde_json::Value::String(value));
            }
        }
    }
    variables
}

#[cfg(test)]
mod tests;
