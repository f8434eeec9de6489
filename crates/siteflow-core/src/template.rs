//! テンプレート展開機能
//!
//! Teraを使用してKDLファイルのテンプレート展開を行います。
//! `{{ domain }}` のような変数は `variables` ブロックと環境変数から解決されます。
//! リソース参照 `${node.output}` はテンプレートでは扱いません。

use crate::error::{Result, SiteError};
use std::collections::HashMap;
use tera::{Context, Tera};
use tracing::debug;

/// 変数コンテキスト
pub type Variables = HashMap<String, serde_json::Value>;

/// テンプレートプロセッサ
pub struct TemplateProcessor {
    context: Context,
}

impl TemplateProcessor {
    /// 新しいテンプレートプロセッサを作成
    pub fn new() -> Self {
        Self {
            context: Context::new(),
        }
    }

    /// 変数を追加
    pub fn add_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.insert(key.into(), &value);
    }

    /// 複数の変数を追加
    pub fn add_variables(&mut self, variables: Variables) {
        for (key, value) in variables {
            self.context.insert(key, &value);
        }
    }

    /// 環境変数を追加（SITE_* のみ）
    pub fn add_env_variables(&mut self) {
        for (key, value) in std::env::vars() {
            if key.starts_with("SITE_") {
                debug!(key = %key, "Adding environment variable");
                self.context.insert(key, &serde_json::Value::String(value));
            }
        }
    }

    /// 文字列をレンダリング
    pub fn render_str(&self, content: &str) -> Result<String> {
        Tera::one_off(content, &self.context, false)
            .map_err(|e| SiteError::TemplateRenderError(format!("{e:?}")))
    }
}

impl Default for TemplateProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// テンプレート構文を含むかどうか
pub fn has_template_syntax(content: &str) -> bool {
    content.contains("{{") || content.contains("{%")
}
