use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiteError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("未知のリソース種別です: {0}")]
    UnknownKind(String),

    #[error("リソース '{node}' ({kind}) に未知の属性 '{attribute}' が指定されています")]
    UnknownAttribute {
        node: String,
        kind: String,
        attribute: String,
    },

    #[error("リソース '{node}' ({kind}) に必須属性 '{attribute}' がありません")]
    MissingAttribute {
        node: String,
        kind: String,
        attribute: String,
    },

    #[error("リソース '{node}' の依存先 '{dependency}' が宣言されていません")]
    UnknownDependency { node: String, dependency: String },

    #[error("リソース '{node}' が参照する '{target}.{output}' は存在しない出力です")]
    UnknownOutput {
        node: String,
        target: String,
        output: String,
    },

    #[error("テンプレート展開エラー: {0}")]
    TemplateRenderError(String),

    #[error("不正な参照式です: {0}")]
    InvalidReference(String),

    #[error("循環依存が検出されました: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

impl SiteError {
    /// 循環依存エラーの場合、循環に含まれるノードを返す
    pub fn cycle_nodes(&self) -> Option<&[String]> {
        match self {
            SiteError::Cycle(nodes) => Some(nodes),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SiteError>;
