//! SiteFlow Core
//!
//! 静的サイト配信スタック（オリジンストレージ、CDN、証明書、DNS）の
//! desired specモデル、KDLパーサー、リソース依存グラフを提供します。

pub mod error;
pub mod graph;
pub mod model;
pub mod parser;
pub mod template;

pub use error::{Result, SiteError};
pub use graph::{Edge, ResourceGraph, ResourceNode};
pub use model::*;
pub use parser::{parse_kdl_file, parse_kdl_string};
