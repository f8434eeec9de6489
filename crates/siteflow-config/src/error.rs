use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "サイト定義ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: site.kdl, site.local.kdl, .site.kdl, .site.local.kdl\n\
        - ./.siteflow/ ディレクトリ\n\
        - ~/.config/siteflow/site.kdl\n\
        または SITE_CONFIG_PATH 環境変数で直接指定できます"
    )]
    SiteFileNotFound,

    #[error("設定ファイルの解析に失敗しました ({path}): {message}")]
    InvalidSettings { path: String, message: String },

    #[error("環境変数 {name} の値が不正です: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
