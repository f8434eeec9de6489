//! SiteFlow 設定
//!
//! サイト定義ファイル（KDL）の探索と、エンジン設定の読み込みを行います。

pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{SETTINGS_FILE, Settings, load_settings};

use std::path::{Path, PathBuf};

/// SiteFlowのグローバル設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("siteflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// サイト定義ファイル名（優先順）
pub const SITE_FILE_CANDIDATES: [&str; 4] =
    ["site.local.kdl", ".site.local.kdl", "site.kdl", ".site.kdl"];

/// プロジェクトのsite.kdlファイルを探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 SITE_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: site.local.kdl, .site.local.kdl, site.kdl, .site.kdl
/// 3. ./.siteflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/siteflow/site.kdl (グローバル設定)
pub fn find_site_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("SITE_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    if let Some(path) = find_in(&current_dir) {
        return Ok(path);
    }

    let site_dir = current_dir.join(".siteflow");
    if site_dir.is_dir()
        && let Some(path) = find_in(&site_dir)
    {
        return Ok(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("siteflow").join("site.kdl");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::SiteFileNotFound)
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    SITE_FILE_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// サイト定義ファイルに対応するプロジェクトルート
///
/// `.siteflow/` 内のファイルならその親ディレクトリ。状態ファイルと
/// `settings.yaml` はこのルートの `.siteflow/` に置かれます。
pub fn project_root(site_file: &Path) -> PathBuf {
    let dir = site_file.parent().unwrap_or(Path::new("."));
    if dir.file_name().is_some_and(|name| name == ".siteflow") {
        dir.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        dir.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_get_config_dir() {
        let result = get_config_dir();
        assert!(result.is_ok());

        let config_dir = result.unwrap();
        assert!(config_dir.ends_with("siteflow"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_find_site_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        // site.kdlを作成
        fs::write(temp_dir.path().join("site.kdl"), "// test").unwrap();

        // テンポラリディレクトリに移動
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_site_file();
        assert!(result.is_ok());

        let site_file = result.unwrap();
        assert!(site_file.ends_with("site.kdl"));

        // 元のディレクトリに戻る
        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_site_file_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        // site.kdl と site.local.kdl の両方を作成
        fs::write(temp_dir.path().join("site.kdl"), "// global").unwrap();
        fs::write(temp_dir.path().join("site.local.kdl"), "// local").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_site_file().unwrap();

        // site.local.kdl が優先される
        assert!(result.ends_with("site.local.kdl"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_site_file_in_site_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        // .siteflow/ ディレクトリを作成
        let site_dir = temp_dir.path().join(".siteflow");
        fs::create_dir(&site_dir).unwrap();
        fs::write(site_dir.join("site.kdl"), "// in .siteflow").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_site_file().unwrap();
        assert!(result.ends_with(".siteflow/site.kdl"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_site_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.kdl");
        fs::write(&config_path, "// custom").unwrap();

        // 環境変数を設定
        unsafe {
            std::env::set_var("SITE_CONFIG_PATH", config_path.to_str().unwrap());
        }

        let result = find_site_file().unwrap();
        assert_eq!(result, config_path);

        // クリーンアップ
        unsafe {
            std::env::remove_var("SITE_CONFIG_PATH");
        }
    }

    #[test]
    #[serial]
    fn test_find_site_file_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        // 空のディレクトリに移動
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_site_file();
        assert!(result.is_err());

        if let Err(ConfigError::SiteFileNotFound) = result {
            // 期待通りのエラー
        } else {
            panic!("Expected SiteFileNotFound error");
        }

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_hidden_file_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        // .site.local.kdl と site.kdl を作成
        fs::write(temp_dir.path().join(".site.local.kdl"), "// hidden local").unwrap();
        fs::write(temp_dir.path().join("site.kdl"), "// visible").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_site_file().unwrap();

        // .site.local.kdl が優先される
        assert!(result.ends_with(".site.local.kdl"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    fn test_project_root() {
        assert_eq!(
            project_root(Path::new("/srv/docs/site.kdl")),
            PathBuf::from("/srv/docs")
        );
        assert_eq!(
            project_root(Path::new("/srv/docs/.siteflow/site.local.kdl")),
            PathBuf::from("/srv/docs")
        );
        assert_eq!(project_root(Path::new("site.kdl")), PathBuf::from(""));
    }
}
