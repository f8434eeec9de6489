//! エンジン設定
//!
//! `.siteflow/settings.yaml` を既定値に重ね、さらに環境変数で上書きします。

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// 設定ファイルの相対パス
pub const SETTINGS_FILE: &str = ".siteflow/settings.yaml";

/// エンジン設定（秒単位）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 同時実行する操作の上限
    pub max_parallel: usize,

    /// 一時的エラーの最大試行回数
    pub retry_max_attempts: u32,

    /// 初回リトライまでの待ち時間（ミリ秒）
    pub retry_initial_delay_ms: u64,

    /// リトライ待ち時間の上限（ミリ秒）
    pub retry_max_delay_ms: u64,

    /// 証明書発行などのポーリング間隔
    pub validation_interval_secs: u64,

    /// ポーリングのタイムアウト
    pub validation_timeout_secs: u64,

    /// apply全体のタイムアウト
    pub plan_timeout_secs: u64,

    /// 既定のリージョン
    pub region: Option<String>,

    /// 認証プロファイル名
    pub profile: Option<String>,

    /// 作成するリソースに付けるタグ
    pub tags: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            validation_interval_secs: 10,
            validation_timeout_secs: 45 * 60,
            plan_timeout_secs: 60 * 60,
            region: None,
            profile: None,
            tags: BTreeMap::new(),
        }
    }
}

/// プロジェクトの設定を読み込む
///
/// 優先順位: 環境変数 > `.siteflow/settings.yaml` > 既定値
pub fn load_settings(project_root: &Path) -> Result<Settings> {
    let path = project_root.join(SETTINGS_FILE);
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidSettings {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
    } else {
        Settings::default()
    };

    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
    if let Some(value) = env_parsed("SITEFLOW_MAX_PARALLEL")? {
        settings.max_parallel = value;
    }
    if let Some(value) = env_parsed("SITEFLOW_PLAN_TIMEOUT_SECS")? {
        settings.plan_timeout_secs = value;
    }
    if let Ok(region) = std::env::var("SITEFLOW_REGION") {
        settings.region = Some(region);
    }
    if let Ok(profile) = std::env::var("SITEFLOW_PROFILE") {
        settings.profile = Some(profile);
    }
    Ok(())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        unsafe {
            std::env::remove_var("SITEFLOW_MAX_PARALLEL");
            std::env::remove_var("SITEFLOW_PLAN_TIMEOUT_SECS");
            std::env::remove_var("SITEFLOW_REGION");
            std::env::remove_var("SITEFLOW_PROFILE");
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();

        let settings = load_settings(temp_dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_parallel, 4);
        assert_eq!(settings.validation_timeout_secs, 2700);
    }

    #[test]
    #[serial]
    fn test_file_merges_over_defaults() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir(temp_dir.path().join(".siteflow")).unwrap();
        fs::write(
            temp_dir.path().join(SETTINGS_FILE),
            "max_parallel: 2\nregion: ap-northeast-1\ntags:\n  project: docs\n",
        )
        .unwrap();

        let settings = load_settings(temp_dir.path()).unwrap();
        assert_eq!(settings.max_parallel, 2);
        assert_eq!(settings.region.as_deref(), Some("ap-northeast-1"));
        assert_eq!(settings.tags["project"], "docs");
        // 未指定の項目は既定値
        assert_eq!(settings.plan_timeout_secs, 3600);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir(temp_dir.path().join(".siteflow")).unwrap();
        fs::write(temp_dir.path().join(SETTINGS_FILE), "max_parallel: 2\n").unwrap();

        unsafe {
            std::env::set_var("SITEFLOW_MAX_PARALLEL", "8");
            std::env::set_var("SITEFLOW_PROFILE", "deploy");
        }
        let settings = load_settings(temp_dir.path()).unwrap();
        clear_env();

        assert_eq!(settings.max_parallel, 8);
        assert_eq!(settings.profile.as_deref(), Some("deploy"));
    }

    #[test]
    #[serial]
    fn test_invalid_env_value() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("SITEFLOW_PLAN_TIMEOUT_SECS", "soon");
        }
        let result = load_settings(temp_dir.path());
        clear_env();

        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    #[serial]
    fn test_invalid_yaml() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir(temp_dir.path().join(".siteflow")).unwrap();
        fs::write(temp_dir.path().join(SETTINGS_FILE), "max_parallel: [").unwrap();

        assert!(matches!(
            load_settings(temp_dir.path()),
            Err(ConfigError::InvalidSettings { .. })
        ));
    }
}
