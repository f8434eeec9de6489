use crate::ProviderKind;
use anyhow::Context;
use colored::Colorize;
use siteflow_cloud::{
    ApplyReport, CancellationToken, Deployer, EngineConfig, FileStateStore, OperationKind,
    Outcome, Plan, ProviderContext, RetryConfig, SimulatedProvider, StateStore,
};
use siteflow_config::Settings;
use siteflow_core::DesiredSpec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// 読み込んだサイト定義
pub struct LoadedSite {
    pub file: PathBuf,
    pub project_root: PathBuf,
    pub spec: DesiredSpec,
    pub settings: Settings,
}

/// サイト定義と設定を読み込む
pub fn load_site(file: Option<&Path>) -> anyhow::Result<LoadedSite> {
    let file = match file {
        Some(path) => path.to_path_buf(),
        None => siteflow_config::find_site_file()?,
    };

    let mut project_root = siteflow_config::project_root(&file);
    if project_root.as_os_str().is_empty() {
        project_root = PathBuf::from(".");
    }

    let spec = siteflow_core::parse_kdl_file(&file)
        .with_context(|| format!("{} の読み込みに失敗しました", file.display()))?;
    let settings = siteflow_config::load_settings(&project_root)?;

    tracing::debug!(file = %file.display(), resources = spec.len(), "Loaded site");
    Ok(LoadedSite {
        file,
        project_root,
        spec,
        settings,
    })
}

/// 設定からエンジン設定を組み立てる
pub fn engine_config(settings: &Settings) -> EngineConfig {
    EngineConfig::default()
        .with_max_parallel(settings.max_parallel)
        .with_retry(RetryConfig {
            max_attempts: settings.retry_max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.retry_initial_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            ..Default::default()
        })
        .with_validation(
            Duration::from_secs(settings.validation_interval_secs),
            Duration::from_secs(settings.validation_timeout_secs),
        )
        .with_plan_timeout(Duration::from_secs(settings.plan_timeout_secs))
}

/// プロバイダー呼び出しのコンテキスト
pub fn provider_context(settings: &Settings) -> ProviderContext {
    let mut ctx = ProviderContext::new();
    if let Some(region) = &settings.region {
        ctx = ctx.with_region(region);
    }
    if let Some(profile) = &settings.profile {
        ctx = ctx.with_profile(profile);
    }
    for (key, value) in &settings.tags {
        ctx = ctx.with_tag(key, value);
    }
    ctx
}

/// 状態ファイルとプロバイダーを結び付けたDeployerを作成
pub async fn deployer(site: &LoadedSite, provider: Option<ProviderKind>) -> anyhow::Result<Deployer> {
    let store = Arc::new(FileStateStore::new(&site.project_root));
    let provider = match provider.unwrap_or(ProviderKind::Simulated) {
        ProviderKind::Simulated => {
            let snapshot = store.snapshot().await?;
            Arc::new(SimulatedProvider::from_snapshot(&snapshot))
        }
    };

    Ok(Deployer::new(
        provider,
        store,
        provider_context(&site.settings),
        engine_config(&site.settings),
    ))
}

/// Ctrl-C でキャンセルされるトークン
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "中断しています（実行中の操作は完了を待ちます）...".yellow());
            trigger.cancel();
        }
    });
    cancel
}

/// 計画を表示
pub fn print_plan(plan: &Plan) {
    for op in &plan.operations {
        let (symbol, label) = match op.kind {
            OperationKind::Create => ("+".green(), op.node_id.green()),
            OperationKind::Update => ("~".yellow(), op.node_id.yellow()),
            OperationKind::Delete => ("-".red(), op.node_id.red()),
            OperationKind::NoOp => (" ".normal(), op.node_id.dimmed()),
        };
        println!("  {} {} ({})", symbol, label, op.resource_kind);

        if op.kind == OperationKind::Delete {
            continue;
        }
        for change in &op.diff {
            let before = change
                .before
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
            let after = change
                .after
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "(削除)".to_string());
            if change.before.is_some() {
                println!("      {}: {} → {}", change.name, before.dimmed(), after);
            } else {
                println!("      {}: {}", change.name, after);
            }
        }
    }
    println!();
    println!("{}", plan.summary().to_string().bold());
}

/// 適用結果を表示し、終了コードを返す
pub fn print_report(report: &ApplyReport) -> i32 {
    println!();
    for result in &report.applied {
        println!("  ✓ {} {}", result.node_id.cyan(), result.message);
    }
    for result in &report.failed {
        println!(
            "  ✗ {} {}",
            result.node_id.red(),
            result.error.as_deref().unwrap_or_default()
        );
    }
    for node in &report.cancelled {
        println!("  - {} {}", node.yellow(), "未実行".dimmed());
    }
    for violation in &report.invariant_violations {
        println!("  ! {}", violation.to_string().red());
    }
    if report.timed_out {
        println!("{}", "タイムアウトしました".red());
    }

    println!();
    println!(
        "適用: {}  変更なし: {}  失敗: {}  未実行: {}  ({} ms)",
        report.applied.len(),
        report.unchanged.len(),
        report.failed.len(),
        report.cancelled.len(),
        report.duration_ms
    );

    match report.outcome() {
        Outcome::Success => {
            println!("{}", "✓ 完了しました".green().bold());
            0
        }
        Outcome::PartialFailure => {
            println!("{}", "✗ 一部の操作が失敗しました".red().bold());
            2
        }
        Outcome::InvariantFailure => {
            println!("{}", "✗ セキュリティ検証に失敗しました".red().bold());
            3
        }
    }
}
