use crate::ProviderKind;
use crate::utils::{self, LoadedSite};
use colored::Colorize;
use siteflow_cloud::DriftKind;

pub async fn handle(site: &LoadedSite, provider: ProviderKind) -> anyhow::Result<i32> {
    let deployer = utils::deployer(site, Some(provider)).await?;
    let report = deployer.drift(&site.spec).await?;

    if !report.has_drift() {
        println!("{}", "✓ 差分はありません".green());
        return Ok(0);
    }

    println!("{}", "差分が見つかりました:".yellow().bold());
    for entry in &report.entries {
        match &entry.kind {
            DriftKind::Missing => {
                println!("  {} {} 実リソースが存在しません", "✗".red(), entry.node_id.cyan());
            }
            DriftKind::Orphaned => {
                println!("  {} {} 定義から削除されています", "-".red(), entry.node_id.cyan());
            }
            DriftKind::Changed {
                output,
                recorded,
                observed,
            } => {
                let observed = observed
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "(なし)".to_string());
                println!(
                    "  {} {}.{}: {} → {}",
                    "~".yellow(),
                    entry.node_id.cyan(),
                    output,
                    recorded.to_string().dimmed(),
                    observed
                );
            }
        }
    }
    Ok(2)
}
