use crate::ProviderKind;
use crate::utils::{self, LoadedSite};
use colored::Colorize;

pub async fn handle(site: &LoadedSite, provider: ProviderKind, yes: bool) -> anyhow::Result<i32> {
    let deployer = utils::deployer(site, Some(provider)).await?;
    let plan = deployer.plan(&site.spec).await?;

    println!("{}", format!("適用: {}", site.spec.name).bold());
    println!();
    utils::print_plan(&plan);

    if !plan.has_changes {
        println!("{}", "✓ 変更はありません".green());
    }

    if !yes {
        println!();
        println!("{}", "⚠ 上記の変更が適用されます".yellow());
        println!("実行するには --yes オプションを指定してください");
        return Ok(0);
    }

    let cancel = utils::cancel_on_ctrl_c();
    let report = deployer.apply(&site.spec, &cancel).await?;
    Ok(utils::print_report(&report))
}
