use crate::ProviderKind;
use crate::utils::{self, LoadedSite};
use colored::Colorize;

pub async fn handle(site: &LoadedSite, provider: ProviderKind, yes: bool) -> anyhow::Result<i32> {
    let deployer = utils::deployer(site, Some(provider)).await?;
    let plan = deployer.plan_destroy(&site.spec).await?;

    if !plan.has_changes {
        println!("{}", "削除するリソースはありません".dimmed());
        return Ok(0);
    }

    println!("{}", format!("削除: {}", site.spec.name).red().bold());
    println!();
    utils::print_plan(&plan);

    if !yes {
        println!();
        println!("{}", "⚠ 上記のリソースがすべて削除されます".yellow());
        println!("実行するには --yes オプションを指定してください");
        return Ok(0);
    }

    let cancel = utils::cancel_on_ctrl_c();
    let report = deployer.destroy(&site.spec, &cancel).await?;
    Ok(utils::print_report(&report))
}
