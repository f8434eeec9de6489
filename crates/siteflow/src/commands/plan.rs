use crate::utils::{self, LoadedSite};
use colored::Colorize;

pub async fn handle(site: &LoadedSite, json: bool) -> anyhow::Result<i32> {
    let deployer = utils::deployer(site, None).await?;
    let plan = deployer.plan(&site.spec).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    println!("{}", format!("計画: {}", site.spec.name).bold());
    println!();
    utils::print_plan(&plan);
    if !plan.has_changes {
        println!("{}", "✓ 変更はありません".green());
    }
    Ok(0)
}
