use crate::utils::LoadedSite;
use colored::Colorize;
use siteflow_cloud::{FileStateStore, StateStore};

pub async fn handle(site: &LoadedSite, json: bool) -> anyhow::Result<i32> {
    let store = FileStateStore::new(&site.project_root);
    let snapshot = store.snapshot().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(0);
    }

    if snapshot.is_empty() {
        println!("{}", "記録済みのリソースはありません".dimmed());
        return Ok(0);
    }

    println!(
        "{} (version {})",
        store.state_path().display().to_string().bold(),
        snapshot.version
    );
    for (id, record) in &snapshot.resources {
        println!(
            "  • {} ({}) [{}] v{}",
            id.cyan(),
            record.kind,
            record.status,
            record.version
        );
        for (name, value) in &record.outputs {
            println!("      {}: {}", name, value.to_string().dimmed());
        }
    }
    Ok(0)
}
