use crate::utils::LoadedSite;
use colored::Colorize;
use siteflow_core::ResourceGraph;

pub fn handle(site: &LoadedSite) -> anyhow::Result<i32> {
    println!("{}", "サイト定義を検証中...".blue());
    println!("  ファイル: {}", site.file.display().to_string().cyan());

    let graph = match ResourceGraph::build(&site.spec) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            return Ok(1);
        }
    };

    println!();
    println!("{} {}", "サイト:".bold(), site.spec.name.cyan());
    for id in graph.topological_order() {
        let Some(node) = graph.node(&id) else {
            continue;
        };
        let deps = graph.dependencies_in_order(&id);
        if deps.is_empty() {
            println!("  • {} ({})", id.cyan(), node.kind);
        } else {
            println!(
                "  • {} ({}) ← {}",
                id.cyan(),
                node.kind,
                deps.join(", ").dimmed()
            );
        }
    }

    println!();
    println!("{}", "✓ サイト定義は有効です".green().bold());
    Ok(0)
}
