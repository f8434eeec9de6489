mod commands;
mod utils;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "site")]
#[command(about = "静的サイトの配信スタックを宣言的にデプロイ", long_about = None)]
struct Cli {
    /// サイト定義ファイル（省略時は site.kdl を探索）
    #[arg(short, long, global = true, env = "SITE_CONFIG_PATH")]
    file: Option<PathBuf>,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// 使用するプロバイダー
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProviderKind {
    /// メモリ上でリソースを模擬（状態ファイルから復元）
    Simulated,
}

#[derive(Subcommand)]
enum Commands {
    /// サイト定義を検証
    Validate,
    /// 変更計画を表示
    Plan {
        /// JSONで出力
        #[arg(long)]
        json: bool,
    },
    /// 変更を適用
    Apply {
        /// プロバイダー
        #[arg(short, long, value_enum, default_value = "simulated")]
        provider: ProviderKind,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 記録済みのリソースをすべて削除
    Destroy {
        /// プロバイダー
        #[arg(short, long, value_enum, default_value = "simulated")]
        provider: ProviderKind,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 記録と実際のリソースの差分を表示
    Drift {
        /// プロバイダー
        #[arg(short, long, value_enum, default_value = "simulated")]
        provider: ProviderKind,
    },
    /// 記録済みの状態を表示
    State {
        /// JSONで出力
        #[arg(long)]
        json: bool,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログはstderrに出力
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("siteflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let site = utils::load_site(cli.file.as_deref())?;

    let code = match cli.command {
        Commands::Validate => commands::validate::handle(&site)?,
        Commands::Plan { json } => commands::plan::handle(&site, json).await?,
        Commands::Apply { provider, yes } => commands::apply::handle(&site, provider, yes).await?,
        Commands::Destroy { provider, yes } => {
            commands::destroy::handle(&site, provider, yes).await?
        }
        Commands::Drift { provider } => commands::drift::handle(&site, provider).await?,
        Commands::State { json } => commands::state::handle(&site, json).await?,
        Commands::Version => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
