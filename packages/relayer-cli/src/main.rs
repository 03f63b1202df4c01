use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relayer_core::{relayer::Relayer, Config};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径（.json 或 .toml）
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动中继器服务
    Start {
        /// 配置文件路径（.json 或 .toml）
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，RUST_LOG 未设置时默认 info
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("Validating config file {:?}", config);
            let config = Config::load(&config).with_context(|| format!("invalid config {:?}", config))?;
            println!("Config is valid.");
            println!("Chains:");
            for chain in &config.chains {
                println!("  - {} (id {}): {}", chain.name, chain.id, chain.endpoint);
                println!("    bridge:         {:?}", chain.bridge);
                println!("    erc20Handler:   {:?}", chain.erc20_handler);
                println!("    erc721Handler:  {:?}", chain.erc721_handler);
                println!("    genericHandler: {:?}", chain.generic_handler);
                println!("    epoch size: {}, start block: {}", chain.epoch_size, chain.start_block);
            }
            println!("Relayer:");
            println!("  - blockstore: {:?}", config.relayer.blockstore_path);
            println!("  - validator db: {:?}", config.relayer.validator_db_path);
            println!("  - tx retry limit: {}", config.relayer.tx_retry_limit);
            Ok(())
        }
        Commands::Start { config } => {
            info!("Starting relayer with config {:?}", config);
            let config = Config::load(&config).with_context(|| format!("invalid config {:?}", config))?;

            let relayer = Relayer::new(config).await.context("relayer initialisation failed")?;
            info!("Relayer initialised");

            if let Err(e) = relayer.start().await {
                error!("Relayer exited with error: {}", e);
                return Err(e.into());
            }
            Ok(())
        }
    }
}
