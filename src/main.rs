use clap::Parser;
use tracing_subscriber::EnvFilter;

use pooled_http_client::{Config, build_client_from_config};

/// 按配置构建连接池 HTTP Client，可选发起一次探测请求
#[derive(Parser, Debug)]
#[command(name = "pooled-http-client", version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 探测地址，通过构建好的 Client 发起一次 GET
    #[arg(long)]
    probe: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let config = Config::load(&config_path)?;
    tracing::debug!("已加载配置: {}", config_path);

    let client = build_client_from_config(&config)?;

    if let Some(url) = args.probe {
        let response = client.send(client.get(&url)).await?;
        tracing::info!("探测 {} 返回 HTTP {}", url, response.status());
    }

    Ok(())
}
