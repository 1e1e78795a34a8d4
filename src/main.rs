mod common;
mod http_client;
mod model;
mod pricing;
mod proxy;
mod usage;
mod usage_log;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use model::arg::{Args, Command};
use model::config::Config;
use pricing::PriceTable;
use proxy::Forwarder;
use usage_log::{Timeframe, UsageLog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG 优先于 --log-level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let config = Config::load(&config_path)?;
    if let Some(path) = config.config_path().filter(|p| p.exists()) {
        tracing::debug!("已加载配置文件: {}", path.display());
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Stats { timeframe } => print_stats(&config, timeframe).await,
        Command::Recent { limit } => print_recent(&config, limit).await,
        Command::Status => check_status(&config).await,
        Command::Reset { yes } => reset(&config, yes).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let prices = Arc::new(PriceTable::with_overrides(config.pricing.clone()));
    tracing::info!("价格表已加载: {} 个模型", prices.len());

    let db_path = config.resolved_db_path();
    let log = Arc::new(UsageLog::open(&db_path)?);
    tracing::info!("用量数据库: {}", db_path.display());

    let client = http_client::build_client(
        config.proxy_url.as_deref(),
        config.connect_timeout_secs,
        config.request_timeout_secs,
    )
    .context("创建 HTTP Client 失败")?;

    let forwarder = Forwarder::new(
        client,
        log.clone(),
        prices,
        &config.anthropic_upstream,
        &config.openai_upstream,
        &config.source_app_header,
    );

    if config.admin_api_key.is_none() {
        tracing::warn!("未配置 adminApiKey，报表 API 不做认证");
    }

    let app = Router::new()
        .merge(proxy::create_proxy_router(forwarder))
        .nest(
            "/api",
            usage_log::create_usage_router(config.admin_api_key.clone(), log.clone()),
        );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听 {} 失败", addr))?;
    tracing::info!("启动代理服务: http://{}", addr);
    tracing::info!("Anthropic 上游: {} (/anthropic/*)", config.anthropic_upstream);
    tracing::info!("OpenAI 上游: {} (/openai/*)", config.openai_upstream);
    tracing::info!("报表 API: GET /api/stats, /api/recent, /api/timeseries; DELETE /api/usage");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    // 服务停止后把剩余记录写完
    log.close().await;
    tracing::info!("已关闭");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听 Ctrl-C 失败: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始优雅关闭");
}

fn open_log(config: &Config) -> anyhow::Result<UsageLog> {
    UsageLog::open(config.resolved_db_path())
}

async fn print_stats(config: &Config, timeframe: Timeframe) -> anyhow::Result<()> {
    let log = open_log(config)?;
    let stats = log.stats(timeframe).await?;
    log.close().await;

    println!("用量统计（{}）", stats.timeframe);
    println!("  请求数:       {}", stats.total_requests);
    println!("  输入 tokens:  {}", stats.total_input_tokens);
    println!("  输出 tokens:  {}", stats.total_output_tokens);
    println!("  缓存写入:     {}", stats.total_cache_creation_tokens);
    println!("  缓存读取:     {}", stats.total_cache_read_tokens);
    println!("  估算费用:     ${:.4}", stats.total_estimated_cost);

    if !stats.models.is_empty() {
        println!();
        println!(
            "{:<36} {:>8} {:>12} {:>12} {:>10}",
            "MODEL", "REQS", "INPUT", "OUTPUT", "COST"
        );
        for row in &stats.models {
            let model = if row.model.is_empty() { "(unknown)" } else { &row.model };
            println!(
                "{:<36} {:>8} {:>12} {:>12} {:>10}",
                model,
                row.requests,
                row.input_tokens,
                row.output_tokens,
                format!("${:.4}", row.cost)
            );
        }
    }
    Ok(())
}

async fn print_recent(config: &Config, limit: u32) -> anyhow::Result<()> {
    let log = open_log(config)?;
    let entries = log.recent(limit).await?;
    log.close().await;

    if entries.is_empty() {
        println!("暂无记录");
        return Ok(());
    }
    for entry in entries {
        let r = entry.record;
        let cost = r
            .estimated_cost
            .map(|c| format!("${:.4}", c))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {:<9} {:<32} {:>3} in={} out={} cost={} {}ms [{}]",
            r.created_at.format("%Y-%m-%d %H:%M:%S"),
            r.api_type,
            r.model,
            r.status_code,
            r.input_tokens,
            r.output_tokens,
            cost,
            r.latency_ms,
            r.source_app
        );
    }
    Ok(())
}

async fn check_status(config: &Config) -> anyhow::Result<()> {
    let url = format!("http://{}:{}/health", config.host, config.port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            println!("运行中: {}", url);
            Ok(())
        }
        Ok(response) => anyhow::bail!("{} 返回 {}", url, response.status()),
        Err(e) => anyhow::bail!("未运行（{}）: {}", url, e),
    }
}

async fn reset(config: &Config, yes: bool) -> anyhow::Result<()> {
    if !yes {
        anyhow::bail!("reset 会删除全部用量记录，请加 --yes 确认");
    }
    let log = open_log(config)?;
    let deleted = log.reset().await?;
    log.close().await;
    println!("已删除 {} 条记录", deleted);
    Ok(())
}
