use anyhow::{Context, Result};
use clap::CommandFactory;
use ratewarden::{
    cli::{Cli, Commands},
    config::{self, EngineConfig},
    logging, SecurityEngine,
};
use std::fs;
use std::time::Duration;

/// 退出前等待事件落盘的最长时间
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let Some(command) = cli.command.clone() else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match &command {
        Commands::GenerateConfig { path } => return generate_config(path),
        Commands::ValidateConfig { path } => return validate_config(path),
        _ => {}
    }

    // 快速读取配置文件的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 配置文件 > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.as_deref().or(early_log.file.as_deref());

    let _log_guard = logging::init_logging(&log_level, log_format.as_deref(), log_file, cli.quiet)?;

    let config = EngineConfig::load(&cli).context("加载配置失败")?;

    if let Commands::ShowConfig = command {
        return show_config(&config);
    }

    let engine = SecurityEngine::builder(config)
        .connect()
        .await
        .context("初始化 SecurityEngine 失败")?;

    let result = run_command(&engine, command).await;

    if !engine.wait_for_events(EVENT_FLUSH_TIMEOUT).await {
        tracing::warn!("⚠️ 等待安全事件处理超时，部分事件可能未持久化");
    }
    engine.shutdown().await;
    result
}

async fn run_command(engine: &SecurityEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Check { tenant, user, ip } => {
            let identity = ratewarden::CallerIdentity::new(tenant, user);
            match engine.check_limit_from(&identity, ip.as_deref()).await {
                Ok(()) => println!("✅ {} 准入通过", identity),
                Err(e) => {
                    println!("🚫 {} 被拒绝: {}", identity, e);
                    if let Some(limit_type) = e.limit_type() {
                        println!("  - 限额: {}", limit_type);
                    }
                    if let Some(at) = e.retry_after() {
                        println!("  - 重试时间: {}", at);
                    }
                }
            }
        }
        Commands::Record {
            tenant,
            user,
            tokens,
        } => {
            engine
                .record_usage(&tenant, user.as_deref(), tokens)
                .await
                .context("记录用量失败")?;
            println!("✅ 已记录 {} tokens", tokens);
        }
        Commands::Usage { tenant, user } => {
            let usage = engine
                .get_usage(&tenant, user.as_deref())
                .await
                .context("读取用量失败")?;
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
        Commands::Reset { tenant, user } => {
            engine
                .reset_usage(&tenant, user.as_deref())
                .await
                .context("重置用量失败")?;
            println!("✅ 已重置");
        }
        Commands::Block {
            ip,
            duration_secs,
            reason,
        } => {
            let state = engine
                .block_ip(&ip, Duration::from_secs(duration_secs), &reason)
                .await
                .context("封禁失败")?;
            println!("⛔ 已封禁 {} 至 {}", ip, state.expires_at);
        }
        Commands::Unblock { ip } => {
            engine.unblock_ip(&ip).await.context("解除封禁失败")?;
            println!("🔓 已解除封禁 {}", ip);
        }
        Commands::Blocked { ip: Some(ip), .. } => {
            let (blocked, reason) = engine.is_ip_blocked(&ip).await;
            if blocked {
                println!("⛔ {} 已封禁: {}", ip, reason);
            } else {
                println!("✅ {} 未封禁", ip);
            }
        }
        Commands::Blocked { ip: None, limit } => {
            let states = engine.blocked_ips(limit).await.context("读取封禁列表失败")?;
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
        Commands::Metrics { range_secs } => {
            let metrics = engine
                .get_security_metrics(Duration::from_secs(range_secs))
                .await
                .context("读取安全指标失败")?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::GenerateConfig { .. } | Commands::ValidateConfig { .. } | Commands::ShowConfig => {}
    }
    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let default_config = r#"# ratewarden 配置文件
# 此文件由 ratewarden generate-config 生成

[redis]
url = "redis://127.0.0.1:6379"
pool_size = 16
min_idle = 2
connection_timeout_secs = 5
command_timeout_ms = 500
idle_timeout_secs = 300

[engine]
key_prefix = "ratewarden"
# open: 存储不可用时放行；closed: 拒绝
fail_mode = "open"
backend = "redis"

[limits]
# sliding | fixed
strategy = "sliding"
requests_per_minute = 60
requests_per_hour = 1000
requests_per_day = 10000
# tokens_per_minute = 20000
# tokens_per_hour = 500000
# tokens_per_day = 2000000
# cost_limit_per_day = 10.0
usd_per_token = 0.000002
cooldown_period_secs = 0
whitelisted_identities = []

[events]
queue_capacity = 10000
workers = 4
retention_secs = 604800
alert_retention_secs = 2592000
# 同一 (类型, IP) 告警的最小间隔；不设置时每个超阈值事件都会产生告警
# alert_cooldown_secs = 300

# 覆盖默认告警阈值
# [thresholds.failed_login]
# count = 5
# time_window_secs = 300
# severity = "high"
# auto_block = true
# block_duration_secs = 1800
# 默认跟随 auto_block：封禁类阈值按 IP 计数
# group_by_ip = true

[suspicion]
mark_threshold = 50.0
horizon_secs = 86400
cache_capacity = 100000

[blocklist]
local_cache_ttl_secs = 30
local_cache_capacity = 100000

[notifier]
log = true
# webhook_url = "https://alerts.example.com/hook"
timeout_ms = 3000

[metrics]
# 安装 Prometheus Recorder
enabled = false
# listen_addr = "0.0.0.0:9090"

[logging]
level = "info"
format = "compact"
# file = "./logs/ratewarden.log"
"#;

    fs::write(path, default_config).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = EngineConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config
        .validate()
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Backend: {}", config.engine.backend);
    println!("  - Fail Mode: {}", config.engine.fail_mode);
    println!("  - Strategy: {}", config.limits.strategy.as_str());
    println!(
        "  - Requests: {:?}/min, {:?}/hour, {:?}/day",
        config.limits.requests_per_minute,
        config.limits.requests_per_hour,
        config.limits.requests_per_day
    );
    println!("  - Event Queue: {} (workers={})", config.events.queue_capacity, config.events.workers);
    println!("  - Threshold Overrides: {}", config.thresholds.len());

    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(config: &EngineConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("序列化配置失败")?;
    println!("{}", rendered);
    Ok(())
}
