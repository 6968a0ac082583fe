use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::EngineError;
use crate::events::{SecurityEventType, Severity};
use crate::store::WindowStrategy;

/// 封禁、冷却、保留等时长的上限（10 年）
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;
pub const MAX_DURATION: Duration = Duration::from_secs(MAX_DURATION_SECS);

/// 引擎配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub redis: RedisConfig,
    pub engine: CoreConfig,
    pub limits: LimitsConfig,
    pub events: EventsConfig,
    /// 按事件类型覆盖默认告警阈值，key 为事件类型（如 `failed_login`）
    pub thresholds: BTreeMap<String, ThresholdConfig>,
    pub suspicion: SuspicionConfig,
    pub blocklist: BlocklistConfig,
    pub notifier: NotifierConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Counter Store 不可用时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// 放行（可用性优先）
    #[default]
    Open,
    /// 拒绝（安全优先）
    Closed,
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(format!("unknown fail mode: {}", other)),
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailMode::Open => write!(f, "open"),
            FailMode::Closed => write!(f, "closed"),
        }
    }
}

/// Counter Store 后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// 进程内存储，仅适用于单实例
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => write!(f, "redis"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接数
    pub min_idle: u32,
    /// 连接超时时间（秒）
    pub connection_timeout_secs: u64,
    /// 单条命令超时（毫秒）
    pub command_timeout_ms: u64,
    /// 空闲连接回收时间（秒）
    pub idle_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            min_idle: 2,
            connection_timeout_secs: 5,
            command_timeout_ms: 500,
            idle_timeout_secs: 300,
        }
    }
}

impl RedisConfig {
    /// 获取连接超时时间
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// 所有 key 的前缀，多个部署共用一个 Redis 时用于隔离
    pub key_prefix: String,
    pub fail_mode: FailMode,
    pub backend: StoreBackend,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratewarden".to_string(),
            fail_mode: FailMode::Open,
            backend: StoreBackend::Redis,
        }
    }
}

/// 配额配置
///
/// 未配置（None）的档位视为关闭。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// 请求次数档位使用的窗口算法；Token / 费用档位固定使用分桶计数
    pub strategy: WindowStrategy,
    pub requests_per_minute: Option<u64>,
    pub requests_per_hour: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_hour: Option<u64>,
    pub tokens_per_day: Option<u64>,
    /// 每日费用上限（美元）
    pub cost_limit_per_day: Option<f64>,
    /// 每个 Token 的费用（美元）
    pub usd_per_token: f64,
    /// 超限后封禁调用方的冷却时间（秒），0 表示不封禁
    pub cooldown_period_secs: u64,
    /// 白名单：`tenant/user` 或 `tenant/*`
    pub whitelisted_identities: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            strategy: WindowStrategy::Sliding,
            requests_per_minute: Some(60),
            requests_per_hour: Some(1_000),
            requests_per_day: Some(10_000),
            tokens_per_minute: None,
            tokens_per_hour: None,
            tokens_per_day: None,
            cost_limit_per_day: None,
            usd_per_token: 0.000_002,
            cooldown_period_secs: 0,
            whitelisted_identities: Vec::new(),
        }
    }
}

impl LimitsConfig {
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown_period_secs)
    }
}

/// 安全事件管道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// 有界队列容量，满时丢弃
    pub queue_capacity: usize,
    /// 消费 worker 数
    pub workers: usize,
    /// 事件保留时间（秒）
    pub retention_secs: u64,
    /// 告警与封禁审计保留时间（秒）
    pub alert_retention_secs: u64,
    /// 同一 (类型, IP) 的告警冷却（秒）；未配置时每次越过阈值都告警
    pub alert_cooldown_secs: Option<u64>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            workers: 4,
            retention_secs: 7 * 24 * 3600,
            alert_retention_secs: 30 * 24 * 3600,
            alert_cooldown_secs: None,
        }
    }
}

impl EventsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn alert_retention(&self) -> Duration {
        Duration::from_secs(self.alert_retention_secs)
    }

    pub fn alert_cooldown(&self) -> Option<Duration> {
        self.alert_cooldown_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// 单个事件类型的阈值覆盖，未填写的字段沿用默认阈值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub count: Option<u32>,
    pub time_window_secs: Option<u64>,
    pub severity: Option<Severity>,
    pub auto_block: Option<bool>,
    pub block_duration_secs: Option<u64>,
    pub group_by_ip: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspicionConfig {
    /// 累计分数达到该值时标记为可疑
    pub mark_threshold: f64,
    /// 事件贡献分数的时间范围（秒）
    pub horizon_secs: u64,
    pub cache_capacity: u64,
}

impl Default for SuspicionConfig {
    fn default() -> Self {
        Self {
            mark_threshold: 50.0,
            horizon_secs: 24 * 3600,
            cache_capacity: 100_000,
        }
    }
}

impl SuspicionConfig {
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// 本地封禁缓存 TTL（秒）
    pub local_cache_ttl_secs: u64,
    pub local_cache_capacity: u64,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            local_cache_ttl_secs: 30,
            local_cache_capacity: 100_000,
        }
    }
}

impl BlocklistConfig {
    pub fn local_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.local_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// 告警写入日志
    pub log: bool,
    /// 告警 Webhook 地址（JSON POST）
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url: None,
            timeout_ms: 3_000,
        }
    }
}

/// Prometheus 指标（`[metrics]` 段）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 构建引擎时安装全局 Recorder
    pub enabled: bool,
    /// 设置后在该地址提供 `GET /metrics`，如 `0.0.0.0:9090`
    pub listen_addr: Option<String>,
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> std::result::Result<Option<SocketAddr>, EngineError> {
        self.listen_addr
            .as_deref()
            .map(|addr| {
                addr.parse().map_err(|e| {
                    EngineError::InvalidConfiguration(format!(
                        "metrics.listen_addr '{}' is not a socket address: {}",
                        addr, e
                    ))
                })
            })
            .transpose()
    }
}

/// 日志配置（`[logging]` 段）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content).with_context(|| "配置文件格式错误")?;
        Ok(config)
    }

    /// 从环境变量加载配置（RATEWARDEN_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("RATEWARDEN_REDIS_URL").or_else(|_| env::var("REDIS_URL")) {
            self.redis.url = url;
        }
        if let Some(size) = env_parse("RATEWARDEN_REDIS_POOL_SIZE")? {
            self.redis.pool_size = size;
        }
        if let Some(ms) = env_parse("RATEWARDEN_REDIS_COMMAND_TIMEOUT_MS")? {
            self.redis.command_timeout_ms = ms;
        }
        if let Ok(prefix) = env::var("RATEWARDEN_KEY_PREFIX") {
            self.engine.key_prefix = prefix;
        }
        if let Some(mode) = env_parse("RATEWARDEN_FAIL_MODE")? {
            self.engine.fail_mode = mode;
        }
        if let Some(backend) = env_parse("RATEWARDEN_BACKEND")? {
            self.engine.backend = backend;
        }

        // 配额
        if let Some(v) = env_parse("RATEWARDEN_REQUESTS_PER_MINUTE")? {
            self.limits.requests_per_minute = Some(v);
        }
        if let Some(v) = env_parse("RATEWARDEN_REQUESTS_PER_HOUR")? {
            self.limits.requests_per_hour = Some(v);
        }
        if let Some(v) = env_parse("RATEWARDEN_REQUESTS_PER_DAY")? {
            self.limits.requests_per_day = Some(v);
        }
        if let Some(v) = env_parse("RATEWARDEN_TOKENS_PER_DAY")? {
            self.limits.tokens_per_day = Some(v);
        }
        if let Some(v) = env_parse("RATEWARDEN_COST_LIMIT_PER_DAY")? {
            self.limits.cost_limit_per_day = Some(v);
        }
        if let Some(v) = env_parse("RATEWARDEN_USD_PER_TOKEN")? {
            self.limits.usd_per_token = v;
        }
        if let Some(v) = env_parse("RATEWARDEN_COOLDOWN_SECS")? {
            self.limits.cooldown_period_secs = v;
        }

        if let Some(v) = env_parse("RATEWARDEN_EVENT_QUEUE_CAPACITY")? {
            self.events.queue_capacity = v;
        }
        if let Some(v) = env_parse("RATEWARDEN_EVENT_WORKERS")? {
            self.events.workers = v;
        }
        if let Ok(url) = env::var("RATEWARDEN_WEBHOOK_URL") {
            self.notifier.webhook_url = Some(url);
        }
        if let Some(enabled) = env_parse("RATEWARDEN_METRICS_ENABLED")? {
            self.metrics.enabled = enabled;
        }
        if let Ok(addr) = env::var("RATEWARDEN_METRICS_ADDR") {
            self.metrics.listen_addr = Some(addr);
        }
        if let Ok(level) = env::var("RATEWARDEN_LOG_LEVEL") {
            self.logging.level = Some(level);
        }

        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) -> Result<()> {
        if let Some(url) = &cli.redis_url {
            self.redis.url = url.clone();
        }
        if let Some(prefix) = &cli.key_prefix {
            self.engine.key_prefix = prefix.clone();
        }
        if let Some(mode) = &cli.fail_mode {
            self.engine.fail_mode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(backend) = &cli.backend {
            self.engine.backend = backend.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = Some(level);
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
        if cli.enable_metrics {
            self.metrics.enabled = true;
        }
        if let Some(port) = cli.metrics_port {
            self.metrics.enabled = true;
            self.metrics.listen_addr = Some(format!("0.0.0.0:{}", port));
        }
        Ok(())
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
        } else if Path::new("ratewarden.toml").exists() {
            info!("📄 从默认配置文件加载: ratewarden.toml");
            Self::from_toml_file("ratewarden.toml")?
        } else {
            Self::new()
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli)?;
        config.validate()?;

        Ok(config)
    }

    /// 校验配置；任何非法值在启动时直接失败
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidConfiguration(msg));

        let limits = &self.limits;
        for (name, value) in [
            ("requests_per_minute", limits.requests_per_minute),
            ("requests_per_hour", limits.requests_per_hour),
            ("requests_per_day", limits.requests_per_day),
            ("tokens_per_minute", limits.tokens_per_minute),
            ("tokens_per_hour", limits.tokens_per_hour),
            ("tokens_per_day", limits.tokens_per_day),
        ] {
            if value == Some(0) {
                return invalid(format!("limits.{} must be positive", name));
            }
        }
        if let Some(cost) = limits.cost_limit_per_day {
            if !cost.is_finite() || cost <= 0.0 {
                return invalid(format!(
                    "limits.cost_limit_per_day must be a positive number, got {}",
                    cost
                ));
            }
        }
        if !limits.usd_per_token.is_finite() || limits.usd_per_token < 0.0 {
            return invalid(format!(
                "limits.usd_per_token must be a non-negative number, got {}",
                limits.usd_per_token
            ));
        }
        for entry in &limits.whitelisted_identities {
            if entry.trim().is_empty() || !entry.contains('/') {
                return invalid(format!(
                    "whitelist entry '{}' must look like tenant/user or tenant/*",
                    entry
                ));
            }
        }

        if self.engine.key_prefix.is_empty() {
            return invalid("engine.key_prefix must not be empty".into());
        }
        if self.events.queue_capacity == 0 {
            return invalid("events.queue_capacity must be positive".into());
        }
        if self.events.workers == 0 {
            return invalid("events.workers must be positive".into());
        }
        if self.events.retention_secs == 0 || self.events.alert_retention_secs == 0 {
            return invalid("events retention must be positive".into());
        }

        let mut durations = vec![
            ("limits.cooldown_period_secs".to_string(), Some(limits.cooldown_period_secs)),
            ("events.retention_secs".to_string(), Some(self.events.retention_secs)),
            ("events.alert_retention_secs".to_string(), Some(self.events.alert_retention_secs)),
            ("events.alert_cooldown_secs".to_string(), self.events.alert_cooldown_secs),
            ("suspicion.horizon_secs".to_string(), Some(self.suspicion.horizon_secs)),
            ("blocklist.local_cache_ttl_secs".to_string(), Some(self.blocklist.local_cache_ttl_secs)),
        ];
        for (event_type, threshold) in &self.thresholds {
            durations.push((
                format!("thresholds.{}.time_window_secs", event_type),
                threshold.time_window_secs,
            ));
            durations.push((
                format!("thresholds.{}.block_duration_secs", event_type),
                threshold.block_duration_secs,
            ));
        }
        for (name, value) in durations {
            if let Some(secs) = value.filter(|secs| *secs > MAX_DURATION_SECS) {
                return invalid(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_DURATION_SECS, secs
                ));
            }
        }

        for (event_type, threshold) in &self.thresholds {
            if event_type.parse::<SecurityEventType>().is_err() {
                return invalid(format!("unknown event type in thresholds: {}", event_type));
            }
            if threshold.count == Some(0) {
                return invalid(format!("thresholds.{}.count must be at least 1", event_type));
            }
            if threshold.time_window_secs == Some(0) {
                return invalid(format!(
                    "thresholds.{}.time_window_secs must be positive",
                    event_type
                ));
            }
            if threshold.auto_block == Some(true) && threshold.block_duration_secs == Some(0) {
                return invalid(format!(
                    "thresholds.{}.block_duration_secs must be positive when auto_block is set",
                    event_type
                ));
            }
        }

        if !self.suspicion.mark_threshold.is_finite() || self.suspicion.mark_threshold <= 0.0 {
            return invalid("suspicion.mark_threshold must be positive".into());
        }
        if self.suspicion.horizon_secs == 0 {
            return invalid("suspicion.horizon_secs must be positive".into());
        }
        if self.redis.pool_size == 0 || self.redis.command_timeout_ms == 0 {
            return invalid("redis.pool_size and redis.command_timeout_ms must be positive".into());
        }
        self.metrics.listen_addr()?;

        Ok(())
    }
}

/// 读取并解析环境变量；变量存在但无法解析时返回错误，避免拼写错误被静默忽略
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => parse_env_value(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_env_value<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("环境变量 {}={} 无法解析: {}", name, raw, e))
}

/// 只读取配置文件中的 `[logging]` 段，用于在完整加载配置前初始化日志
pub fn load_early_logging_config(config_file: Option<&str>) -> LoggingConfig {
    #[derive(Deserialize, Default)]
    struct Early {
        #[serde(default)]
        logging: LoggingConfig,
    }

    let path = config_file.unwrap_or("ratewarden.toml");
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Early>(&content).ok())
        .map(|early| early.logging)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.fail_mode, FailMode::Open);
        assert_eq!(config.events.retention_secs, 604_800);
        assert!(config.events.alert_cooldown().is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [engine]
            fail_mode = "closed"
            backend = "memory"

            [limits]
            strategy = "fixed"
            requests_per_minute = 10
            cost_limit_per_day = 5.0
            whitelisted_identities = ["ops/*"]

            [thresholds.failed_login]
            count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.fail_mode, FailMode::Closed);
        assert_eq!(config.engine.backend, StoreBackend::Memory);
        assert_eq!(config.limits.strategy, WindowStrategy::Fixed);
        assert_eq!(config.limits.requests_per_minute, Some(10));
        // 未填写的字段保持默认
        assert_eq!(config.limits.requests_per_hour, Some(1_000));
        assert_eq!(config.thresholds["failed_login"].count, Some(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.limits.requests_per_minute = Some(0);
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfiguration(_))
        ));

        let mut config = EngineConfig::default();
        config.thresholds.insert(
            "failed_login".into(),
            ThresholdConfig {
                time_window_secs: Some(0),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config
            .thresholds
            .insert("not_a_type".into(), ThresholdConfig::default());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.limits.usd_per_token = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.events.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut config = EngineConfig::default();
        config.thresholds.insert(
            "sql_injection_attempt".into(),
            ThresholdConfig {
                block_duration_secs: Some(u64::MAX / 2),
                ..Default::default()
            },
        );
        match config.validate() {
            Err(EngineError::InvalidConfiguration(msg)) => {
                assert!(msg.contains("thresholds.sql_injection_attempt.block_duration_secs"))
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut config = EngineConfig::default();
        config.limits.cooldown_period_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.events.alert_retention_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.limits.cooldown_period_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_env_value_is_an_error() {
        let err = parse_env_value::<FailMode>("RATEWARDEN_FAIL_MODE", "clsoed").unwrap_err();
        assert!(err.to_string().contains("RATEWARDEN_FAIL_MODE"));
        assert_eq!(
            parse_env_value::<FailMode>("RATEWARDEN_FAIL_MODE", " Closed ").unwrap(),
            FailMode::Closed
        );
        assert!(parse_env_value::<u64>("RATEWARDEN_REQUESTS_PER_MINUTE", "ten").is_err());

        // 只有该测试读写这个变量
        env::set_var("RATEWARDEN_BACKEND", "memroy");
        let result = EngineConfig::default().merge_from_env();
        env::remove_var("RATEWARDEN_BACKEND");
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = EngineConfig::from_toml_str(
            r#"
            [engine]
            key_prefix = "from-file"
            fail_mode = "open"
            "#,
        )
        .unwrap();
        let cli = crate::cli::Cli {
            key_prefix: Some("from-cli".into()),
            fail_mode: Some("closed".into()),
            backend: Some("memory".into()),
            verbose: 2,
            ..Default::default()
        };
        config.merge_from_cli(&cli).unwrap();
        assert_eq!(config.engine.key_prefix, "from-cli");
        assert_eq!(config.engine.fail_mode, FailMode::Closed);
        assert_eq!(config.engine.backend, StoreBackend::Memory);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));

        let bad = crate::cli::Cli {
            fail_mode: Some("sometimes".into()),
            ..Default::default()
        };
        assert!(config.merge_from_cli(&bad).is_err());
    }

    #[test]
    fn test_fail_mode_from_str() {
        assert_eq!("CLOSED".parse::<FailMode>().unwrap(), FailMode::Closed);
        assert!("maybe".parse::<FailMode>().is_err());
    }
}
