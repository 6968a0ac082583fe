//! SecurityEngine：限流与安全监控的统一入口
//!
//! 组件都由引擎实例持有（缓存、事件队列、worker），多个实例之间不共享状态。
//! 请求路径上的操作（准入、用量记录、封禁查询）直接访问 Counter Store；
//! 安全事件经由有界管道交给后台 worker 持久化、计分和评估告警。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerting::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::alerting::{AlertEngine, ThresholdTable};
use crate::blocklist::{BlockKind, BlockRegistry, BlockState, BlockTarget};
use crate::clock::{millis, Clock, SystemClock};
use crate::config::{EngineConfig, FailMode, StoreBackend};
use crate::error::{EngineError, Result};
use crate::events::log::EventLog;
use crate::events::pipeline::EventPipeline;
use crate::events::{SecurityEvent, SecurityEventType};
use crate::gate::{GateVerdict, HeuristicScanner, IntrusionGate, RequestMeta};
use crate::keys::KeySpace;
use crate::limiter::{CallerIdentity, CompositeLimiter, QuotaPlan};
use crate::monitor::SecurityMonitor;
use crate::store::{CounterStore, MemoryStore, RedisStore, StoreError};
use crate::suspicion::SuspicionScorer;
use crate::usage::{CostModel, PerTokenRate, UsageKind, UsageRecorder, UsageStats};

/// 连接池指标上报间隔
const POOL_METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// `GetSecurityMetrics` 的聚合结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMetrics {
    pub time_range_secs: u64,
    /// 事件类型 -> 时间范围内的事件数
    pub event_counts: BTreeMap<String, u64>,
    pub blocked_ip_count: u64,
    pub blocked_caller_count: u64,
    /// 时间范围内产生的告警数
    pub active_alert_count: u64,
    /// 本实例启动以来因队列满被丢弃的事件数
    pub dropped_events: u64,
    pub suspicious_ip_count: u64,
}

/// 引擎构建器
///
/// `build()` 会启动事件 worker，必须在 tokio 运行时内调用。
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    cost_model: Option<Arc<dyn CostModel>>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            cost_model: None,
            notifiers: Vec::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self {
        self.cost_model = Some(cost_model);
        self
    }

    /// 追加告警通知钩子（在配置的 log / webhook 之外）
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// 按配置连接 Redis（backend = redis 且未注入 store 时）后构建
    pub async fn connect(mut self) -> Result<SecurityEngine> {
        let mut pool_reporter = None;
        if self.store.is_none() && self.config.engine.backend == StoreBackend::Redis {
            let redis = Arc::new(RedisStore::connect(&self.config.redis).await?);
            pool_reporter = Some(spawn_pool_reporter(redis.clone()));
            self.store = Some(redis);
        }
        let engine = self.build()?;
        if let Some(handle) = pool_reporter {
            engine.background.lock().push(handle);
        }
        Ok(engine)
    }

    pub fn build(self) -> Result<SecurityEngine> {
        let config = self.config;
        config.validate()?;

        let mut background = Vec::new();
        if config.metrics.enabled {
            crate::metrics::ensure_installed();
            if let Some(addr) = config.metrics.listen_addr()? {
                background.push(tokio::spawn(async move {
                    if let Err(e) = crate::metrics::serve(addr).await {
                        error!("❌ 指标服务异常退出 ({}): {}", addr, e);
                    }
                }));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store: Arc<dyn CounterStore> = match (self.store, config.engine.backend) {
            (Some(store), _) => store,
            (None, StoreBackend::Memory) => Arc::new(MemoryStore::new(clock.clone())),
            (None, StoreBackend::Redis) => {
                return Err(EngineError::InvalidConfiguration(
                    "redis backend requires EngineBuilder::connect or an injected store".into(),
                ))
            }
        };
        let keys = KeySpace::new(config.engine.key_prefix.clone());
        let cost_model = self
            .cost_model
            .unwrap_or_else(|| Arc::new(PerTokenRate::new(config.limits.usd_per_token)));

        let plan = QuotaPlan::from_limits(&config.limits);
        let limiter = CompositeLimiter::new(store.clone(), clock.clone(), keys.clone(), plan.clone());
        let usage = UsageRecorder::new(store.clone(), clock.clone(), keys.clone(), plan, cost_model);

        let blocks = Arc::new(BlockRegistry::new(
            store.clone(),
            clock.clone(),
            keys.clone(),
            &config.blocklist,
        ));
        let log = Arc::new(EventLog::new(
            store.clone(),
            keys.clone(),
            config.events.retention(),
        ));
        let scorer = Arc::new(SuspicionScorer::new(
            store.clone(),
            clock.clone(),
            keys.clone(),
            &config.suspicion,
        ));

        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        if config.notifier.log {
            notifiers.push(Arc::new(LogNotifier));
        }
        if let Some(url) = &config.notifier.webhook_url {
            let webhook =
                WebhookNotifier::new(url.clone(), Duration::from_millis(config.notifier.timeout_ms))
                    .map_err(|e| {
                        EngineError::InvalidConfiguration(format!("webhook notifier: {}", e))
                    })?;
            notifiers.push(Arc::new(webhook));
        }
        notifiers.extend(self.notifiers);

        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            clock.clone(),
            keys.clone(),
            log.clone(),
            blocks.clone(),
            ThresholdTable::with_overrides(&config.thresholds)?,
            notifiers,
            config.events.alert_retention(),
            config.events.alert_cooldown(),
        ));

        let monitor = Arc::new(SecurityMonitor::new(log.clone(), scorer.clone(), alerts.clone()));
        let pipeline = Arc::new(EventPipeline::start(
            config.events.queue_capacity,
            config.events.workers,
            monitor,
        ));

        let scanner = HeuristicScanner::new()
            .map_err(|e| EngineError::InvalidConfiguration(format!("heuristic rules: {}", e)))?;
        let gate = IntrusionGate::new(
            blocks.clone(),
            scanner,
            pipeline.clone(),
            clock.clone(),
            config.engine.fail_mode,
        );

        info!(
            "🛡️ SecurityEngine 已就绪 (backend={}, fail_mode={}, strategy={}, prefix={})",
            config.engine.backend,
            config.engine.fail_mode,
            config.limits.strategy.as_str(),
            config.engine.key_prefix
        );

        Ok(SecurityEngine {
            fail_mode: config.engine.fail_mode,
            cooldown: config.limits.cooldown_period(),
            config,
            clock,
            limiter,
            usage,
            blocks,
            log,
            alerts,
            scorer,
            pipeline,
            gate,
            background: parking_lot::Mutex::new(background),
        })
    }
}

fn spawn_pool_reporter(redis: Arc<RedisStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POOL_METRICS_INTERVAL);
        loop {
            ticker.tick().await;
            redis.report_pool_metrics();
        }
    })
}

pub struct SecurityEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    fail_mode: FailMode,
    /// 超限后对调用方的冷却封禁时长，0 表示关闭
    cooldown: Duration,
    limiter: CompositeLimiter,
    usage: UsageRecorder,
    blocks: Arc<BlockRegistry>,
    log: Arc<EventLog>,
    alerts: Arc<AlertEngine>,
    scorer: Arc<SuspicionScorer>,
    pipeline: Arc<EventPipeline>,
    gate: IntrusionGate,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SecurityEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 准入检查
    pub async fn check_limit(&self, tenant_id: &str, user_id: Option<&str>) -> Result<()> {
        self.check_limit_from(&CallerIdentity::new(tenant_id, user_id), None)
            .await
    }

    /// 准入检查；`ip` 用于超限事件的来源
    ///
    /// 顺序：白名单 -> 调用方冷却封禁 -> 各配额档位（单次原子检查）。
    pub async fn check_limit_from(&self, identity: &CallerIdentity, ip: Option<&str>) -> Result<()> {
        if self.limiter.plan().is_whitelisted(identity) {
            debug!("白名单调用方跳过限流: {}", identity);
            return Ok(());
        }

        match self.admit(identity).await {
            Ok(()) => {
                crate::metrics::record_admitted();
                if let Err(e) = self.usage.touch(identity).await {
                    warn!("⚠️ 更新 {} 最近请求时间失败: {}", identity, e);
                }
                Ok(())
            }
            Err(EngineError::StoreUnavailable(e)) => self.on_store_error("check_limit", e),
            Err(err @ EngineError::LimitExceeded { .. }) => {
                self.on_limit_exceeded(identity, ip, &err).await;
                Err(err)
            }
            Err(err @ EngineError::Blocked { .. }) => {
                crate::metrics::record_blocked(BlockKind::Caller.as_str());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn admit(&self, identity: &CallerIdentity) -> Result<()> {
        let target = BlockTarget::Caller(identity.clone());
        if let Some(state) = self.blocks.is_blocked(&target).await? {
            debug!("调用方 {} 处于冷却期，至 {}", identity, state.expires_at);
            return Err(EngineError::Blocked {
                reason: state.reason,
                retry_after: state.expires_at,
            });
        }
        self.limiter.check(identity).await
    }

    async fn on_limit_exceeded(&self, identity: &CallerIdentity, ip: Option<&str>, err: &EngineError) {
        let limit_type = err.limit_type().unwrap_or_default().to_string();
        crate::metrics::record_limit_exceeded(&limit_type);
        warn!("🚫 {} 超出限额 {}", identity, limit_type);

        let event = self
            .new_event(SecurityEventType::RateLimitExceeded, ip.unwrap_or_default())
            .with_source("limiter")
            .with_caller(identity)
            .with_description(format!("{} exceeded", limit_type))
            .with_metadata("limit_type", limit_type.clone());
        self.log_security_event(event);

        if !self.cooldown.is_zero() {
            let reason = format!("cooldown: {} exceeded", limit_type);
            if let Err(e) = self
                .blocks
                .block(&BlockTarget::Caller(identity.clone()), self.cooldown, &reason)
                .await
            {
                error!("❌ 写入 {} 冷却封禁失败: {}", identity, e);
            }
        }
    }

    /// 按 fail mode 处理存储不可用
    fn on_store_error(&self, operation: &str, e: StoreError) -> Result<()> {
        error!("❌ {} 访问 Counter Store 失败: {}", operation, e);
        match self.fail_mode {
            FailMode::Open => {
                crate::metrics::record_fail_open(operation);
                warn!("⚠️ {} 按 fail-open 放行", operation);
                Ok(())
            }
            FailMode::Closed => Err(EngineError::StoreUnavailable(e)),
        }
    }

    /// 记录一次调用的 Token 用量（费用按成本模型同步累计）
    pub async fn record_usage(&self, tenant_id: &str, user_id: Option<&str>, tokens: u64) -> Result<()> {
        let identity = CallerIdentity::new(tenant_id, user_id);
        match self.usage.record_tokens(&identity, tokens).await {
            Ok(()) => Ok(()),
            Err(e) => self.on_store_error("record_usage", e),
        }
    }

    /// 按种类记录用量（请求数 / Token / 纳美元）
    pub async fn record(&self, identity: &CallerIdentity, units: u64, kind: UsageKind) -> Result<()> {
        match self.usage.record(identity, units, kind).await {
            Ok(()) => Ok(()),
            Err(e) => self.on_store_error("record_usage", e),
        }
    }

    /// 用量快照（含封禁状态）
    pub async fn get_usage(&self, tenant_id: &str, user_id: Option<&str>) -> Result<UsageStats> {
        let identity = CallerIdentity::new(tenant_id, user_id);
        let mut stats = self.usage.snapshot(&identity).await?;
        if let Some(state) = self
            .blocks
            .is_blocked(&BlockTarget::Caller(identity))
            .await?
        {
            stats.blocked = true;
            stats.block_reason = Some(state.reason);
            stats.blocked_until = Some(state.expires_at);
        }
        Ok(stats)
    }

    /// 清空计数器并解除调用方冷却封禁
    pub async fn reset_usage(&self, tenant_id: &str, user_id: Option<&str>) -> Result<()> {
        let identity = CallerIdentity::new(tenant_id, user_id);
        self.usage.reset(&identity).await?;
        self.blocks.unblock(&BlockTarget::Caller(identity)).await?;
        Ok(())
    }

    /// 以引擎时钟为时间戳创建事件
    pub fn new_event(&self, event_type: SecurityEventType, ip: &str) -> SecurityEvent {
        SecurityEvent::new(event_type, ip, self.clock.now())
    }

    /// 提交安全事件；不阻塞、不返回错误，队列满时丢弃并计数
    pub fn log_security_event(&self, event: SecurityEvent) {
        if !self.pipeline.submit(event) {
            debug!("安全事件未入队 (dropped={})", self.pipeline.dropped_count());
        }
    }

    /// IP 封禁查询；返回 (是否封禁, 原因)
    pub async fn is_ip_blocked(&self, ip: &str) -> (bool, String) {
        match self.blocks.is_blocked(&BlockTarget::Ip(ip.to_string())).await {
            Ok(Some(state)) => (true, state.reason),
            Ok(None) => (false, String::new()),
            Err(e) => {
                error!("❌ 查询 IP {} 封禁状态失败: {}", ip, e);
                match self.fail_mode {
                    FailMode::Open => {
                        crate::metrics::record_fail_open("is_ip_blocked");
                        (false, String::new())
                    }
                    FailMode::Closed => (true, "counter store unavailable".to_string()),
                }
            }
        }
    }

    pub async fn block_ip(&self, ip: &str, duration: Duration, reason: &str) -> Result<BlockState> {
        Ok(self
            .blocks
            .block(&BlockTarget::Ip(ip.to_string()), duration, reason)
            .await?)
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<()> {
        Ok(self.blocks.unblock(&BlockTarget::Ip(ip.to_string())).await?)
    }

    pub async fn block_caller(
        &self,
        identity: &CallerIdentity,
        duration: Duration,
        reason: &str,
    ) -> Result<BlockState> {
        Ok(self
            .blocks
            .block(&BlockTarget::Caller(identity.clone()), duration, reason)
            .await?)
    }

    pub async fn blocked_ips(&self, limit: usize) -> Result<Vec<BlockState>> {
        Ok(self.blocks.list_active(BlockKind::Ip, limit).await?)
    }

    /// 最近 `range` 内的安全态势
    pub async fn get_security_metrics(&self, range: Duration) -> Result<SecurityMetrics> {
        let now_ms = self.clock.now_ms();
        let from_ms = now_ms.saturating_sub(millis(range));

        let mut event_counts = BTreeMap::new();
        for event_type in SecurityEventType::ALL {
            let count = self.log.count_between(event_type, from_ms, now_ms).await?;
            event_counts.insert(event_type.as_str().to_string(), count);
        }

        Ok(SecurityMetrics {
            time_range_secs: range.as_secs(),
            event_counts,
            blocked_ip_count: self.blocks.active_count(BlockKind::Ip).await?,
            blocked_caller_count: self.blocks.active_count(BlockKind::Caller).await?,
            active_alert_count: self.alerts.count_between(from_ms, now_ms).await?,
            dropped_events: self.pipeline.dropped_count(),
            suspicious_ip_count: self.scorer.suspicious_count().await?,
        })
    }

    /// Intrusion-Detection Gate
    pub async fn inspect_request(&self, meta: &RequestMeta) -> GateVerdict {
        self.gate.inspect(meta).await
    }

    pub async fn suspicion_score(&self, ip: &str) -> Result<f64> {
        Ok(self.scorer.score(ip).await?)
    }

    pub async fn is_suspicious(&self, ip: &str) -> Result<bool> {
        Ok(self.scorer.is_suspicious(ip).await?)
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    /// 等待已提交事件处理完成（测试与优雅关闭使用）
    pub async fn wait_for_events(&self, timeout: Duration) -> bool {
        self.pipeline.wait_idle(timeout).await
    }

    /// 处理完队列中的事件后停止后台任务
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
        for handle in std::mem::take(&mut *self.background.lock()) {
            handle.abort();
        }
        info!("🛑 SecurityEngine 已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn memory_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.engine.backend = StoreBackend::Memory;
        config.notifier.log = false;
        config
    }

    #[tokio::test]
    async fn test_build_memory_backend() {
        let engine = SecurityEngine::builder(memory_config())
            .clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();
        engine.check_limit("acme", Some("alice")).await.unwrap();
        let usage = engine.get_usage("acme", Some("alice")).await.unwrap();
        assert_eq!(usage.requests_per_minute.used, 1);
        assert!(usage.last_request.is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_build_redis_without_store_is_rejected() {
        let config = EngineConfig::default();
        assert!(matches!(
            SecurityEngine::builder(config).build(),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let mut config = memory_config();
        config.limits.requests_per_minute = Some(0);
        assert!(matches!(
            SecurityEngine::builder(config).build(),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }
}
