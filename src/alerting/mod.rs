//! Alerting & Auto-Block
//!
//! 事件写入时间序列后，统计同类事件在阈值窗口内（含当前事件）的数量；
//! 达到阈值即生成告警，按配置自动封禁来源 IP，并调用通知钩子。
//! 告警是电平触发的：窗口内计数维持在阈值以上时，每个新事件都会再次告警，
//! 除非配置了 `alert_cooldown_secs`。

pub mod notifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use notifier::{FnNotifier, LogNotifier, Notifier, NotifyError, WebhookNotifier};

use crate::blocklist::{BlockRegistry, BlockTarget};
use crate::clock::{sub_saturating, Clock};
use crate::config::ThresholdConfig;
use crate::error::EngineError;
use crate::events::{EventLog, SecurityEvent, SecurityEventType, Severity};
use crate::keys::KeySpace;
use crate::store::{CounterStore, StoreError, StoreResult};

/// 单个事件类型的告警阈值，`count >= 1` 且 `time_window > 0`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub event_type: SecurityEventType,
    pub count: u32,
    pub time_window: Duration,
    pub severity: Severity,
    pub auto_block: bool,
    pub block_duration: Duration,
    /// 按 (类型, IP) 计数，而不是按类型全局计数；
    /// 未显式配置时跟随 `auto_block`，避免其他来源的事件把无辜 IP 推过阈值
    pub group_by_ip: bool,
}

impl AlertThreshold {
    fn new(
        event_type: SecurityEventType,
        count: u32,
        window_secs: u64,
        severity: Severity,
        block_secs: Option<u64>,
    ) -> Self {
        Self {
            event_type,
            count,
            time_window: Duration::from_secs(window_secs),
            severity,
            auto_block: block_secs.is_some(),
            block_duration: Duration::from_secs(block_secs.unwrap_or(0)),
            group_by_ip: block_secs.is_some(),
        }
    }
}

/// 默认阈值
pub fn default_thresholds() -> Vec<AlertThreshold> {
    use SecurityEventType::*;
    vec![
        AlertThreshold::new(FailedLogin, 5, 300, Severity::High, Some(1800)),
        AlertThreshold::new(BruteForce, 3, 600, Severity::Critical, Some(3600)),
        AlertThreshold::new(SqlInjectionAttempt, 1, 60, Severity::Critical, Some(86_400)),
        AlertThreshold::new(XssAttempt, 3, 300, Severity::High, Some(3600)),
        AlertThreshold::new(PathTraversal, 3, 300, Severity::High, Some(3600)),
        AlertThreshold::new(UnauthorizedAccess, 5, 300, Severity::High, Some(1800)),
        AlertThreshold::new(PrivilegeEscalation, 1, 3600, Severity::Critical, Some(86_400)),
        AlertThreshold::new(RateLimitExceeded, 10, 60, Severity::Medium, None),
        AlertThreshold::new(SuspiciousRequest, 10, 300, Severity::Medium, None),
        AlertThreshold::new(BlockedIpAccess, 20, 300, Severity::Low, None),
    ]
}

/// 事件类型 -> 阈值
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    thresholds: HashMap<SecurityEventType, AlertThreshold>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self::new(default_thresholds())
    }
}

impl ThresholdTable {
    pub fn new(thresholds: Vec<AlertThreshold>) -> Self {
        Self {
            thresholds: thresholds
                .into_iter()
                .map(|t| (t.event_type, t))
                .collect(),
        }
    }

    /// 默认阈值 + 配置覆盖
    pub fn with_overrides(overrides: &BTreeMap<String, ThresholdConfig>) -> Result<Self, EngineError> {
        let mut table = Self::default();
        for (name, cfg) in overrides {
            let event_type: SecurityEventType =
                name.parse().map_err(EngineError::InvalidConfiguration)?;
            let Some(threshold) = table.thresholds.get_mut(&event_type) else {
                continue;
            };
            if let Some(count) = cfg.count {
                threshold.count = count;
            }
            if let Some(secs) = cfg.time_window_secs {
                threshold.time_window = Duration::from_secs(secs);
            }
            if let Some(severity) = cfg.severity {
                threshold.severity = severity;
            }
            if let Some(auto_block) = cfg.auto_block {
                threshold.auto_block = auto_block;
            }
            if let Some(secs) = cfg.block_duration_secs {
                threshold.block_duration = Duration::from_secs(secs);
            }
            threshold.group_by_ip = cfg.group_by_ip.unwrap_or(threshold.auto_block);

            if threshold.count == 0 || threshold.time_window.is_zero() {
                return Err(EngineError::InvalidConfiguration(format!(
                    "threshold for {} needs count >= 1 and a positive window",
                    name
                )));
            }
            if threshold.auto_block && threshold.block_duration.is_zero() {
                return Err(EngineError::InvalidConfiguration(format!(
                    "threshold for {} enables auto_block without block_duration_secs",
                    name
                )));
            }
        }
        Ok(table)
    }

    pub fn get(&self, event_type: SecurityEventType) -> Option<&AlertThreshold> {
        self.thresholds.get(&event_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertThreshold> {
        self.thresholds.values()
    }
}

/// 阈值触发后生成的告警记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: String,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub ip_address: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    /// 触发告警的事件
    pub event_id: String,
    pub triggered_at: DateTime<Utc>,
    pub event_count: u64,
    pub threshold_count: u32,
    pub time_window_secs: u64,
    pub auto_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub message: String,
}

pub struct AlertEngine {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    log: Arc<EventLog>,
    blocks: Arc<BlockRegistry>,
    thresholds: ThresholdTable,
    notifiers: Vec<Arc<dyn Notifier>>,
    retention: Duration,
    cooldown: Option<Duration>,
}

impl AlertEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        log: Arc<EventLog>,
        blocks: Arc<BlockRegistry>,
        thresholds: ThresholdTable,
        notifiers: Vec<Arc<dyn Notifier>>,
        retention: Duration,
        cooldown: Option<Duration>,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            log,
            blocks,
            thresholds,
            notifiers,
            retention,
            cooldown,
        }
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    /// 事件已写入时间序列后调用：窗口内同类事件数达到阈值时返回阈值与计数
    pub async fn should_alert(
        &self,
        event: &SecurityEvent,
    ) -> StoreResult<Option<(AlertThreshold, u64)>> {
        let Some(threshold) = self.thresholds.get(event.event_type) else {
            return Ok(None);
        };
        let ip = (threshold.group_by_ip && !event.ip_address.is_empty())
            .then_some(event.ip_address.as_str());
        let count = self
            .log
            .count_in_window(
                event.event_type,
                ip,
                event.timestamp.timestamp_millis(),
                threshold.time_window,
            )
            .await?;
        if count >= u64::from(threshold.count) {
            Ok(Some((threshold.clone(), count)))
        } else {
            Ok(None)
        }
    }

    /// 生成告警：按需封禁、持久化、通知；处于冷却期时返回 None
    pub async fn raise(
        &self,
        event: &SecurityEvent,
        threshold: &AlertThreshold,
        count: u64,
    ) -> StoreResult<Option<SecurityAlert>> {
        if let Some(cooldown) = self.cooldown {
            let key = self
                .keys
                .alert_cooldown(event.event_type.as_str(), &event.ip_address);
            // 多个 worker 并发评估时只有一个能写入冷却标记
            if !self.store.set_nx_ex(&key, "1", cooldown).await? {
                tracing::debug!(
                    "告警冷却中，跳过: {} {}",
                    event.event_type,
                    event.ip_address
                );
                return Ok(None);
            }
        }

        let window_secs = threshold.time_window.as_secs();
        let mut blocked_until = None;
        if threshold.auto_block && !event.ip_address.is_empty() {
            let reason = format!(
                "auto-block: {} threshold reached ({} events within {}s)",
                event.event_type, count, window_secs
            );
            let state = self
                .blocks
                .block(
                    &BlockTarget::Ip(event.ip_address.clone()),
                    threshold.block_duration,
                    &reason,
                )
                .await?;
            crate::metrics::record_auto_block(event.event_type.as_str());
            blocked_until = Some(state.expires_at);
        }

        let now = self.clock.now();
        let alert = SecurityAlert {
            id: Uuid::new_v4().to_string(),
            event_type: event.event_type,
            severity: threshold.severity,
            ip_address: event.ip_address.clone(),
            tenant_id: event.tenant_id.clone(),
            user_id: event.user_id.clone(),
            event_id: event.id.clone(),
            triggered_at: now,
            event_count: count,
            threshold_count: threshold.count,
            time_window_secs: window_secs,
            auto_blocked: blocked_until.is_some(),
            blocked_until,
            message: format!(
                "{} {} events within {}s (threshold {})",
                count, event.event_type, window_secs, threshold.count
            ),
        };
        self.persist(&alert).await?;
        crate::metrics::record_alert(event.event_type.as_str());

        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&alert).await {
                tracing::warn!("⚠️ 告警通知失败 ({}): {}", notifier.name(), e);
            }
        }
        Ok(Some(alert))
    }

    /// should_alert + raise
    pub async fn evaluate(&self, event: &SecurityEvent) -> StoreResult<Option<SecurityAlert>> {
        match self.should_alert(event).await? {
            Some((threshold, count)) => self.raise(event, &threshold, count).await,
            None => Ok(None),
        }
    }

    async fn persist(&self, alert: &SecurityAlert) -> StoreResult<()> {
        let key = self.keys.alert(&alert.id);
        let raw = serde_json::to_string(alert).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set_ex(&key, &raw, self.retention).await?;
        self.store
            .zadd_ex(
                &self.keys.alerts(),
                alert.triggered_at.timestamp_millis(),
                &alert.id,
                self.retention,
            )
            .await?;
        let floor = sub_saturating(alert.triggered_at, self.retention);
        self.store
            .zrem_range_by_score(
                &self.keys.alerts(),
                i64::MIN,
                floor.timestamp_millis().saturating_sub(1),
            )
            .await?;
        Ok(())
    }

    /// `[from, to]` 内的告警数
    pub async fn count_between(&self, from_ms: i64, to_ms: i64) -> StoreResult<u64> {
        self.store.zcount(&self.keys.alerts(), from_ms, to_ms).await
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<SecurityAlert>> {
        let key = self.keys.alert(id);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BlocklistConfig;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        clock: Arc<ManualClock>,
        log: Arc<EventLog>,
        blocks: Arc<BlockRegistry>,
        engine: AlertEngine,
        notified: Arc<AtomicUsize>,
    }

    fn harness(thresholds: ThresholdTable, cooldown: Option<Duration>) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(clock.clone()));
        let keys = KeySpace::default();
        let log = Arc::new(EventLog::new(
            store.clone(),
            keys.clone(),
            Duration::from_secs(7 * 86_400),
        ));
        let blocks = Arc::new(BlockRegistry::new(
            store.clone(),
            clock.clone(),
            keys.clone(),
            &BlocklistConfig::default(),
        ));
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let hook = FnNotifier::new("test", move |_alert: &SecurityAlert| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let failing = FnNotifier::new("broken", |_alert: &SecurityAlert| Err("down".to_string()));
        let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(failing), Arc::new(hook)];
        let engine = AlertEngine::new(
            store,
            clock.clone(),
            keys,
            log.clone(),
            blocks.clone(),
            thresholds,
            notifiers,
            Duration::from_secs(30 * 86_400),
            cooldown,
        );
        Harness {
            clock,
            log,
            blocks,
            engine,
            notified,
        }
    }

    async fn submit(h: &Harness, event_type: SecurityEventType, ip: &str) -> Option<SecurityAlert> {
        let event = SecurityEvent::new(event_type, ip, h.clock.now());
        h.log.append(&event).await.unwrap();
        h.engine.evaluate(&event).await.unwrap()
    }

    #[tokio::test]
    async fn test_threshold_reached_blocks_and_notifies_once() {
        let h = harness(ThresholdTable::default(), None);
        for _ in 0..4 {
            assert!(submit(&h, SecurityEventType::FailedLogin, "10.0.0.5").await.is_none());
            h.clock.advance(Duration::from_secs(10));
        }
        let alert = submit(&h, SecurityEventType::FailedLogin, "10.0.0.5")
            .await
            .unwrap();
        assert!(alert.auto_blocked);
        assert_eq!(alert.event_count, 5);
        assert_eq!(h.notified.load(Ordering::SeqCst), 1);

        let state = h
            .blocks
            .is_blocked(&BlockTarget::Ip("10.0.0.5".into()))
            .await
            .unwrap()
            .unwrap();
        assert!(state.reason.contains("failed_login"));
        assert_eq!(state.expires_at - state.blocked_at, chrono::Duration::minutes(30));

        let now = h.clock.now().timestamp_millis();
        assert_eq!(h.engine.count_between(now - 1000, now).await.unwrap(), 1);
        assert_eq!(h.engine.get(&alert.id).await.unwrap().unwrap(), alert);
    }

    #[tokio::test]
    async fn test_level_triggered_without_cooldown() {
        let h = harness(ThresholdTable::default(), None);
        let mut alerts = 0;
        for _ in 0..12 {
            if submit(&h, SecurityEventType::RateLimitExceeded, "1.1.1.1").await.is_some() {
                alerts += 1;
            }
        }
        // 第 10、11、12 个事件都会告警
        assert_eq!(alerts, 3);
        assert!(h
            .blocks
            .is_blocked(&BlockTarget::Ip("1.1.1.1".into()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cooldown_deduplicates() {
        let h = harness(ThresholdTable::default(), Some(Duration::from_secs(60)));
        let mut alerts = 0;
        for _ in 0..12 {
            if submit(&h, SecurityEventType::RateLimitExceeded, "1.1.1.1").await.is_some() {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_raises_respect_cooldown() {
        let h = Arc::new(harness(
            ThresholdTable::default(),
            Some(Duration::from_secs(60)),
        ));
        let threshold = ThresholdTable::default()
            .get(SecurityEventType::RateLimitExceeded)
            .unwrap()
            .clone();
        let event = SecurityEvent::new(SecurityEventType::RateLimitExceeded, "1.1.1.1", h.clock.now());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                let threshold = threshold.clone();
                let event = event.clone();
                tokio::spawn(async move { h.engine.raise(&event, &threshold, 10).await.unwrap() })
            })
            .collect();
        let mut raised = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                raised += 1;
            }
        }
        assert_eq!(raised, 1);
        assert_eq!(h.notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_thresholds_count_per_address_by_default() {
        let h = harness(ThresholdTable::default(), None);
        for i in 0..4 {
            let ip = format!("192.0.2.{}", i);
            assert!(submit(&h, SecurityEventType::FailedLogin, &ip).await.is_none());
        }
        // 类型总数已达 5，但该 IP 只有一次
        assert!(submit(&h, SecurityEventType::FailedLogin, "10.0.0.77").await.is_none());
        assert!(h
            .blocks
            .is_blocked(&BlockTarget::Ip("10.0.0.77".into()))
            .await
            .unwrap()
            .is_none());

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "failed_login".to_string(),
            ThresholdConfig {
                auto_block: Some(false),
                ..Default::default()
            },
        );
        overrides.insert(
            "sql_injection_attempt".to_string(),
            ThresholdConfig {
                group_by_ip: Some(false),
                ..Default::default()
            },
        );
        let table = ThresholdTable::with_overrides(&overrides).unwrap();
        assert!(!table.get(SecurityEventType::FailedLogin).unwrap().group_by_ip);
        assert!(!table.get(SecurityEventType::SqlInjectionAttempt).unwrap().group_by_ip);
        assert!(table.get(SecurityEventType::BruteForce).unwrap().group_by_ip);
        assert!(!table.get(SecurityEventType::RateLimitExceeded).unwrap().group_by_ip);
    }

    #[tokio::test]
    async fn test_group_by_ip_counts_per_address() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "failed_login".to_string(),
            ThresholdConfig {
                count: Some(2),
                group_by_ip: Some(true),
                ..Default::default()
            },
        );
        let h = harness(ThresholdTable::with_overrides(&overrides).unwrap(), None);
        assert!(submit(&h, SecurityEventType::FailedLogin, "10.0.0.1").await.is_none());
        assert!(submit(&h, SecurityEventType::FailedLogin, "10.0.0.2").await.is_none());
        assert!(submit(&h, SecurityEventType::FailedLogin, "10.0.0.1").await.is_some());
    }

    #[test]
    fn test_default_thresholds_cover_every_type() {
        let table = ThresholdTable::default();
        for t in SecurityEventType::ALL {
            let threshold = table.get(t).unwrap();
            assert!(threshold.count >= 1);
            assert!(!threshold.time_window.is_zero());
            assert_eq!(threshold.auto_block, !threshold.block_duration.is_zero());
        }
    }
}
