//! Suspicion Scorer
//!
//! 每个事件为来源 IP 增加 `base_score(type) × severity.multiplier()`，
//! 超过 horizon（默认 24h）的事件不再计分。累计分数达到标记阈值后，
//! 该 IP 在本地缓存中被标记为可疑；这只是提示信号，不会直接封禁流量。

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::SuspicionConfig;
use crate::events::{SecurityEvent, SecurityEventType};
use crate::keys::KeySpace;
use crate::store::{decaying_member, CounterStore, StoreResult};

/// 事件类型的基础分
pub fn base_score(event_type: SecurityEventType) -> f64 {
    match event_type {
        SecurityEventType::FailedLogin => 10.0,
        SecurityEventType::BruteForce => 30.0,
        SecurityEventType::SqlInjectionAttempt => 50.0,
        SecurityEventType::XssAttempt => 40.0,
        SecurityEventType::PathTraversal => 40.0,
        SecurityEventType::UnauthorizedAccess => 20.0,
        SecurityEventType::PrivilegeEscalation => 50.0,
        SecurityEventType::RateLimitExceeded => 5.0,
        SecurityEventType::SuspiciousRequest => 15.0,
        SecurityEventType::BlockedIpAccess => 5.0,
    }
}

pub struct SuspicionScorer {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    /// ip -> 标记时的分数
    flagged: Cache<String, f64>,
    mark_threshold: f64,
    horizon: Duration,
}

impl SuspicionScorer {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        config: &SuspicionConfig,
    ) -> Self {
        let horizon = config.horizon();
        let flagged = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(horizon)
            .build();
        Self {
            store,
            clock,
            keys,
            flagged,
            mark_threshold: config.mark_threshold,
            horizon,
        }
    }

    /// 累加事件分数，返回该 IP 当前总分
    pub async fn record(&self, event: &SecurityEvent) -> StoreResult<f64> {
        if event.ip_address.is_empty() {
            return Ok(0.0);
        }
        let weight = base_score(event.event_type) * event.severity.multiplier();
        let total = self
            .store
            .add_decaying(
                &self.keys.suspicion(&event.ip_address),
                &decaying_member(&event.id, weight),
                weight,
                event.timestamp.timestamp_millis(),
                self.horizon,
            )
            .await?;

        if total >= self.mark_threshold && !self.flagged.contains_key(&event.ip_address) {
            self.flagged.insert(event.ip_address.clone(), total).await;
            let index = self.keys.suspicious_index();
            let now_ms = self.clock.now_ms();
            self.store
                .zadd_ex(&index, now_ms, &event.ip_address, self.horizon)
                .await?;
            let floor = now_ms.saturating_sub(crate::clock::millis(self.horizon));
            self.store
                .zrem_range_by_score(&index, i64::MIN, floor.saturating_sub(1))
                .await?;
            tracing::warn!(
                "🕵️ IP {} 被标记为可疑 (score={:.1}, threshold={:.1})",
                event.ip_address,
                total,
                self.mark_threshold
            );
        }
        Ok(total)
    }

    /// 当前总分
    pub async fn score(&self, ip: &str) -> StoreResult<f64> {
        self.store
            .decaying_total(&self.keys.suspicion(ip), self.clock.now_ms(), self.horizon)
            .await
    }

    /// 本地标记优先，未命中时按存储中的分数判断
    pub async fn is_suspicious(&self, ip: &str) -> StoreResult<bool> {
        if self.flagged.contains_key(ip) {
            return Ok(true);
        }
        Ok(self.score(ip).await? >= self.mark_threshold)
    }

    /// horizon 内被标记过的 IP 数（全部实例）
    pub async fn suspicious_count(&self) -> StoreResult<u64> {
        let now_ms = self.clock.now_ms();
        let floor = now_ms.saturating_sub(crate::clock::millis(self.horizon));
        self.store
            .zcount(&self.keys.suspicious_index(), floor, i64::MAX)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::Severity;
    use crate::store::MemoryStore;

    fn scorer() -> (Arc<ManualClock>, SuspicionScorer) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let scorer = SuspicionScorer::new(
            store,
            clock.clone(),
            KeySpace::default(),
            &SuspicionConfig::default(),
        );
        (clock, scorer)
    }

    fn event(clock: &ManualClock, event_type: SecurityEventType, severity: Severity) -> SecurityEvent {
        SecurityEvent::new(event_type, "203.0.113.7", clock.now()).with_severity(severity)
    }

    #[tokio::test]
    async fn test_scores_accumulate_and_flag() {
        let (clock, scorer) = scorer();
        // 10 × 3 = 30
        let total = scorer
            .record(&event(&clock, SecurityEventType::FailedLogin, Severity::High))
            .await
            .unwrap();
        assert_eq!(total, 30.0);
        assert!(!scorer.is_suspicious("203.0.113.7").await.unwrap());

        // 15 × 2 = 30 -> 60
        let total = scorer
            .record(&event(&clock, SecurityEventType::SuspiciousRequest, Severity::Medium))
            .await
            .unwrap();
        assert_eq!(total, 60.0);
        assert!(scorer.is_suspicious("203.0.113.7").await.unwrap());
        assert_eq!(scorer.suspicious_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_old_events_stop_contributing() {
        let (clock, scorer) = scorer();
        scorer
            .record(&event(&clock, SecurityEventType::RateLimitExceeded, Severity::Low))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(23 * 3600));
        scorer
            .record(&event(&clock, SecurityEventType::RateLimitExceeded, Severity::Low))
            .await
            .unwrap();
        assert_eq!(scorer.score("203.0.113.7").await.unwrap(), 10.0);

        clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(scorer.score("203.0.113.7").await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_suspicious_index_is_pruned() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let keys = KeySpace::default();
        let scorer = SuspicionScorer::new(
            store.clone(),
            clock.clone(),
            keys.clone(),
            &SuspicionConfig::default(),
        );

        // 5 天内每 2 小时标记一个新 IP
        for i in 0..60 {
            let ip = format!("198.51.100.{}", i);
            let event = SecurityEvent::new(SecurityEventType::SqlInjectionAttempt, &ip, clock.now())
                .with_severity(Severity::Critical);
            scorer.record(&event).await.unwrap();
            clock.advance(Duration::from_secs(2 * 3600));
        }

        let stored = store
            .zcount(&keys.suspicious_index(), i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(stored, 13);
        assert_eq!(scorer.suspicious_count().await.unwrap(), 12);
    }
}
