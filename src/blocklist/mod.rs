//! Block Registry
//!
//! 显式拒绝条目（目标 -> 原因 + 过期时间），优先于任何计数器。
//! 读取先查本地 moka 缓存，未命中再查 Counter Store；过期条目视为不存在，
//! 并在读取时从存储和索引中删除。只缓存命中的封禁，缓存 TTL 不超过配置值。

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{add_saturating, Clock};
use crate::config::{BlocklistConfig, MAX_DURATION};
use crate::keys::{escape, KeySpace};
use crate::limiter::CallerIdentity;
use crate::store::{CounterStore, StoreError, StoreResult};

/// 活跃封禁索引的保留时长下限
const INDEX_TTL: Duration = Duration::from_secs(30 * 86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Ip,
    Caller,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Ip => "ip",
            BlockKind::Caller => "caller",
        }
    }
}

/// 封禁目标：网络地址或调用方身份
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockTarget {
    Ip(String),
    Caller(CallerIdentity),
}

impl BlockTarget {
    pub fn kind(&self) -> BlockKind {
        match self {
            BlockTarget::Ip(_) => BlockKind::Ip,
            BlockTarget::Caller(_) => BlockKind::Caller,
        }
    }

    /// 存储中的目标标识，同时作为索引成员
    fn storage_id(&self) -> String {
        match self {
            BlockTarget::Ip(ip) => format!("ip:{}", escape(ip.trim())),
            BlockTarget::Caller(identity) => format!("caller:{}", identity.key_part()),
        }
    }
}

impl fmt::Display for BlockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTarget::Ip(ip) => write!(f, "{}", ip),
            BlockTarget::Caller(identity) => write!(f, "{}", identity),
        }
    }
}

/// 封禁状态，`expires_at > blocked_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub target: String,
    pub kind: BlockKind,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlockState {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub struct BlockRegistry {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    /// storage key -> 封禁状态（仅缓存有效封禁）
    cache: Cache<String, BlockState>,
}

impl BlockRegistry {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        config: &BlocklistConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.local_cache_capacity)
            .time_to_live(config.local_cache_ttl().max(Duration::from_millis(1)))
            .build();
        Self {
            store,
            clock,
            keys,
            cache,
        }
    }

    /// 查询封禁状态；返回 None 表示未封禁
    pub async fn is_blocked(&self, target: &BlockTarget) -> StoreResult<Option<BlockState>> {
        let id = target.storage_id();
        let key = self.keys.block(&id);
        let now = self.clock.now();

        if let Some(state) = self.cache.get(&key).await {
            if state.is_active(now) {
                return Ok(Some(state));
            }
            self.cache.invalidate(&key).await;
        }

        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let state: BlockState = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        if !state.is_active(now) {
            // 惰性过期：读到即删除
            self.store.del(std::slice::from_ref(&key)).await?;
            self.store
                .zrem(&self.keys.block_index(target.kind().as_str()), &id)
                .await?;
            return Ok(None);
        }

        self.cache.insert(key, state.clone()).await;
        Ok(Some(state))
    }

    /// 写入封禁；已有封禁被新的过期时间覆盖（后写者生效，不叠加）
    ///
    /// 时长限制在 `[1ms, MAX_DURATION]` 内。
    pub async fn block(
        &self,
        target: &BlockTarget,
        duration: Duration,
        reason: &str,
    ) -> StoreResult<BlockState> {
        let duration = duration.clamp(Duration::from_millis(1), MAX_DURATION);
        let blocked_at = self.clock.now();
        let state = BlockState {
            target: target.to_string(),
            kind: target.kind(),
            reason: reason.to_string(),
            blocked_at,
            expires_at: add_saturating(blocked_at, duration),
        };

        let id = target.storage_id();
        let key = self.keys.block(&id);
        let raw = serde_json::to_string(&state).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        self.store.set_ex(&key, &raw, duration).await?;
        self.store
            .zadd_ex(
                &self.keys.block_index(target.kind().as_str()),
                state.expires_at.timestamp_millis(),
                &id,
                duration.max(INDEX_TTL),
            )
            .await?;
        self.cache.insert(key, state.clone()).await;

        tracing::warn!(
            "⛔ 已封禁 {} {}，至 {}: {}",
            target.kind().as_str(),
            target,
            state.expires_at,
            reason
        );
        Ok(state)
    }

    pub async fn unblock(&self, target: &BlockTarget) -> StoreResult<()> {
        let id = target.storage_id();
        let key = self.keys.block(&id);
        self.store.del(std::slice::from_ref(&key)).await?;
        self.store
            .zrem(&self.keys.block_index(target.kind().as_str()), &id)
            .await?;
        self.cache.invalidate(&key).await;
        tracing::info!("🔓 已解除封禁: {}", target);
        Ok(())
    }

    /// 当前有效封禁数
    pub async fn active_count(&self, kind: BlockKind) -> StoreResult<u64> {
        let index = self.keys.block_index(kind.as_str());
        let now_ms = self.clock.now_ms();
        self.store.zrem_range_by_score(&index, i64::MIN, now_ms).await?;
        self.store.zcount(&index, now_ms.saturating_add(1), i64::MAX).await
    }

    /// 列出当前有效封禁
    pub async fn list_active(&self, kind: BlockKind, limit: usize) -> StoreResult<Vec<BlockState>> {
        let index = self.keys.block_index(kind.as_str());
        let now_ms = self.clock.now_ms();
        let ids = self
            .store
            .zrange_by_score(&index, now_ms.saturating_add(1), i64::MAX, Some(limit))
            .await?;

        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(raw) = self.store.get(&self.keys.block(&id)).await? else {
                continue;
            };
            match serde_json::from_str::<BlockState>(&raw) {
                Ok(state) if state.is_active(self.clock.now()) => states.push(state),
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ 跳过无法解析的封禁记录 {}: {}", id, e),
            }
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn registry() -> (Arc<ManualClock>, Arc<MemoryStore>, BlockRegistry) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let registry = BlockRegistry::new(
            store.clone(),
            clock.clone(),
            KeySpace::default(),
            &BlocklistConfig::default(),
        );
        (clock, store, registry)
    }

    #[tokio::test]
    async fn test_block_expires_at_boundary() {
        let (clock, _store, registry) = registry();
        let ip = BlockTarget::Ip("10.0.0.9".into());
        registry
            .block(&ip, Duration::from_secs(60), "manual")
            .await
            .unwrap();

        clock.advance(Duration::from_millis(59_999));
        assert!(registry.is_blocked(&ip).await.unwrap().is_some());

        clock.advance(Duration::from_millis(2));
        assert!(registry.is_blocked(&ip).await.unwrap().is_none());
        assert_eq!(registry.active_count(BlockKind::Ip).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_later_block_overwrites() {
        let (clock, _store, registry) = registry();
        let ip = BlockTarget::Ip("10.0.0.1".into());
        registry
            .block(&ip, Duration::from_secs(3600), "long")
            .await
            .unwrap();
        let state = registry
            .block(&ip, Duration::from_secs(10), "short")
            .await
            .unwrap();
        assert_eq!(state.reason, "short");

        clock.advance(Duration::from_secs(11));
        assert!(registry.is_blocked(&ip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unblock_and_listing() {
        let (_clock, _store, registry) = registry();
        let a = BlockTarget::Ip("1.1.1.1".into());
        let b = BlockTarget::Ip("2.2.2.2".into());
        let caller = BlockTarget::Caller(CallerIdentity::user("acme", "7"));
        for target in [&a, &b, &caller] {
            registry
                .block(target, Duration::from_secs(300), "test")
                .await
                .unwrap();
        }
        assert_eq!(registry.active_count(BlockKind::Ip).await.unwrap(), 2);
        assert_eq!(registry.active_count(BlockKind::Caller).await.unwrap(), 1);

        registry.unblock(&a).await.unwrap();
        assert!(registry.is_blocked(&a).await.unwrap().is_none());
        let listed = registry.list_active(BlockKind::Ip, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target, "2.2.2.2");
    }

    #[tokio::test]
    async fn test_oversized_duration_is_capped() {
        let (clock, _store, registry) = registry();
        let ip = BlockTarget::Ip("1.2.3.4".into());
        let state = registry
            .block(&ip, Duration::from_secs(u64::MAX / 2), "forever")
            .await
            .unwrap();
        assert_eq!(
            (state.expires_at - state.blocked_at).num_seconds() as u64,
            MAX_DURATION.as_secs()
        );

        clock.advance(Duration::from_secs(365 * 86_400));
        let found = registry.is_blocked(&ip).await.unwrap().unwrap();
        assert_eq!(found.reason, "forever");
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let (_clock, store, registry) = registry();
        store.set_failing(true);
        let err = registry
            .is_blocked(&BlockTarget::Ip("3.3.3.3".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }
}
