/// 事件时间序列
///
/// 每个事件写入三处：事件本体（带保留期的 KV）、按类型的有序集合、
/// 按 (类型, IP) 的有序集合；有序集合的 score 为事件自身的时间戳（毫秒），
/// 窗口计数以事件时间戳为准，与写入顺序无关。
use std::sync::Arc;
use std::time::Duration;

use super::{SecurityEvent, SecurityEventType};
use crate::clock::millis;
use crate::keys::KeySpace;
use crate::store::{CounterStore, StoreError, StoreResult};

pub struct EventLog {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    retention: Duration,
}

impl EventLog {
    pub fn new(store: Arc<dyn CounterStore>, keys: KeySpace, retention: Duration) -> Self {
        Self {
            store,
            keys,
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// 追加事件
    pub async fn append(&self, event: &SecurityEvent) -> StoreResult<()> {
        let type_name = event.event_type.as_str();
        let ts = event.timestamp.timestamp_millis();
        let raw = serde_json::to_string(event).map_err(|e| StoreError::Corrupt {
            key: self.keys.event(&event.id),
            reason: e.to_string(),
        })?;

        self.store
            .set_ex(&self.keys.event(&event.id), &raw, self.retention)
            .await?;

        let mut indexes = vec![self.keys.events(type_name)];
        if !event.ip_address.is_empty() {
            indexes.push(self.keys.events_by_ip(type_name, &event.ip_address));
        }

        // 写入后裁掉超出保留期的条目，索引每次写入都会续期
        let floor = ts.saturating_sub(millis(self.retention));
        for index in &indexes {
            self.store
                .zadd_ex(index, ts, &event.id, self.retention)
                .await?;
            self.store
                .zrem_range_by_score(index, i64::MIN, floor.saturating_sub(1))
                .await?;
        }
        Ok(())
    }

    /// `[end - window, end]` 内的事件数；指定 IP 时只统计该 IP
    pub async fn count_in_window(
        &self,
        event_type: SecurityEventType,
        ip: Option<&str>,
        end_ms: i64,
        window: Duration,
    ) -> StoreResult<u64> {
        let key = match ip {
            Some(ip) => self.keys.events_by_ip(event_type.as_str(), ip),
            None => self.keys.events(event_type.as_str()),
        };
        let start = end_ms.saturating_sub(millis(window));
        self.store.zcount(&key, start, end_ms).await
    }

    pub async fn count_between(
        &self,
        event_type: SecurityEventType,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<u64> {
        self.store
            .zcount(&self.keys.events(event_type.as_str()), from_ms, to_ms)
            .await
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<SecurityEvent>> {
        let key = self.keys.event(id);
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

    /// 最近的事件（按时间升序，最多 `limit` 条）
    pub async fn recent(
        &self,
        event_type: SecurityEventType,
        from_ms: i64,
        to_ms: i64,
        limit: usize,
    ) -> StoreResult<Vec<SecurityEvent>> {
        let ids = self
            .store
            .zrange_by_score(&self.keys.events(event_type.as_str()), from_ms, to_ms, Some(limit))
            .await?;
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = self.get(&id).await? {
                events.push(event);
            }
        }
        Ok(events)
    }
}
