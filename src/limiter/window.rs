/// Window Accountant
///
/// 两种可互换的算法：
/// 1. 固定窗口：`{key}:{bucket}` 计数器，bucket = now / window，边界处最多突发 2x
/// 2. 滑动窗口：有序集合按时间戳存条目，裁剪 / 计数 / 条件写入在存储端一次原子完成
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::{from_millis, millis, Clock};
use crate::store::{CounterStore, StoreResult, WindowReading, WindowSpec, WindowStrategy};

/// 计数器 TTL 在窗口之外多保留的时间
const TTL_GRACE: Duration = Duration::from_secs(1);

impl WindowStrategy {
    /// 把基础 key 映射为本次检查使用的窗口参数
    pub fn spec(
        &self,
        base_key: &str,
        window: Duration,
        limit: u64,
        cost: u64,
        now_ms: i64,
    ) -> WindowSpec {
        let window_ms = millis(window).max(1);
        let (key, ttl) = match self {
            WindowStrategy::Sliding => (base_key.to_string(), window + TTL_GRACE),
            WindowStrategy::Fixed => {
                let bucket = now_ms.div_euclid(window_ms);
                let bucket_end = (bucket + 1).saturating_mul(window_ms);
                let left = Duration::from_millis((bucket_end - now_ms).max(1) as u64);
                (format!("{}:{}", base_key, bucket), left + TTL_GRACE)
            }
        };
        WindowSpec {
            key,
            strategy: *self,
            window,
            limit,
            cost,
            ttl,
        }
    }

    /// 窗口重置时间
    ///
    /// 固定窗口为当前分桶结束；滑动窗口为最早条目滑出窗口的时刻。
    pub fn reset_at(&self, window: Duration, reading: &WindowReading, now_ms: i64) -> DateTime<Utc> {
        let window_ms = millis(window).max(1);
        let at = match self {
            WindowStrategy::Fixed => (now_ms.div_euclid(window_ms) + 1).saturating_mul(window_ms),
            WindowStrategy::Sliding => reading
                .oldest_ms
                .unwrap_or(now_ms)
                .saturating_add(window_ms),
        };
        from_millis(at)
    }
}

/// 单窗口准入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u64,
    /// 当前窗口已用量（含本次）
    pub used: u64,
    /// `max(0, limit - used)`
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl Admission {
    pub(crate) fn from_reading(
        strategy: WindowStrategy,
        allowed: bool,
        window: Duration,
        limit: u64,
        reading: &WindowReading,
        now_ms: i64,
    ) -> Self {
        Self {
            allowed,
            limit,
            used: reading.count,
            remaining: limit.saturating_sub(reading.count),
            reset_at: strategy.reset_at(window, reading, now_ms),
        }
    }
}

/// 滑动窗口条目的唯一成员名
pub(crate) fn entry_member(now_ms: i64) -> String {
    format!("{}-{}", now_ms, Uuid::new_v4().simple())
}

/// 单窗口记账器
pub struct WindowAccountant {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    strategy: WindowStrategy,
}

impl WindowAccountant {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, strategy: WindowStrategy) -> Self {
        Self {
            store,
            clock,
            strategy,
        }
    }

    pub fn strategy(&self) -> WindowStrategy {
        self.strategy
    }

    /// 检查并消耗一个单位
    pub async fn admit(&self, key: &str, window: Duration, limit: u64) -> StoreResult<Admission> {
        let now_ms = self.clock.now_ms();
        let spec = self.strategy.spec(key, window, limit, 1, now_ms);
        let outcome = self
            .store
            .admit(std::slice::from_ref(&spec), now_ms, &entry_member(now_ms))
            .await?;
        let reading = outcome.readings.first().copied().unwrap_or_default();
        Ok(Admission::from_reading(
            self.strategy,
            outcome.admitted(),
            window,
            limit,
            &reading,
            now_ms,
        ))
    }

    /// 只读查看，不消耗
    pub async fn peek(&self, key: &str, window: Duration, limit: u64) -> StoreResult<Admission> {
        let now_ms = self.clock.now_ms();
        let spec = self.strategy.spec(key, window, limit, 0, now_ms);
        let readings = self
            .store
            .read_windows(std::slice::from_ref(&spec), now_ms)
            .await?;
        let reading = readings.first().copied().unwrap_or_default();
        Ok(Admission::from_reading(
            self.strategy,
            reading.count < limit,
            window,
            limit,
            &reading,
            now_ms,
        ))
    }
}
