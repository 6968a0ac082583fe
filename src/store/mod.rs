//! Counter Store 抽象
//!
//! 引擎所有跨进程协调都委托给 Counter Store 的原子原语：
//! - 多窗口检查并消耗（单次原子操作：裁剪 -> 计数 -> 条件写入）
//! - 批量原子自增
//! - 带 TTL 的 KV / 有序集合
//! - 按时间衰减的累计分数
//!
//! 两个实现：`RedisStore`（生产，Lua 脚本 + MULTI 管道）和
//! `MemoryStore`（单进程 / 测试，所有原语在同一把锁内执行）。
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// 窗口计数算法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    /// 有序集合滑动窗口，精确统计 `[now - window, now]`
    #[default]
    Sliding,
    /// 按窗口分桶的自增计数器，相邻桶边界可突发到 2x
    Fixed,
}

impl WindowStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStrategy::Sliding => "sliding",
            WindowStrategy::Fixed => "fixed",
        }
    }
}

/// 单个窗口的检查参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    /// 完整 key（固定窗口已包含分桶编号）
    pub key: String,
    pub strategy: WindowStrategy,
    pub window: Duration,
    pub limit: u64,
    /// 本次消耗的单位数，0 表示只检查不消耗
    pub cost: u64,
    /// 写入后 key 的过期时间
    pub ttl: Duration,
}

/// 窗口当前读数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowReading {
    pub count: u64,
    /// 滑动窗口内最早条目的时间戳（毫秒）
    pub oldest_ms: Option<i64>,
}

/// 多窗口准入结果
///
/// `rejected` 为第一个不满足的窗口下标；此时任何窗口都未被消耗，
/// `readings` 只包含已评估的窗口。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmitOutcome {
    pub rejected: Option<usize>,
    pub readings: Vec<WindowReading>,
}

impl AdmitOutcome {
    pub fn admitted(&self) -> bool {
        self.rejected.is_none()
    }
}

/// 批量自增中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    pub key: String,
    pub by: i64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("counter store command timed out after {0}ms")]
    Timeout(u64),
    #[error("counter store connection error: {0}")]
    Connection(String),
    #[error("counter store command failed: {0}")]
    Command(String),
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 原子地按顺序检查多个窗口；全部通过时才按 `cost` 消耗每个窗口
    async fn admit(
        &self,
        windows: &[WindowSpec],
        now_ms: i64,
        member: &str,
    ) -> StoreResult<AdmitOutcome>;

    /// 只读地获取各窗口计数
    async fn read_windows(
        &self,
        windows: &[WindowSpec],
        now_ms: i64,
    ) -> StoreResult<Vec<WindowReading>>;

    /// 单次原子批量自增，返回自增后的值
    async fn incr_many(&self, ops: &[Increment]) -> StoreResult<Vec<i64>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// key 不存在时写入（SET NX PX），返回是否写入成功
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn del(&self, keys: &[String]) -> StoreResult<()>;

    /// ZADD 并刷新整个集合的 TTL
    async fn zadd_ex(&self, key: &str, score: i64, member: &str, ttl: Duration)
        -> StoreResult<()>;

    /// 闭区间 `[min, max]` 内的成员数
    async fn zcount(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    /// 闭区间内的成员，按 score 升序
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>>;

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()>;

    /// 原子地追加一个带权重的条目并返回 `horizon` 内的权重总和
    ///
    /// 早于 `now_ms - horizon` 的条目会被裁剪，不再计入。
    async fn add_decaying(
        &self,
        key: &str,
        member: &str,
        weight: f64,
        now_ms: i64,
        horizon: Duration,
    ) -> StoreResult<f64>;

    /// `horizon` 内的权重总和（不写入）
    async fn decaying_total(&self, key: &str, now_ms: i64, horizon: Duration)
        -> StoreResult<f64>;
}

/// 衰减条目的成员编码：`{id}|{weight}`
pub fn decaying_member(id: &str, weight: f64) -> String {
    format!("{}|{}", id, weight)
}

/// 从成员中解析权重
pub(crate) fn decaying_weight(member: &str) -> Option<f64> {
    member.rsplit_once('|').and_then(|(_, w)| w.parse().ok())
}
