//! 可注入时钟
//!
//! 窗口计算、封禁过期、事件时间戳都通过 `Clock` 取当前时间。
//! 生产环境使用 `SystemClock`；测试中用 `ManualClock` 精确控制时间边界。

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// 时间来源
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// 当前时间的 Unix 毫秒
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 向前推进
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add_saturating(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    /// 从整点开始，固定窗口的分桶边界与测试对齐
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// std Duration -> chrono Duration（溢出时饱和）
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`，溢出时饱和到 `MAX_UTC`
pub(crate) fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`，溢出时饱和到 `MIN_UTC`
pub(crate) fn sub_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// 毫秒时间戳 -> DateTime
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Duration 转毫秒（i64 饱和）
pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
