//! 进程内 Counter Store
//!
//! 所有原语都在同一把锁内完成，天然满足原子性要求；过期时间按注入的
//! `Clock` 计算，读取时惰性清理。适用于单实例部署和测试。
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    decaying_weight, AdmitOutcome, CounterStore, Increment, StoreError, StoreResult,
    WindowReading, WindowSpec, WindowStrategy,
};
use crate::clock::{millis, Clock};

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Str(String),
    /// member -> score
    ZSet(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    data: Mutex<HashMap<String, Entry>>,
    /// 故障注入：为 true 时所有操作返回连接错误
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// 模拟存储不可用
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 当前未过期的 key 数量
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.data
            .lock()
            .values()
            .filter(|e| e.expires_at_ms.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration) -> Option<i64> {
        Some(self.clock.now_ms().saturating_add(millis(ttl)))
    }
}

/// 取出未过期的条目，过期的顺手删除
fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str, now: i64) -> Option<&'a mut Entry> {
    let expired = data
        .get(key)
        .and_then(|e| e.expires_at_ms)
        .map_or(false, |at| at <= now);
    if expired {
        data.remove(key);
        return None;
    }
    data.get_mut(key)
}

fn read_int(data: &mut HashMap<String, Entry>, key: &str, now: i64) -> StoreResult<i64> {
    match live(data, key, now).map(|e| &e.value) {
        None => Ok(0),
        Some(Value::Int(v)) => Ok(*v),
        Some(Value::Str(s)) => s.parse().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: "not an integer".into(),
        }),
        Some(Value::ZSet(_)) => Err(wrong_type(key)),
    }
}

fn zset_mut<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
    now: i64,
) -> StoreResult<&'a mut HashMap<String, i64>> {
    if live(data, key, now).is_none() {
        data.insert(
            key.to_string(),
            Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at_ms: None,
            },
        );
    }
    match data.get_mut(key).map(|e| &mut e.value) {
        Some(Value::ZSet(set)) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key {}", key))
}

/// 裁剪滑动窗口并返回读数
fn sliding_reading(set: &mut HashMap<String, i64>, now_ms: i64, window: Duration) -> WindowReading {
    let floor = now_ms.saturating_sub(millis(window));
    set.retain(|_, score| *score >= floor);
    WindowReading {
        count: set.len() as u64,
        oldest_ms: set.values().min().copied(),
    }
}

impl MemoryStore {
    fn reading(
        &self,
        data: &mut HashMap<String, Entry>,
        spec: &WindowSpec,
        now_ms: i64,
        clock_now: i64,
    ) -> StoreResult<WindowReading> {
        match spec.strategy {
            WindowStrategy::Sliding => {
                // 只读路径不创建空集合
                if live(data, &spec.key, clock_now).is_none() {
                    return Ok(WindowReading::default());
                }
                let set = zset_mut(data, &spec.key, clock_now)?;
                Ok(sliding_reading(set, now_ms, spec.window))
            }
            WindowStrategy::Fixed => Ok(WindowReading {
                count: read_int(data, &spec.key, clock_now)?.max(0) as u64,
                oldest_ms: None,
            }),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn admit(
        &self,
        windows: &[WindowSpec],
        now_ms: i64,
        member: &str,
    ) -> StoreResult<AdmitOutcome> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        let mut outcome = AdmitOutcome::default();

        for (idx, spec) in windows.iter().enumerate() {
            let reading = self.reading(&mut data, spec, now_ms, clock_now)?;
            outcome.readings.push(reading);
            if reading.count.saturating_add(spec.cost.max(1)) > spec.limit {
                outcome.rejected = Some(idx);
                return Ok(outcome);
            }
        }

        for (spec, reading) in windows.iter().zip(outcome.readings.iter_mut()) {
            if spec.cost == 0 {
                continue;
            }
            let expires_at_ms = self.expiry(spec.ttl);
            match spec.strategy {
                WindowStrategy::Sliding => {
                    let set = zset_mut(&mut data, &spec.key, clock_now)?;
                    for n in 1..=spec.cost {
                        set.insert(format!("{}:{}", member, n), now_ms);
                    }
                    reading.oldest_ms = reading.oldest_ms.or(Some(now_ms));
                }
                WindowStrategy::Fixed => {
                    let current = read_int(&mut data, &spec.key, clock_now)?;
                    data.insert(
                        spec.key.clone(),
                        Entry {
                            value: Value::Int(current + spec.cost as i64),
                            expires_at_ms: None,
                        },
                    );
                }
            }
            if let Some(entry) = data.get_mut(&spec.key) {
                entry.expires_at_ms = expires_at_ms;
            }
            reading.count += spec.cost;
        }

        Ok(outcome)
    }

    async fn read_windows(
        &self,
        windows: &[WindowSpec],
        now_ms: i64,
    ) -> StoreResult<Vec<WindowReading>> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        windows
            .iter()
            .map(|spec| self.reading(&mut data, spec, now_ms, clock_now))
            .collect()
    }

    async fn incr_many(&self, ops: &[Increment]) -> StoreResult<Vec<i64>> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let value = read_int(&mut data, &op.key, clock_now)? + op.by;
            data.insert(
                op.key.clone(),
                Entry {
                    value: Value::Int(value),
                    expires_at_ms: self.expiry(op.ttl),
                },
            );
            results.push(value);
        }
        Ok(results)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        match live(&mut data, key, clock_now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Int(v)) => Ok(Some(v.to_string())),
            Some(Value::ZSet(_)) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at_ms: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        if live(&mut data, key, clock_now).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at_ms: self.expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> StoreResult<()> {
        self.check_available()?;
        let mut data = self.data.lock();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn zadd_ex(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl);
        let mut data = self.data.lock();
        zset_mut(&mut data, key, clock_now)?.insert(member.to_string(), score);
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at_ms = expires_at_ms;
        }
        Ok(())
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        match live(&mut data, key, clock_now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::ZSet(set)) => Ok(set
                .values()
                .filter(|score| (min..=max).contains(*score))
                .count() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        match live(&mut data, key, clock_now).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(set)) => {
                let mut members: Vec<(&String, &i64)> = set
                    .iter()
                    .filter(|(_, score)| (min..=max).contains(*score))
                    .collect();
                members.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
                Ok(members
                    .into_iter()
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|(m, _)| m.clone())
                    .collect())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        match live(&mut data, key, clock_now).map(|e| &mut e.value) {
            None => Ok(0),
            Some(Value::ZSet(set)) => {
                let before = set.len();
                set.retain(|_, score| !(min..=max).contains(&*score));
                Ok((before - set.len()) as u64)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        if let Some(Value::ZSet(set)) = live(&mut data, key, clock_now).map(|e| &mut e.value) {
            set.remove(member);
        }
        Ok(())
    }

    async fn add_decaying(
        &self,
        key: &str,
        member: &str,
        _weight: f64,
        now_ms: i64,
        horizon: Duration,
    ) -> StoreResult<f64> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let expires_at_ms = self.expiry(horizon);
        let mut data = self.data.lock();
        let set = zset_mut(&mut data, key, clock_now)?;
        let floor = now_ms.saturating_sub(millis(horizon));
        set.retain(|_, score| *score >= floor);
        set.insert(member.to_string(), now_ms);
        let total = set.keys().filter_map(|m| decaying_weight(m)).sum();
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at_ms = expires_at_ms;
        }
        Ok(total)
    }

    async fn decaying_total(
        &self,
        key: &str,
        now_ms: i64,
        horizon: Duration,
    ) -> StoreResult<f64> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut data = self.data.lock();
        let floor = now_ms.saturating_sub(millis(horizon));
        match live(&mut data, key, clock_now).map(|e| &e.value) {
            None => Ok(0.0),
            Some(Value::ZSet(set)) => Ok(set
                .iter()
                .filter(|(_, score)| **score >= floor)
                .filter_map(|(m, _)| decaying_weight(m))
                .sum()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
