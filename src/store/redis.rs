// RedisStore - Counter Store 的 Redis 实现
// 基于 bb8-redis 连接池；多窗口准入与衰减分数通过 Lua 脚本在服务端原子执行

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;

use super::{
    AdmitOutcome, CounterStore, Increment, StoreError, StoreResult, WindowReading, WindowSpec,
    WindowStrategy,
};
use crate::clock::millis;
use crate::config::RedisConfig;

/// 多窗口原子准入脚本
///
/// KEYS[i]  窗口 key
/// ARGV     now_ms, member, 然后每个窗口 5 个参数：strategy, window_ms, limit, cost, ttl_ms
/// 返回     {rejected(1-based, 0=通过), evaluated, count_1, oldest_1, count_2, oldest_2, ...}
///
/// 第一轮只裁剪和计数，任一窗口不满足立即返回；第二轮才写入，
/// 因此拒绝时任何窗口都不会被消耗。
const ADMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local member = ARGV[2]
local out = {0, 0}
for i = 1, #KEYS do
  local base = 2 + (i - 1) * 5
  local strategy = ARGV[base + 1]
  local window = tonumber(ARGV[base + 2])
  local limit = tonumber(ARGV[base + 3])
  local cost = tonumber(ARGV[base + 4])
  local key = KEYS[i]
  local count = 0
  local oldest = -1
  if strategy == 'sliding' then
    redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
    count = redis.call('ZCARD', key)
    local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    if #first > 0 then oldest = tonumber(first[2]) end
  else
    count = tonumber(redis.call('GET', key) or '0')
  end
  out[2] = i
  out[2 * i + 1] = count
  out[2 * i + 2] = oldest
  local need = cost
  if need < 1 then need = 1 end
  if count + need > limit then
    out[1] = i
    return out
  end
end
for i = 1, #KEYS do
  local base = 2 + (i - 1) * 5
  local strategy = ARGV[base + 1]
  local cost = tonumber(ARGV[base + 4])
  local ttl = tonumber(ARGV[base + 5])
  local key = KEYS[i]
  if cost > 0 then
    if strategy == 'sliding' then
      for n = 1, cost do
        redis.call('ZADD', key, now, member .. ':' .. n)
      end
      if out[2 * i + 2] < 0 then out[2 * i + 2] = now end
    else
      redis.call('INCRBY', key, cost)
    end
    redis.call('PEXPIRE', key, ttl)
    out[2 * i + 1] = out[2 * i + 1] + cost
  end
end
return out
"#;

/// 衰减累计脚本
///
/// ARGV now_ms, horizon_ms, member（空串表示只读）
/// 成员编码为 `{id}|{weight}`，返回字符串形式的权重总和以保留小数
const DECAY_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local horizon = tonumber(ARGV[2])
local member = ARGV[3]
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. (now - horizon))
if member ~= '' then
  redis.call('ZADD', KEYS[1], now, member)
  redis.call('PEXPIRE', KEYS[1], horizon)
end
local total = 0
for _, entry in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
  local weight = string.match(entry, '|([^|]+)$')
  if weight then total = total + tonumber(weight) end
end
return tostring(total)
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Redis Counter Store（基于连接池）
pub struct RedisStore {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// 单条命令 / 脚本的执行超时
    command_timeout: Duration,
    admit_script: Script,
    decay_script: Script,
}

impl RedisStore {
    /// 按 RedisConfig 创建连接池并做一次 PING
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let manager = RedisConnectionManager::new(config.url.clone()).map_err(|e| {
            StoreError::Connection(format!("Failed to create Redis manager: {}", e))
        })?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create Redis pool: {}", e)))?;

        let store = Self {
            pool: Arc::new(pool),
            command_timeout: config.command_timeout(),
            admit_script: Script::new(ADMIT_SCRIPT),
            decay_script: Script::new(DECAY_SCRIPT),
        };

        // 测试连接
        store
            .with_timeout(async {
                let mut conn = store.get_conn().await?;
                let _: String = conn.ping().await?;
                Ok(())
            })
            .await?;

        tracing::info!(
            "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms, idle_timeout={}s)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
            config.idle_timeout_secs,
        );

        Ok(store)
    }

    /// 连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    /// 上报连接池指标
    pub fn report_pool_metrics(&self) {
        let state = self.pool.state();
        crate::metrics::record_store_pool(
            state.connections.saturating_sub(state.idle_connections),
            state.idle_connections,
        );
    }

    async fn get_conn(
        &self,
    ) -> StoreResult<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to get Redis connection: {}", e)))
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.command_timeout.as_millis() as u64))?
    }
}

fn parse_admit(raw: &[i64]) -> StoreResult<AdmitOutcome> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        key: "admit-script".into(),
        reason: reason.into(),
    };
    if raw.len() < 2 {
        return Err(corrupt("short reply"));
    }
    let evaluated = raw[1].max(0) as usize;
    if raw.len() < 2 + evaluated * 2 {
        return Err(corrupt("truncated reply"));
    }
    let readings = (0..evaluated)
        .map(|i| {
            let count = raw[2 + i * 2].max(0) as u64;
            let oldest = raw[3 + i * 2];
            WindowReading {
                count,
                oldest_ms: (oldest >= 0).then_some(oldest),
            }
        })
        .collect();
    Ok(AdmitOutcome {
        rejected: (raw[0] > 0).then(|| (raw[0] - 1) as usize),
        readings,
    })
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn admit(
        &self,
        windows: &[WindowSpec],
        now_ms: i64,
        member: &str,
    ) -> StoreResult<AdmitOutcome> {
        if windows.is_empty() {
            return Ok(AdmitOutcome::default());
        }
        let mut invocation = self.admit_script.prepare_invoke();
        for spec in windows {
            invocation.key(&spec.key);
        }
        invocation.arg(now_ms).arg(member);
        for spec in windows {
            invocation
                .arg(spec.strategy.as_str())
                .arg(millis(spec.window))
                .arg(spec.limit.min(i64::MAX as u64))
                .arg(spec.cost)
                .arg(millis(spec.ttl).max(1));
        }

        let raw: Vec<i64> = self
            .with_timeout(async {
                let mut conn = self.get_conn().await?;
                Ok(invocation.invoke_async(&mut *conn).await?)
            })
            .await?;
        parse_admit(&raw)
    }

    async fn read_windows(
        &self,
        windows: &[WindowSpec],
        now_ms: i64,
    ) -> StoreResult<Vec<WindowReading>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut readings = Vec::with_capacity(windows.len());
            for spec in windows {
                let reading = match spec.strategy {
                    WindowStrategy::Sliding => {
                        let floor = now_ms.saturating_sub(millis(spec.window));
                        let count: u64 = redis::cmd("ZCOUNT")
                            .arg(&spec.key)
                            .arg(floor)
                            .arg("+inf")
                            .query_async(&mut *conn)
                            .await?;
                        let first: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
                            .arg(&spec.key)
                            .arg(floor)
                            .arg("+inf")
                            .arg("WITHSCORES")
                            .arg("LIMIT")
                            .arg(0)
                            .arg(1)
                            .query_async(&mut *conn)
                            .await?;
                        WindowReading {
                            count,
                            oldest_ms: first.first().map(|(_, score)| *score as i64),
                        }
                    }
                    WindowStrategy::Fixed => {
                        let value: Option<i64> = conn.get(&spec.key).await?;
                        WindowReading {
                            count: value.unwrap_or(0).max(0) as u64,
                            oldest_ms: None,
                        }
                    }
                };
                readings.push(reading);
            }
            Ok(readings)
        })
        .await
    }

    async fn incr_many(&self, ops: &[Increment]) -> StoreResult<Vec<i64>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            pipe.cmd("INCRBY").arg(&op.key).arg(op.by);
            pipe.cmd("PEXPIRE")
                .arg(&op.key)
                .arg(millis(op.ttl).max(1))
                .ignore();
        }
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let values: Vec<i64> = pipe.query_async(&mut *conn).await?;
            Ok(values)
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let value: Option<String> = conn.get(key).await?;
            Ok(value)
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl).max(1))
                .query_async::<()>(&mut *conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl).max(1))
                .query_async(&mut *conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.del::<_, ()>(keys).await?;
            Ok(())
        })
        .await
    }

    async fn zadd_ex(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl).max(1))
            .ignore();
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            pipe.query_async::<()>(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let count: u64 = conn.zcount(key, min, max).await?;
            Ok(count)
        })
        .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut cmd = redis::cmd("ZRANGEBYSCORE");
            cmd.arg(key).arg(min).arg(max);
            if let Some(limit) = limit {
                cmd.arg("LIMIT").arg(0).arg(limit);
            }
            let members: Vec<String> = cmd.query_async(&mut *conn).await?;
            Ok(members)
        })
        .await
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let removed: u64 = conn.zrembyscore(key, min, max).await?;
            Ok(removed)
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.zrem::<_, _, ()>(key, member).await?;
            Ok(())
        })
        .await
    }

    async fn add_decaying(
        &self,
        key: &str,
        member: &str,
        _weight: f64,
        now_ms: i64,
        horizon: Duration,
    ) -> StoreResult<f64> {
        self.run_decay(key, member, now_ms, horizon).await
    }

    async fn decaying_total(
        &self,
        key: &str,
        now_ms: i64,
        horizon: Duration,
    ) -> StoreResult<f64> {
        self.run_decay(key, "", now_ms, horizon).await
    }
}

impl RedisStore {
    async fn run_decay(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        horizon: Duration,
    ) -> StoreResult<f64> {
        let mut invocation = self.decay_script.prepare_invoke();
        invocation
            .key(key)
            .arg(now_ms)
            .arg(millis(horizon).max(1))
            .arg(member);
        let total: String = self
            .with_timeout(async {
                let mut conn = self.get_conn().await?;
                Ok(invocation.invoke_async(&mut *conn).await?)
            })
            .await?;
        total.parse().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("decay total is not a number: {}", total),
        })
    }
}
