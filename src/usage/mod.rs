//! Usage Recorder
//!
//! 在一次调用完成后把实际消耗（请求数、Token、费用）写入对应窗口，独立于准入检查。
//! 多个计数器在一次原子批量写入中更新；各窗口独立成 key，部分失败只会少计，不会多计。

pub mod cost;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use cost::{nanos_to_usd, CostModel, PerTokenRate, NANOS_PER_USD};

use crate::clock::{from_millis, Clock};
use crate::keys::KeySpace;
use crate::limiter::composite::{QuotaPlan, UNLIMITED};
use crate::limiter::window::entry_member;
use crate::limiter::{CallerIdentity, RateLimitKey, Scope, WindowTier};
use crate::store::{CounterStore, Increment, StoreResult, WindowReading, WindowSpec, WindowStrategy};

/// 最近请求时间的保留时长
const LAST_REQUEST_TTL: Duration = Duration::from_secs(2 * 86_400);

/// 用量种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Request,
    Token,
    /// 直接记录费用，单位为纳美元
    Cost,
}

/// 单个窗口的用量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub used: u64,
    /// 未启用的档位为 None
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
}

impl WindowUsage {
    fn new(reading: &WindowReading, limit: Option<u64>) -> Self {
        Self {
            used: reading.count,
            limit,
            remaining: limit.map(|l| l.saturating_sub(reading.count)),
        }
    }
}

/// `GetUsage` 的只读快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub identity: String,
    pub requests_per_minute: WindowUsage,
    pub requests_per_hour: WindowUsage,
    pub requests_per_day: WindowUsage,
    pub tokens_per_minute: WindowUsage,
    pub tokens_per_hour: WindowUsage,
    pub tokens_per_day: WindowUsage,
    pub cost_today_nanos: u64,
    pub cost_today_usd: f64,
    pub cost_limit_usd: Option<f64>,
    pub last_request: Option<DateTime<Utc>>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl UsageStats {
    /// 所有计数均为 0
    pub fn is_zero(&self) -> bool {
        [
            &self.requests_per_minute,
            &self.requests_per_hour,
            &self.requests_per_day,
            &self.tokens_per_minute,
            &self.tokens_per_hour,
            &self.tokens_per_day,
        ]
        .iter()
        .all(|w| w.used == 0)
            && self.cost_today_nanos == 0
    }
}

pub struct UsageRecorder {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    plan: QuotaPlan,
    cost_model: Arc<dyn CostModel>,
}

impl UsageRecorder {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        plan: QuotaPlan,
        cost_model: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            plan,
            cost_model,
        }
    }

    pub fn cost_model(&self) -> &Arc<dyn CostModel> {
        &self.cost_model
    }

    fn spec(
        &self,
        identity: &CallerIdentity,
        scope: Scope,
        tier: WindowTier,
        strategy: WindowStrategy,
        cost: u64,
        now_ms: i64,
    ) -> WindowSpec {
        let base = RateLimitKey::new(scope, identity.clone(), tier).to_key(&self.keys);
        strategy.spec(&base, tier.duration(), UNLIMITED, cost, now_ms)
    }

    /// 记录用量
    pub async fn record(&self, identity: &CallerIdentity, units: u64, kind: UsageKind) -> StoreResult<()> {
        if units == 0 {
            return Ok(());
        }
        let now_ms = self.clock.now_ms();
        match kind {
            UsageKind::Request => {
                let strategy = self.plan.request_strategy();
                let specs: Vec<WindowSpec> = WindowTier::ALL
                    .iter()
                    .map(|tier| self.spec(identity, Scope::Requests, *tier, strategy, units, now_ms))
                    .collect();
                self.store
                    .admit(&specs, now_ms, &entry_member(now_ms))
                    .await?;
            }
            UsageKind::Token => {
                let cost = self.cost_model.cost_nanos(units);
                let mut ops: Vec<Increment> = WindowTier::ALL
                    .iter()
                    .map(|tier| {
                        let spec =
                            self.spec(identity, Scope::Tokens, *tier, WindowStrategy::Fixed, 0, now_ms);
                        Increment {
                            key: spec.key,
                            by: units as i64,
                            ttl: spec.ttl,
                        }
                    })
                    .collect();
                if cost > 0 {
                    ops.push(self.cost_increment(identity, cost, now_ms));
                }
                self.store.incr_many(&ops).await?;
            }
            UsageKind::Cost => {
                let op = self.cost_increment(identity, units, now_ms);
                self.store.incr_many(std::slice::from_ref(&op)).await?;
            }
        }
        tracing::debug!("📈 记录用量: {} {:?} x{}", identity, kind, units);
        Ok(())
    }

    fn cost_increment(&self, identity: &CallerIdentity, nanos: u64, now_ms: i64) -> Increment {
        let spec = self.spec(
            identity,
            Scope::Cost,
            WindowTier::Day,
            WindowStrategy::Fixed,
            0,
            now_ms,
        );
        Increment {
            key: spec.key,
            by: nanos.min(i64::MAX as u64) as i64,
            ttl: spec.ttl,
        }
    }

    /// 记录 Token 用量（同时按成本模型累计费用）
    pub async fn record_tokens(&self, identity: &CallerIdentity, tokens: u64) -> StoreResult<()> {
        self.record(identity, tokens, UsageKind::Token).await?;
        self.touch(identity).await
    }

    /// 更新最近请求时间
    pub async fn touch(&self, identity: &CallerIdentity) -> StoreResult<()> {
        let now_ms = self.clock.now_ms();
        self.store
            .set_ex(
                &self.keys.last_request(&identity.key_part()),
                &now_ms.to_string(),
                LAST_REQUEST_TTL,
            )
            .await
    }

    /// 所有窗口的当前用量（不含封禁状态）
    pub async fn snapshot(&self, identity: &CallerIdentity) -> StoreResult<UsageStats> {
        let now_ms = self.clock.now_ms();
        let strategy = self.plan.request_strategy();
        let mut specs = Vec::with_capacity(7);
        for tier in WindowTier::ALL {
            specs.push(self.spec(identity, Scope::Requests, tier, strategy, 0, now_ms));
        }
        for tier in WindowTier::ALL {
            specs.push(self.spec(identity, Scope::Tokens, tier, WindowStrategy::Fixed, 0, now_ms));
        }
        specs.push(self.spec(
            identity,
            Scope::Cost,
            WindowTier::Day,
            WindowStrategy::Fixed,
            0,
            now_ms,
        ));

        let readings = self.store.read_windows(&specs, now_ms).await?;
        let reading = |idx: usize| readings.get(idx).copied().unwrap_or_default();
        let limit = |scope: Scope, tier: WindowTier| {
            self.plan
                .tier(scope, tier)
                .filter(|t| t.enforced)
                .map(|t| t.limit)
        };

        let last_request = self
            .store
            .get(&self.keys.last_request(&identity.key_part()))
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(from_millis);

        let cost_nanos = reading(6).count;
        Ok(UsageStats {
            identity: identity.to_string(),
            requests_per_minute: WindowUsage::new(&reading(0), limit(Scope::Requests, WindowTier::Minute)),
            requests_per_hour: WindowUsage::new(&reading(1), limit(Scope::Requests, WindowTier::Hour)),
            requests_per_day: WindowUsage::new(&reading(2), limit(Scope::Requests, WindowTier::Day)),
            tokens_per_minute: WindowUsage::new(&reading(3), limit(Scope::Tokens, WindowTier::Minute)),
            tokens_per_hour: WindowUsage::new(&reading(4), limit(Scope::Tokens, WindowTier::Hour)),
            tokens_per_day: WindowUsage::new(&reading(5), limit(Scope::Tokens, WindowTier::Day)),
            cost_today_nanos: cost_nanos,
            cost_today_usd: nanos_to_usd(cost_nanos),
            cost_limit_usd: limit(Scope::Cost, WindowTier::Day).map(nanos_to_usd),
            last_request,
            ..Default::default()
        })
    }

    /// 清空该身份的全部计数器
    pub async fn reset(&self, identity: &CallerIdentity) -> StoreResult<()> {
        let now_ms = self.clock.now_ms();
        let mut keys = Vec::with_capacity(20);
        for scope in [Scope::Requests, Scope::Tokens, Scope::Cost] {
            for tier in WindowTier::ALL {
                // 两种算法的 key 都删除，切换算法后也能清干净
                for strategy in [WindowStrategy::Sliding, WindowStrategy::Fixed] {
                    keys.push(self.spec(identity, scope, tier, strategy, 0, now_ms).key);
                }
            }
        }
        keys.push(self.keys.last_request(&identity.key_part()));
        self.store.del(&keys).await?;
        tracing::info!("🧹 已重置用量: {}", identity);
        Ok(())
    }
}
