/// 组合限流器
///
/// 按固定顺序持有多个档位（请求/分、请求/时、请求/天、Token、费用），
/// 所有档位在一次原子操作中检查：第一个超限的档位决定错误，且此时任何档位
/// 都不被消耗；全部通过时每个请求档位同时消耗一个单位。
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::key::{limit_type, CallerIdentity, RateLimitKey, Scope, WindowTier};
use super::window::{entry_member, Admission};
use crate::clock::Clock;
use crate::config::LimitsConfig;
use crate::error::EngineError;
use crate::keys::KeySpace;
use crate::store::{CounterStore, StoreResult, WindowSpec, WindowStrategy};

/// 请求档位关闭时仍然计数（供用量统计），上限取存储端可表示的最大值
pub(crate) const UNLIMITED: u64 = i64::MAX as u64;

/// 美元 -> 纳美元
pub(crate) fn usd_to_nanos(usd: f64) -> u64 {
    (usd * crate::usage::NANOS_PER_USD).round().max(0.0) as u64
}

/// 单个档位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub scope: Scope,
    pub window: WindowTier,
    pub strategy: WindowStrategy,
    /// 上限；费用档位单位为纳美元
    pub limit: u64,
    /// 通过时是否消耗（请求档位消耗 1，Token / 费用档位只检查）
    pub consumes: bool,
    /// 是否为配置启用的档位
    pub enforced: bool,
}

impl Tier {
    pub fn limit_type(&self) -> &'static str {
        limit_type(self.scope, self.window)
    }
}

/// 有序档位集合 + 白名单
#[derive(Debug, Clone, Default)]
pub struct QuotaPlan {
    tiers: Vec<Tier>,
    whitelist: Vec<String>,
}

impl QuotaPlan {
    pub fn new(tiers: Vec<Tier>, whitelist: Vec<String>) -> Self {
        Self { tiers, whitelist }
    }

    /// 从配置构建；顺序固定为请求(分/时/天) -> Token(分/时/天) -> 费用(天)
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        let mut tiers = Vec::with_capacity(7);
        for (window, limit) in [
            (WindowTier::Minute, limits.requests_per_minute),
            (WindowTier::Hour, limits.requests_per_hour),
            (WindowTier::Day, limits.requests_per_day),
        ] {
            tiers.push(Tier {
                scope: Scope::Requests,
                window,
                strategy: limits.strategy,
                limit: limit.unwrap_or(UNLIMITED),
                consumes: true,
                enforced: limit.is_some(),
            });
        }
        for (window, limit) in [
            (WindowTier::Minute, limits.tokens_per_minute),
            (WindowTier::Hour, limits.tokens_per_hour),
            (WindowTier::Day, limits.tokens_per_day),
        ] {
            if let Some(limit) = limit {
                tiers.push(Tier {
                    scope: Scope::Tokens,
                    window,
                    strategy: WindowStrategy::Fixed,
                    limit,
                    consumes: false,
                    enforced: true,
                });
            }
        }
        if let Some(cost) = limits.cost_limit_per_day {
            tiers.push(Tier {
                scope: Scope::Cost,
                window: WindowTier::Day,
                strategy: WindowStrategy::Fixed,
                limit: usd_to_nanos(cost),
                consumes: false,
                enforced: true,
            });
        }
        Self::new(tiers, limits.whitelisted_identities.clone())
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn tier(&self, scope: Scope, window: WindowTier) -> Option<&Tier> {
        self.tiers
            .iter()
            .find(|t| t.scope == scope && t.window == window)
    }

    pub fn request_strategy(&self) -> WindowStrategy {
        self.tier(Scope::Requests, WindowTier::Minute)
            .map(|t| t.strategy)
            .unwrap_or_default()
    }

    pub fn is_whitelisted(&self, identity: &CallerIdentity) -> bool {
        self.whitelist.iter().any(|entry| identity.matches(entry))
    }
}

/// 单个档位的只读状态
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub limit_type: &'static str,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub enforced: bool,
}

pub struct CompositeLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    plan: QuotaPlan,
}

impl CompositeLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        plan: QuotaPlan,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            plan,
        }
    }

    pub fn plan(&self) -> &QuotaPlan {
        &self.plan
    }

    /// 当前时间下各档位的窗口参数
    pub fn specs_for(&self, identity: &CallerIdentity, now_ms: i64, consume: bool) -> Vec<WindowSpec> {
        self.plan
            .tiers
            .iter()
            .map(|tier| {
                let base = RateLimitKey::new(tier.scope, identity.clone(), tier.window)
                    .to_key(&self.keys);
                let cost = if consume && tier.consumes { 1 } else { 0 };
                tier.strategy
                    .spec(&base, tier.window.duration(), tier.limit, cost, now_ms)
            })
            .collect()
    }

    /// 准入检查
    ///
    /// 白名单直接通过；存储错误以 `StoreUnavailable` 返回，由调用方按 fail mode 处理。
    pub async fn check(&self, identity: &CallerIdentity) -> Result<(), EngineError> {
        if self.plan.is_whitelisted(identity) {
            tracing::debug!("白名单调用方跳过限流: {}", identity);
            return Ok(());
        }

        let now_ms = self.clock.now_ms();
        let specs = self.specs_for(identity, now_ms, true);
        let outcome = self
            .store
            .admit(&specs, now_ms, &entry_member(now_ms))
            .await?;

        let Some(idx) = outcome.rejected else {
            tracing::debug!("✅ 准入通过: {}", identity);
            return Ok(());
        };

        let tier = &self.plan.tiers[idx];
        let reading = outcome.readings.get(idx).copied().unwrap_or_default();
        let retry_after = tier
            .strategy
            .reset_at(tier.window.duration(), &reading, now_ms);
        tracing::debug!(
            "🚫 {} 超限: {} (used={}, limit={})",
            identity,
            tier.limit_type(),
            reading.count,
            tier.limit
        );
        Err(EngineError::LimitExceeded {
            limit_type: tier.limit_type().to_string(),
            limit: tier.limit,
            retry_after,
        })
    }

    /// 各档位当前状态（不消耗）
    pub async fn snapshot(&self, identity: &CallerIdentity) -> StoreResult<Vec<TierStatus>> {
        let now_ms = self.clock.now_ms();
        let specs = self.specs_for(identity, now_ms, false);
        let readings = self.store.read_windows(&specs, now_ms).await?;
        Ok(self
            .plan
            .tiers
            .iter()
            .zip(readings.iter())
            .map(|(tier, reading)| {
                let admission = Admission::from_reading(
                    tier.strategy,
                    reading.count < tier.limit,
                    tier.window.duration(),
                    tier.limit,
                    reading,
                    now_ms,
                );
                TierStatus {
                    limit_type: tier.limit_type(),
                    limit: admission.limit,
                    used: admission.used,
                    remaining: admission.remaining,
                    reset_at: admission.reset_at,
                    enforced: tier.enforced,
                }
            })
            .collect())
    }
}
