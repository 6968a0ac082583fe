/// 限流身份与 key 推导
///
/// 同一逻辑身份（scope, tenant, user|anonymous, window）总是映射到同一个
/// Counter Store key；各片段经过转义，不同身份之间不会碰撞。
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::keys::{escape, KeySpace};

/// 调用方身份（租户 + 可选用户）
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub tenant_id: String,
    pub user_id: Option<String>,
}

impl CallerIdentity {
    pub fn new(tenant_id: impl Into<String>, user_id: Option<impl Into<String>>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.map(Into::into),
        }
    }

    pub fn user(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    pub fn anonymous(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
        }
    }

    /// key 中的身份片段：`{tenant}:u.{user}` 或 `{tenant}:anonymous`
    ///
    /// 用户片段带 `u.` 前缀，名为 "anonymous" 的用户不会与匿名调用方冲突。
    pub fn key_part(&self) -> String {
        match &self.user_id {
            Some(user) => format!("{}:u.{}", escape(&self.tenant_id), escape(user)),
            None => format!("{}:anonymous", escape(&self.tenant_id)),
        }
    }

    /// 白名单匹配：`tenant/user`、`tenant/<anonymous>` 或 `tenant/*`
    pub fn matches(&self, entry: &str) -> bool {
        match entry.trim().split_once('/') {
            Some((tenant, "*")) => tenant == self.tenant_id,
            Some(_) => entry.trim() == self.to_string(),
            None => false,
        }
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user_id {
            Some(user) => write!(f, "{}/{}", self.tenant_id, user),
            None => write!(f, "{}/<anonymous>", self.tenant_id),
        }
    }
}

/// 计数维度
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Requests,
    Tokens,
    /// 费用（纳美元）
    Cost,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Requests => "requests",
            Scope::Tokens => "tokens",
            Scope::Cost => "cost",
        }
    }
}

/// 窗口档位
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowTier {
    Minute,
    Hour,
    Day,
}

impl WindowTier {
    pub const ALL: [WindowTier; 3] = [WindowTier::Minute, WindowTier::Hour, WindowTier::Day];

    pub fn duration(&self) -> Duration {
        match self {
            WindowTier::Minute => Duration::from_secs(60),
            WindowTier::Hour => Duration::from_secs(3600),
            WindowTier::Day => Duration::from_secs(86_400),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowTier::Minute => "minute",
            WindowTier::Hour => "hour",
            WindowTier::Day => "day",
        }
    }
}

/// 限流 key：(scope, tenant, user|anonymous, window)
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct RateLimitKey {
    pub scope: Scope,
    pub identity: CallerIdentity,
    pub tier: WindowTier,
}

impl RateLimitKey {
    pub fn new(scope: Scope, identity: CallerIdentity, tier: WindowTier) -> Self {
        Self {
            scope,
            identity,
            tier,
        }
    }

    /// 档位名称，如 `requests_per_minute`、`cost_per_day`
    pub fn limit_type(&self) -> &'static str {
        limit_type(self.scope, self.tier)
    }

    /// Counter Store 中的基础 key（固定窗口会再追加分桶编号）
    pub fn to_key(&self, keys: &KeySpace) -> String {
        keys.limit(
            self.scope.as_str(),
            &self.identity.key_part(),
            self.tier.as_str(),
        )
    }
}

pub fn limit_type(scope: Scope, tier: WindowTier) -> &'static str {
    match (scope, tier) {
        (Scope::Requests, WindowTier::Minute) => "requests_per_minute",
        (Scope::Requests, WindowTier::Hour) => "requests_per_hour",
        (Scope::Requests, WindowTier::Day) => "requests_per_day",
        (Scope::Tokens, WindowTier::Minute) => "tokens_per_minute",
        (Scope::Tokens, WindowTier::Hour) => "tokens_per_hour",
        (Scope::Tokens, WindowTier::Day) => "tokens_per_day",
        (Scope::Cost, WindowTier::Minute) => "cost_per_minute",
        (Scope::Cost, WindowTier::Hour) => "cost_per_hour",
        (Scope::Cost, WindowTier::Day) => "cost_per_day",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic_and_distinct() {
        let keys = KeySpace::new("rw");
        let a = RateLimitKey::new(
            Scope::Requests,
            CallerIdentity::user("acme", "42"),
            WindowTier::Minute,
        );
        let b = a.clone();
        assert_eq!(a.to_key(&keys), b.to_key(&keys));
        assert_eq!(a.to_key(&keys), "rw:rl:requests:acme:u.42:minute");

        let anon = RateLimitKey::new(
            Scope::Requests,
            CallerIdentity::anonymous("acme"),
            WindowTier::Minute,
        );
        let named_anon = RateLimitKey::new(
            Scope::Requests,
            CallerIdentity::user("acme", "anonymous"),
            WindowTier::Minute,
        );
        assert_ne!(anon.to_key(&keys), named_anon.to_key(&keys));

        // 分隔符被转义，不能伪造出其它租户的 key
        let tricky = CallerIdentity::user("acme:u.42", "x");
        assert_ne!(
            tricky.key_part(),
            CallerIdentity::user("acme", "42:x").key_part()
        );
    }

    #[test]
    fn test_limit_type_names() {
        let key = RateLimitKey::new(
            Scope::Cost,
            CallerIdentity::anonymous("t"),
            WindowTier::Day,
        );
        assert_eq!(key.limit_type(), "cost_per_day");
        assert_eq!(
            limit_type(Scope::Tokens, WindowTier::Hour),
            "tokens_per_hour"
        );
    }

    #[test]
    fn test_whitelist_matching() {
        let caller = CallerIdentity::user("acme", "ops");
        assert!(caller.matches("acme/ops"));
        assert!(caller.matches("acme/*"));
        assert!(!caller.matches("acme/dev"));
        assert!(!caller.matches("other/*"));
        assert!(CallerIdentity::anonymous("acme").matches("acme/<anonymous>"));
    }
}
