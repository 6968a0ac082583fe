//! Counter Store 的 key 命名空间
//!
//! 所有 key 由前缀 + 固定段 + 转义后的身份片段拼成，保证同一逻辑身份
//! 始终映射到同一个 key，且不同身份之间不会碰撞。

/// 转义 key 片段中的分隔符
pub(crate) fn escape(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 限流计数器基础 key：`{prefix}:rl:{scope}:{identity}:{window}`
    pub fn limit(&self, scope: &str, identity: &str, window: &str) -> String {
        format!("{}:rl:{}:{}:{}", self.prefix, scope, identity, window)
    }

    pub fn last_request(&self, identity: &str) -> String {
        format!("{}:last:{}", self.prefix, identity)
    }

    pub fn block(&self, target: &str) -> String {
        format!("{}:block:{}", self.prefix, target)
    }

    /// 活跃封禁索引（按目标类型分开，score = 过期时间）
    pub fn block_index(&self, kind: &str) -> String {
        format!("{}:blocks:{}", self.prefix, kind)
    }

    pub fn events(&self, event_type: &str) -> String {
        format!("{}:events:{}", self.prefix, event_type)
    }

    pub fn events_by_ip(&self, event_type: &str, ip: &str) -> String {
        format!("{}:events:{}:ip:{}", self.prefix, event_type, escape(ip))
    }

    pub fn event(&self, id: &str) -> String {
        format!("{}:event:{}", self.prefix, id)
    }

    pub fn alerts(&self) -> String {
        format!("{}:alerts", self.prefix)
    }

    pub fn alert(&self, id: &str) -> String {
        format!("{}:alert:{}", self.prefix, id)
    }

    /// 告警冷却标记：`{prefix}:alert-cooldown:{type}:{ip}`
    pub fn alert_cooldown(&self, event_type: &str, ip: &str) -> String {
        format!("{}:alert-cooldown:{}:{}", self.prefix, event_type, escape(ip))
    }

    pub fn suspicion(&self, ip: &str) -> String {
        format!("{}:suspicion:{}", self.prefix, escape(ip))
    }

    pub fn suspicious_index(&self) -> String {
        format!("{}:suspicious", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("ratewarden")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_separators() {
        assert_eq!(escape("a:b"), "a%3Ab");
        assert_eq!(escape("50%"), "50%25");
        assert_ne!(escape("a:b"), escape("a%3Ab"));
    }

    #[test]
    fn test_limit_key_layout() {
        let keys = KeySpace::new("rw");
        assert_eq!(
            keys.limit("requests", "acme:u.42", "minute"),
            "rw:rl:requests:acme:u.42:minute"
        );
    }
}
