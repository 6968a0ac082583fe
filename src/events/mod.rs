//! 安全事件模型
//!
//! 事件一旦创建即不可变（`resolved` / `resolved_at` 由运维后续设置）。

pub mod log;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use self::log::EventLog;
pub use self::pipeline::{EventPipeline, EventProcessor};

use crate::limiter::CallerIdentity;

/// 安全事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    FailedLogin,
    BruteForce,
    SqlInjectionAttempt,
    XssAttempt,
    PathTraversal,
    UnauthorizedAccess,
    PrivilegeEscalation,
    RateLimitExceeded,
    SuspiciousRequest,
    BlockedIpAccess,
}

impl SecurityEventType {
    pub const ALL: [SecurityEventType; 10] = [
        SecurityEventType::FailedLogin,
        SecurityEventType::BruteForce,
        SecurityEventType::SqlInjectionAttempt,
        SecurityEventType::XssAttempt,
        SecurityEventType::PathTraversal,
        SecurityEventType::UnauthorizedAccess,
        SecurityEventType::PrivilegeEscalation,
        SecurityEventType::RateLimitExceeded,
        SecurityEventType::SuspiciousRequest,
        SecurityEventType::BlockedIpAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::FailedLogin => "failed_login",
            SecurityEventType::BruteForce => "brute_force",
            SecurityEventType::SqlInjectionAttempt => "sql_injection_attempt",
            SecurityEventType::XssAttempt => "xss_attempt",
            SecurityEventType::PathTraversal => "path_traversal",
            SecurityEventType::UnauthorizedAccess => "unauthorized_access",
            SecurityEventType::PrivilegeEscalation => "privilege_escalation",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::SuspiciousRequest => "suspicious_request",
            SecurityEventType::BlockedIpAccess => "blocked_ip_access",
        }
    }

    /// 未显式指定时的事件严重度
    pub fn default_severity(&self) -> Severity {
        match self {
            SecurityEventType::SqlInjectionAttempt
            | SecurityEventType::PrivilegeEscalation
            | SecurityEventType::BruteForce => Severity::Critical,
            SecurityEventType::FailedLogin
            | SecurityEventType::XssAttempt
            | SecurityEventType::PathTraversal
            | SecurityEventType::UnauthorizedAccess => Severity::High,
            SecurityEventType::RateLimitExceeded | SecurityEventType::SuspiciousRequest => {
                Severity::Medium
            }
            SecurityEventType::BlockedIpAccess => Severity::Low,
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown security event type: {}", s))
    }
}

/// 严重度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// 可疑分数倍率
    pub fn multiplier(&self) -> f64 {
        match self {
            Severity::Low => 1.0,
            Severity::Medium => 2.0,
            Severity::High => 3.0,
            Severity::Critical => 5.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// 安全事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    /// 产生事件的组件，如 `gate`、`limiter`、`auth`
    pub source: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SecurityEvent {
    /// 以类型默认严重度创建事件，时间戳为 `timestamp`
    pub fn new(
        event_type: SecurityEventType,
        ip_address: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            severity: event_type.default_severity(),
            source: "application".to_string(),
            tenant_id: None,
            user_id: None,
            ip_address: ip_address.into(),
            user_agent: None,
            timestamp,
            description: String::new(),
            metadata: BTreeMap::new(),
            resolved: false,
            resolved_at: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_caller(mut self, identity: &CallerIdentity) -> Self {
        self.tenant_id = Some(identity.tenant_id.clone());
        self.user_id = identity.user_id.clone();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 标记为已处理
    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(at);
    }
}
