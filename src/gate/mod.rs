//! Intrusion-Detection Gate
//!
//! 请求路径上的安全检查：
//! 1. 解析客户端 IP（X-Forwarded-For 取第一个，其次 X-Real-IP，最后是对端地址）
//! 2. IP 已被封禁时立即拒绝，并提交 `blocked_ip_access` 事件
//! 3. 否则对 path / query / 部分请求头 / method / User-Agent 做启发式匹配；
//!    命中只提交 `suspicious_request` 事件，不拦截请求本身

pub mod middleware;

use axum::http::{HeaderMap, Method, Uri};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::blocklist::{BlockRegistry, BlockTarget};
use crate::clock::Clock;
use crate::config::FailMode;
use crate::error::EngineError;
use crate::events::pipeline::EventPipeline;
use crate::events::{SecurityEvent, SecurityEventType};

/// 参与启发式检查的请求头
const INSPECTED_HEADERS: [&str; 4] = ["referer", "cookie", "x-original-url", "x-rewrite-url"];

/// 允许的 HTTP 方法
const ALLOWED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// 片段截断长度，避免把超长载荷写进事件
const MAX_FRAGMENT: usize = 128;

/// 从请求头提取客户端 IP；都没有时使用对端地址
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<String> {
    let first_forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(ip) = first_forwarded {
        return Some(ip.to_string());
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }

    peer.map(|ip| ip.to_string())
}

/// 待检查的请求
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// 对端 socket 地址
    pub peer: Option<IpAddr>,
}

impl RequestMeta {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, peer: Option<IpAddr>) -> Self {
        Self {
            method,
            uri,
            headers,
            peer,
        }
    }

    pub fn client_ip(&self) -> Option<String> {
        resolve_client_ip(&self.headers, self.peer)
    }

    fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signature {
    PathTraversal,
    ScriptInjection,
    SqlInjection,
    CredentialDisclosure,
    UnusualMethod,
    ScannerUserAgent,
}

impl Signature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signature::PathTraversal => "path_traversal",
            Signature::ScriptInjection => "script_injection",
            Signature::SqlInjection => "sql_injection",
            Signature::CredentialDisclosure => "credential_disclosure",
            Signature::UnusualMethod => "unusual_method",
            Signature::ScannerUserAgent => "scanner_user_agent",
        }
    }
}

/// 一次命中：签名、位置（path / query / header 名 / method / user-agent）、命中片段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub signature: Signature,
    pub location: String,
    pub fragment: String,
}

/// 启发式签名匹配（大小写不敏感，覆盖常见 URL 编码形式）
#[derive(Debug, Clone)]
pub struct HeuristicScanner {
    content_rules: Vec<(Signature, Regex)>,
    scanner_agents: Regex,
}

impl HeuristicScanner {
    pub fn new() -> Result<Self, regex::Error> {
        let rule = |pattern: &str| RegexBuilder::new(pattern).case_insensitive(true).build();
        let content_rules = vec![
            (
                Signature::PathTraversal,
                rule(r"(\.\./|\.\.\\|\.\.%2f|\.\.%5c|%2e%2e(/|\\|%2f|%5c)|%252e%252e)")?,
            ),
            (
                Signature::ScriptInjection,
                rule(r"(<script|%3cscript|javascript:|vbscript:|onerror\s*=|onload\s*=|<iframe|%3ciframe|document\.cookie)")?,
            ),
            (
                Signature::SqlInjection,
                rule(r"(\bunion(\s|\+|%20)+(all(\s|\+|%20)+)?select\b|\bdrop(\s|\+|%20)+table\b|\binsert(\s|\+|%20)+into\b|\bdelete(\s|\+|%20)+from\b|'(\s|\+|%20)*or(\s|\+|%20)*'?\d*'?(\s|\+|%20)*=|\bor(\s|\+|%20)+1(\s|\+|%20)*=(\s|\+|%20)*1\b|\bsleep\(\s*\d+\s*\)|\bbenchmark\(|;(\s|\+|%20)*shutdown\b)")?,
            ),
            (
                Signature::CredentialDisclosure,
                rule(r"(/\.env\b|/\.git(/|\b)|/\.ssh/|/\.aws/credentials|/\.htpasswd|/etc/passwd|/etc/shadow|wp-config\.php|\bid_rsa\b)")?,
            ),
        ];
        let scanner_agents = rule(
            r"(sqlmap|nikto|nmap|masscan|zgrab|acunetix|nessus|openvas|dirbuster|gobuster|wpscan|w3af|havij|nuclei)",
        )?;
        Ok(Self {
            content_rules,
            scanner_agents,
        })
    }

    /// 返回全部命中；同一位置同一签名只报告一次
    pub fn scan(&self, meta: &RequestMeta) -> Vec<Finding> {
        let mut findings = Vec::new();

        let method = meta.method.as_str();
        if !ALLOWED_METHODS.contains(&method) {
            findings.push(Finding {
                signature: Signature::UnusualMethod,
                location: "method".to_string(),
                fragment: truncate(method),
            });
        }

        self.scan_content("path", meta.uri.path(), &mut findings);
        if let Some(query) = meta.uri.query() {
            self.scan_content("query", query, &mut findings);
        }
        for name in INSPECTED_HEADERS {
            if let Some(value) = meta.headers.get(name).and_then(|v| v.to_str().ok()) {
                self.scan_content(name, value, &mut findings);
            }
        }

        if let Some(ua) = meta.user_agent() {
            if let Some(m) = self.scanner_agents.find(ua) {
                findings.push(Finding {
                    signature: Signature::ScannerUserAgent,
                    location: "user-agent".to_string(),
                    fragment: truncate(m.as_str()),
                });
            }
        }
        findings
    }

    fn scan_content(&self, location: &str, value: &str, findings: &mut Vec<Finding>) {
        for (signature, regex) in &self.content_rules {
            if let Some(m) = regex.find(value) {
                findings.push(Finding {
                    signature: *signature,
                    location: location.to_string(),
                    fragment: truncate(m.as_str()),
                });
            }
        }
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(MAX_FRAGMENT).collect()
}

/// 检查结果
#[derive(Debug, Clone)]
pub enum GateVerdict {
    /// 放行；`findings` 非空时已提交 `suspicious_request` 事件
    Allow {
        client_ip: Option<String>,
        findings: Vec<Finding>,
    },
    /// 拒绝：`Blocked`（对外只显示 "temporarily restricted"），
    /// 或 fail-closed 时的 `StoreUnavailable`
    Deny {
        client_ip: Option<String>,
        error: EngineError,
    },
}

impl GateVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateVerdict::Allow { .. })
    }

    pub fn client_ip(&self) -> Option<&str> {
        match self {
            GateVerdict::Allow { client_ip, .. } | GateVerdict::Deny { client_ip, .. } => {
                client_ip.as_deref()
            }
        }
    }

    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            GateVerdict::Allow { .. } => Ok(()),
            GateVerdict::Deny { error, .. } => Err(error),
        }
    }
}

pub struct IntrusionGate {
    blocks: Arc<BlockRegistry>,
    scanner: HeuristicScanner,
    pipeline: Arc<EventPipeline>,
    clock: Arc<dyn Clock>,
    fail_mode: FailMode,
}

impl IntrusionGate {
    pub fn new(
        blocks: Arc<BlockRegistry>,
        scanner: HeuristicScanner,
        pipeline: Arc<EventPipeline>,
        clock: Arc<dyn Clock>,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            blocks,
            scanner,
            pipeline,
            clock,
            fail_mode,
        }
    }

    pub async fn inspect(&self, meta: &RequestMeta) -> GateVerdict {
        let client_ip = meta.client_ip();

        if let Some(ip) = client_ip.as_deref() {
            match self.blocks.is_blocked(&BlockTarget::Ip(ip.to_string())).await {
                Ok(Some(state)) => {
                    warn!(
                        "⛔ 拒绝已封禁 IP {} 的请求 {} {} (until {})",
                        ip,
                        meta.method,
                        meta.uri.path(),
                        state.expires_at
                    );
                    crate::metrics::record_blocked("ip");
                    let event = self
                        .event(SecurityEventType::BlockedIpAccess, ip, meta)
                        .with_description(format!("request from blocked ip: {}", state.reason));
                    self.pipeline.submit(event);
                    return GateVerdict::Deny {
                        client_ip,
                        error: EngineError::Blocked {
                            reason: state.reason,
                            retry_after: state.expires_at,
                        },
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    error!("❌ 查询 IP {} 封禁状态失败: {}", ip, e);
                    if self.fail_mode == FailMode::Closed {
                        return GateVerdict::Deny {
                            client_ip,
                            error: EngineError::StoreUnavailable(e),
                        };
                    }
                    crate::metrics::record_fail_open("gate");
                    warn!("⚠️ 存储不可用，按 fail-open 放行 IP {}", ip);
                }
            }
        }

        let findings = self.scanner.scan(meta);
        if !findings.is_empty() {
            let ip = client_ip.as_deref().unwrap_or_default();
            let signatures: Vec<&str> = findings.iter().map(|f| f.signature.as_str()).collect();
            debug!(
                "🔍 可疑请求 {} {} from {}: {:?}",
                meta.method,
                meta.uri.path(),
                ip,
                signatures
            );
            let event = self
                .event(SecurityEventType::SuspiciousRequest, ip, meta)
                .with_description(format!("heuristic match: {}", signatures.join(", ")))
                .with_metadata("signatures", serde_json::json!(signatures))
                .with_metadata(
                    "findings",
                    serde_json::to_value(&findings).unwrap_or_default(),
                );
            self.pipeline.submit(event);
        }

        GateVerdict::Allow {
            client_ip,
            findings,
        }
    }

    fn event(&self, event_type: SecurityEventType, ip: &str, meta: &RequestMeta) -> SecurityEvent {
        let mut event = SecurityEvent::new(event_type, ip, self.clock.now())
            .with_source("gate")
            .with_metadata("method", meta.method.as_str())
            .with_metadata("path", meta.uri.path());
        if let Some(ua) = meta.user_agent() {
            event = event.with_user_agent(ua);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BlocklistConfig;
    use crate::events::pipeline::EventProcessor;
    use crate::keys::KeySpace;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<SecurityEvent>>,
    }

    #[async_trait]
    impl EventProcessor for Collect {
        async fn process(&self, event: SecurityEvent) {
            self.events.lock().push(event);
        }
    }

    fn meta(method: Method, uri: &str, headers: HeaderMap) -> RequestMeta {
        RequestMeta::new(
            method,
            uri.parse().unwrap(),
            headers,
            Some("192.0.2.10".parse().unwrap()),
        )
    }

    fn gate() -> (Arc<BlockRegistry>, Arc<Collect>, Arc<EventPipeline>, IntrusionGate) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let blocks = Arc::new(BlockRegistry::new(
            store,
            clock.clone(),
            KeySpace::default(),
            &BlocklistConfig::default(),
        ));
        let collect = Arc::new(Collect::default());
        let pipeline = Arc::new(EventPipeline::start(64, 1, collect.clone()));
        let gate = IntrusionGate::new(
            blocks.clone(),
            HeuristicScanner::new().unwrap(),
            pipeline.clone(),
            clock,
            FailMode::Open,
        );
        (blocks, collect, pipeline, gate)
    }

    #[test]
    fn test_resolve_client_ip_prefers_forwarded_headers() {
        let peer = Some("192.0.2.10".parse().unwrap());
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_client_ip(&headers, peer).as_deref(), Some("192.0.2.10"));

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(resolve_client_ip(&headers, peer).as_deref(), Some("198.51.100.2"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.9 , 10.0.0.1"),
        );
        assert_eq!(resolve_client_ip(&headers, peer).as_deref(), Some("203.0.113.9"));
        assert_eq!(resolve_client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_scanner_signatures() {
        let scanner = HeuristicScanner::new().unwrap();
        let clean = scanner.scan(&meta(Method::GET, "/api/v1/items?page=2&sort=name", HeaderMap::new()));
        assert!(clean.is_empty());

        let cases = [
            ("/static/..%2F..%2Fetc/hosts", Signature::PathTraversal),
            ("/search?q=%3Cscript%3Ealert(1)", Signature::ScriptInjection),
            ("/items?id=1+UNION+SELECT+password", Signature::SqlInjection),
            ("/items?id=1'%20or%20'1'='1", Signature::SqlInjection),
            ("/.env", Signature::CredentialDisclosure),
            ("/app/.git/config", Signature::CredentialDisclosure),
        ];
        for (uri, expected) in cases {
            let findings = scanner.scan(&meta(Method::GET, uri, HeaderMap::new()));
            assert!(
                findings.iter().any(|f| f.signature == expected),
                "{} should match {:?}, got {:?}",
                uri,
                expected,
                findings
            );
        }

        let trace = Method::from_bytes(b"TRACE").unwrap();
        let findings = scanner.scan(&meta(trace, "/", HeaderMap::new()));
        assert_eq!(findings[0].signature, Signature::UnusualMethod);

        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("sqlmap/1.7.2#stable"));
        let findings = scanner.scan(&meta(Method::GET, "/", headers));
        assert_eq!(findings[0].signature, Signature::ScannerUserAgent);
        assert_eq!(findings[0].fragment, "sqlmap");
    }

    #[tokio::test]
    async fn test_heuristic_match_allows_but_emits_event() {
        let (_blocks, collect, pipeline, gate) = gate();
        let verdict = gate
            .inspect(&meta(Method::GET, "/../../etc/passwd", HeaderMap::new()))
            .await;
        assert!(verdict.is_allowed());
        assert!(pipeline.wait_idle(Duration::from_secs(5)).await);

        let events = collect.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::SuspiciousRequest);
        assert_eq!(events[0].ip_address, "192.0.2.10");
    }

    #[tokio::test]
    async fn test_blocked_ip_denied_with_generic_message() {
        let (blocks, collect, pipeline, gate) = gate();
        blocks
            .block(
                &BlockTarget::Ip("192.0.2.10".to_string()),
                Duration::from_secs(600),
                "auto-block: sql_injection_attempt threshold reached (1 events within 60s)",
            )
            .await
            .unwrap();

        let verdict = gate.inspect(&meta(Method::GET, "/", HeaderMap::new())).await;
        assert!(!verdict.is_allowed());
        let err = verdict.into_result().unwrap_err();
        assert_eq!(err.to_string(), "access temporarily restricted");
        assert!(err.retry_after().is_some());

        assert!(pipeline.wait_idle(Duration::from_secs(5)).await);
        let events = collect.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::BlockedIpAccess);
    }
}
