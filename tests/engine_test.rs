//! SecurityEngine 端到端测试（MemoryStore + ManualClock）

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method};
use ratewarden::{
    CallerIdentity, EngineConfig, EngineError, FailMode, ManualClock, MemoryStore, RequestMeta,
    SecurityEngine, SecurityEventType, StoreBackend, UsageKind,
};

const WAIT: Duration = Duration::from_secs(5);

fn base_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.backend = StoreBackend::Memory;
    config.notifier.log = false;
    // 单 worker：告警数可精确断言
    config.events.workers = 1;
    config
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    engine: Arc<SecurityEngine>,
}

fn harness(config: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let engine = SecurityEngine::builder(config)
        .clock(clock.clone())
        .store(store.clone())
        .build()
        .expect("engine");
    Harness {
        clock,
        store,
        engine: Arc::new(engine),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_admit_exactly_limit() {
    let mut config = base_config();
    config.limits.requests_per_minute = Some(10);
    let h = harness(config);

    let handles: Vec<_> = (0..15)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.check_limit("acme", Some("alice")).await })
        })
        .collect();

    let mut admitted = 0;
    let mut rejected = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => admitted += 1,
            Err(e) => rejected.push(e),
        }
    }

    assert_eq!(admitted, 10);
    assert_eq!(rejected.len(), 5);
    for err in &rejected {
        assert_eq!(err.limit_type(), Some("requests_per_minute"));
        assert!(err.retry_after().is_some());
    }

    let usage = h.engine.get_usage("acme", Some("alice")).await.unwrap();
    assert_eq!(usage.requests_per_minute.used, 10);
    assert_eq!(usage.requests_per_minute.remaining, Some(0));
}

#[tokio::test]
async fn test_sliding_window_restores_after_entries_age_out() {
    let mut config = base_config();
    config.limits.requests_per_minute = Some(3);
    let h = harness(config);

    for expected_remaining in [2u64, 1, 0] {
        h.engine.check_limit("acme", None).await.unwrap();
        let usage = h.engine.get_usage("acme", None).await.unwrap();
        assert_eq!(usage.requests_per_minute.remaining, Some(expected_remaining));
    }
    assert!(h.engine.check_limit("acme", None).await.is_err());

    h.clock.advance(Duration::from_secs(61));
    let usage = h.engine.get_usage("acme", None).await.unwrap();
    assert_eq!(usage.requests_per_minute.remaining, Some(3));
    h.engine.check_limit("acme", None).await.unwrap();
}

#[tokio::test]
async fn test_failed_logins_trigger_auto_block() {
    let h = harness(base_config());
    for _ in 0..5 {
        let event = h.engine.new_event(SecurityEventType::FailedLogin, "10.0.0.5");
        h.engine.log_security_event(event);
    }
    assert!(h.engine.wait_for_events(WAIT).await);

    let (blocked, reason) = h.engine.is_ip_blocked("10.0.0.5").await;
    assert!(blocked);
    assert!(reason.contains("failed_login"), "reason: {}", reason);

    let metrics = h.engine.get_security_metrics(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(metrics.event_counts["failed_login"], 5);
    assert_eq!(metrics.blocked_ip_count, 1);
    assert_eq!(metrics.active_alert_count, 1);
    assert_eq!(metrics.dropped_events, 0);

    // 30 分钟后解除
    h.clock.advance(Duration::from_secs(30 * 60 + 1));
    assert_eq!(h.engine.is_ip_blocked("10.0.0.5").await, (false, String::new()));
}

#[tokio::test]
async fn test_four_failed_logins_do_not_block() {
    let h = harness(base_config());
    for _ in 0..4 {
        let event = h.engine.new_event(SecurityEventType::FailedLogin, "10.0.0.5");
        h.engine.log_security_event(event);
    }
    assert!(h.engine.wait_for_events(WAIT).await);
    assert_eq!(h.engine.is_ip_blocked("10.0.0.5").await, (false, String::new()));

    let metrics = h.engine.get_security_metrics(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(metrics.active_alert_count, 0);
}

#[tokio::test]
async fn test_block_expiry_boundary() {
    let h = harness(base_config());
    h.engine
        .block_ip("198.51.100.7", Duration::from_secs(60), "manual")
        .await
        .unwrap();
    assert_eq!(
        h.engine.is_ip_blocked("198.51.100.7").await,
        (true, "manual".to_string())
    );

    h.clock.advance(Duration::from_millis(59_999));
    assert!(h.engine.is_ip_blocked("198.51.100.7").await.0);

    h.clock.advance(Duration::from_millis(2));
    assert!(!h.engine.is_ip_blocked("198.51.100.7").await.0);
}

#[tokio::test]
async fn test_whitelisted_identity_always_admitted() {
    let mut config = base_config();
    config.limits.requests_per_minute = Some(1);
    config.limits.whitelisted_identities = vec!["internal/*".to_string()];
    let h = harness(config);

    for _ in 0..20 {
        h.engine.check_limit("internal", Some("batch-job")).await.unwrap();
    }
    h.engine.check_limit("acme", None).await.unwrap();
    assert!(h.engine.check_limit("acme", None).await.is_err());
}

#[tokio::test]
async fn test_token_cost_accumulates_without_drift() {
    let mut config = base_config();
    config.limits.usd_per_token = 0.0001;
    let h = harness(config);

    h.engine.record_usage("acme", Some("alice"), 1000).await.unwrap();
    let usage = h.engine.get_usage("acme", Some("alice")).await.unwrap();
    assert_eq!(usage.cost_today_nanos, 100_000_000);
    assert!((usage.cost_today_usd - 0.1).abs() < 1e-9);
    assert_eq!(usage.tokens_per_day.used, 1000);

    for _ in 0..9 {
        h.engine.record_usage("acme", Some("alice"), 1000).await.unwrap();
    }
    let usage = h.engine.get_usage("acme", Some("alice")).await.unwrap();
    assert_eq!(usage.cost_today_nanos, 1_000_000_000);
    assert_eq!(usage.cost_today_usd, 1.0);
}

#[tokio::test]
async fn test_cost_limit_rejects_once_spent() {
    let mut config = base_config();
    config.limits.usd_per_token = 0.001;
    config.limits.cost_limit_per_day = Some(1.0);
    let h = harness(config);

    h.engine.check_limit("acme", None).await.unwrap();
    h.engine.record_usage("acme", None, 1000).await.unwrap();
    let err = h.engine.check_limit("acme", None).await.unwrap_err();
    assert_eq!(err.limit_type(), Some("cost_per_day"));
}

#[tokio::test]
async fn test_cooldown_blocks_caller_after_breach() {
    let mut config = base_config();
    config.limits.requests_per_minute = Some(2);
    config.limits.cooldown_period_secs = 120;
    let h = harness(config);

    h.engine.check_limit("acme", Some("bob")).await.unwrap();
    h.engine.check_limit("acme", Some("bob")).await.unwrap();
    assert!(matches!(
        h.engine.check_limit("acme", Some("bob")).await,
        Err(EngineError::LimitExceeded { .. })
    ));

    // 窗口已重置，但冷却期未结束
    h.clock.advance(Duration::from_secs(61));
    let err = h.engine.check_limit("acme", Some("bob")).await.unwrap_err();
    assert!(matches!(err, EngineError::Blocked { .. }));
    assert_eq!(err.to_string(), "access temporarily restricted");

    h.clock.advance(Duration::from_secs(60));
    h.engine.check_limit("acme", Some("bob")).await.unwrap();
}

#[tokio::test]
async fn test_limit_breach_emits_event() {
    let mut config = base_config();
    config.limits.requests_per_minute = Some(1);
    let h = harness(config);

    let identity = CallerIdentity::user("acme", "carol");
    h.engine.check_limit_from(&identity, Some("192.0.2.44")).await.unwrap();
    assert!(h
        .engine
        .check_limit_from(&identity, Some("192.0.2.44"))
        .await
        .is_err());
    assert!(h.engine.wait_for_events(WAIT).await);

    let metrics = h.engine.get_security_metrics(Duration::from_secs(60)).await.unwrap();
    assert_eq!(metrics.event_counts["rate_limit_exceeded"], 1);
    assert!(h.engine.suspicion_score("192.0.2.44").await.unwrap() > 0.0);
}

#[tokio::test]
async fn test_reset_clears_counters_and_cooldown() {
    let mut config = base_config();
    config.limits.requests_per_minute = Some(1);
    config.limits.cooldown_period_secs = 600;
    let h = harness(config);

    h.engine.check_limit("acme", Some("dave")).await.unwrap();
    assert!(h.engine.check_limit("acme", Some("dave")).await.is_err());
    h.engine.record_usage("acme", Some("dave"), 500).await.unwrap();
    h.engine
        .record(&CallerIdentity::user("acme", "dave"), 2, UsageKind::Request)
        .await
        .unwrap();
    assert!(h.engine.get_usage("acme", Some("dave")).await.unwrap().blocked);

    h.engine.reset_usage("acme", Some("dave")).await.unwrap();
    let usage = h.engine.get_usage("acme", Some("dave")).await.unwrap();
    assert!(usage.is_zero());
    assert!(!usage.blocked);
    assert!(usage.last_request.is_none());
    h.engine.check_limit("acme", Some("dave")).await.unwrap();
}

#[tokio::test]
async fn test_event_queue_saturation_never_blocks() {
    let mut config = base_config();
    config.events.queue_capacity = 4;
    let h = harness(config);

    let started = std::time::Instant::now();
    for i in 0..1000 {
        let ip = format!("203.0.113.{}", i % 200);
        let event = h.engine.new_event(SecurityEventType::SuspiciousRequest, &ip);
        h.engine.log_security_event(event);
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let pipeline = h.engine.pipeline();
    assert!(pipeline.dropped_count() > 0);
    assert_eq!(pipeline.accepted_count() + pipeline.dropped_count(), 1000);

    assert!(h.engine.wait_for_events(WAIT).await);
    let metrics = h.engine.get_security_metrics(Duration::from_secs(60)).await.unwrap();
    assert_eq!(metrics.dropped_events, pipeline.dropped_count());
    assert_eq!(
        metrics.event_counts["suspicious_request"],
        pipeline.accepted_count()
    );
}

#[tokio::test]
async fn test_fail_open_admits_when_store_down() {
    let h = harness(base_config());
    h.store.set_failing(true);
    h.engine.check_limit("acme", None).await.unwrap();
    h.engine.record_usage("acme", None, 10).await.unwrap();
    assert_eq!(h.engine.is_ip_blocked("10.1.1.1").await, (false, String::new()));
    // 只读查询不受 fail mode 影响
    assert!(matches!(
        h.engine.get_usage("acme", None).await,
        Err(EngineError::StoreUnavailable(_))
    ));
}

#[tokio::test]
async fn test_fail_closed_denies_when_store_down() {
    let mut config = base_config();
    config.engine.fail_mode = FailMode::Closed;
    let h = harness(config);
    h.store.set_failing(true);

    let err = h.engine.check_limit("acme", None).await.unwrap_err();
    assert!(matches!(err, EngineError::StoreUnavailable(_)));
    assert!(h.engine.is_ip_blocked("10.1.1.1").await.0);

    h.store.set_failing(false);
    h.engine.check_limit("acme", None).await.unwrap();
}

#[tokio::test]
async fn test_gate_denies_blocked_ip_and_flags_attacks() {
    let h = harness(base_config());
    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.50, 10.0.0.1"));
    let scan = RequestMeta::new(
        Method::GET,
        "/files?name=../../etc/passwd".parse().unwrap(),
        headers.clone(),
        Some("10.0.0.1".parse().unwrap()),
    );

    let verdict = h.engine.inspect_request(&scan).await;
    assert!(verdict.is_allowed());
    assert_eq!(verdict.client_ip(), Some("203.0.113.50"));

    h.engine
        .block_ip("203.0.113.50", Duration::from_secs(300), "manual")
        .await
        .unwrap();
    let clean = RequestMeta::new(
        Method::GET,
        "/".parse().unwrap(),
        headers,
        Some("10.0.0.1".parse().unwrap()),
    );
    let verdict = h.engine.inspect_request(&clean).await;
    assert!(!verdict.is_allowed());
    assert!(matches!(
        verdict.into_result(),
        Err(EngineError::Blocked { .. })
    ));

    assert!(h.engine.wait_for_events(WAIT).await);
    let metrics = h.engine.get_security_metrics(Duration::from_secs(60)).await.unwrap();
    assert_eq!(metrics.event_counts["suspicious_request"], 1);
    assert_eq!(metrics.event_counts["blocked_ip_access"], 1);
}

#[tokio::test]
async fn test_sql_injection_events_mark_ip_suspicious_and_block() {
    let h = harness(base_config());
    let event = h
        .engine
        .new_event(SecurityEventType::SqlInjectionAttempt, "192.0.2.99");
    h.engine.log_security_event(event);
    assert!(h.engine.wait_for_events(WAIT).await);

    // critical: 50 × 5
    assert_eq!(h.engine.suspicion_score("192.0.2.99").await.unwrap(), 250.0);
    assert!(h.engine.is_suspicious("192.0.2.99").await.unwrap());
    assert!(h.engine.is_ip_blocked("192.0.2.99").await.0);

    let metrics = h.engine.get_security_metrics(Duration::from_secs(60)).await.unwrap();
    assert_eq!(metrics.suspicious_ip_count, 1);
}

#[tokio::test]
async fn test_oversized_block_durations_do_not_panic() {
    let h = harness(base_config());
    let state = h
        .engine
        .block_ip("192.0.2.99", Duration::from_secs(u64::MAX / 2), "manual")
        .await
        .unwrap();
    assert!(state.expires_at > state.blocked_at);
    let (blocked, reason) = h.engine.is_ip_blocked("192.0.2.99").await;
    assert!(blocked);
    assert_eq!(reason, "manual");

    let mut config = base_config();
    config.thresholds.insert(
        "sql_injection_attempt".into(),
        ratewarden::config::ThresholdConfig {
            block_duration_secs: Some(u64::MAX / 2),
            ..Default::default()
        },
    );
    let result = SecurityEngine::builder(config)
        .clock(h.clock.clone())
        .store(h.store.clone())
        .build();
    assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));
}
