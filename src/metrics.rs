//! Prometheus 指标：准入/拒绝、fail-open、事件管道、告警与自动封禁
//!
//! 通过 `init()` 安装全局 Recorder；未安装时所有 `record_*` 调用都是空操作。

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_ADMITTED: &str = "ratewarden_admitted_total";
const COUNTER_LIMIT_EXCEEDED: &str = "ratewarden_limit_exceeded_total";
const COUNTER_BLOCKED: &str = "ratewarden_blocked_requests_total";
const COUNTER_FAIL_OPEN: &str = "ratewarden_fail_open_total";
const COUNTER_EVENTS_ACCEPTED: &str = "ratewarden_events_accepted_total";
const COUNTER_EVENTS_DROPPED: &str = "ratewarden_events_dropped_total";
const GAUGE_EVENT_QUEUE_DEPTH: &str = "ratewarden_event_queue_depth";
const COUNTER_ALERTS: &str = "ratewarden_alerts_total";
const COUNTER_AUTO_BLOCKS: &str = "ratewarden_auto_blocks_total";
const GAUGE_STORE_POOL_ACTIVE: &str = "ratewarden_store_pool_active";
const GAUGE_STORE_POOL_IDLE: &str = "ratewarden_store_pool_idle";

/// 安装全局 Recorder。仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 安装 Recorder；本模块已安装过时直接返回 true
pub fn ensure_installed() -> bool {
    if is_initialized() {
        return true;
    }
    match init() {
        Ok(()) => {
            tracing::info!("📊 Prometheus 指标已启用");
            true
        }
        // 并发安装时另一方可能先成功
        Err(_) if is_initialized() => true,
        Err(e) => {
            tracing::warn!("⚠️ 无法安装 Prometheus Recorder: {}", e);
            false
        }
    }
}

pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// Prometheus 文本格式
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// GET /metrics；未初始化时返回 503
pub async fn metrics_handler() -> Response {
    match render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// 在 `addr` 上提供 `GET /metrics`，直到任务被取消
pub async fn serve(addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("📊 指标服务监听 http://{}/metrics", listener.local_addr()?);
    axum::serve(listener, router()).await
}

pub fn record_admitted() {
    metrics::counter!(COUNTER_ADMITTED).increment(1);
}

/// 按触发的层级（如 requests_per_minute）计数
pub fn record_limit_exceeded(limit_type: &str) {
    metrics::counter!(COUNTER_LIMIT_EXCEEDED, "limit_type" => limit_type.to_string()).increment(1);
}

/// 被封禁条目拒绝的请求；kind 为 ip / caller
pub fn record_blocked(kind: &str) {
    metrics::counter!(COUNTER_BLOCKED, "kind" => kind.to_string()).increment(1);
}

/// 存储不可用时按 fail-open 放行
pub fn record_fail_open(operation: &str) {
    metrics::counter!(COUNTER_FAIL_OPEN, "operation" => operation.to_string()).increment(1);
}

pub fn record_event_accepted() {
    metrics::counter!(COUNTER_EVENTS_ACCEPTED).increment(1);
}

pub fn record_event_dropped() {
    metrics::counter!(COUNTER_EVENTS_DROPPED).increment(1);
}

pub fn record_event_queue_depth(depth: usize) {
    metrics::gauge!(GAUGE_EVENT_QUEUE_DEPTH).set(depth as f64);
}

pub fn record_alert(event_type: &str) {
    metrics::counter!(COUNTER_ALERTS, "event_type" => event_type.to_string()).increment(1);
}

pub fn record_auto_block(event_type: &str) {
    metrics::counter!(COUNTER_AUTO_BLOCKS, "event_type" => event_type.to_string()).increment(1);
}

/// Redis 连接池状态
pub fn record_store_pool(active: u32, idle: u32) {
    metrics::gauge!(GAUGE_STORE_POOL_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_STORE_POOL_IDLE).set(idle as f64);
}
