//! axum 中间件：在路由前执行 Intrusion-Detection Gate

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use super::RequestMeta;
use crate::engine::SecurityEngine;

/// 用法：`Router::new().layer(axum::middleware::from_fn_with_state(engine, security_gate))`
///
/// 对端地址来自 `ConnectInfo<SocketAddr>`，需要以
/// `into_make_service_with_connect_info::<SocketAddr>()` 启动服务；没有时只依赖转发头。
pub async fn security_gate(
    State(engine): State<Arc<SecurityEngine>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let meta = RequestMeta::new(
        request.method().clone(),
        request.uri().clone(),
        request.headers().clone(),
        peer,
    );

    match engine.inspect_request(&meta).await.into_result() {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
