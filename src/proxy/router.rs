//! 代理路由

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Json, Response},
    routing::{MethodRouter, get},
};

use super::forwarder::Forwarder;
use crate::usage::ApiType;

const SERVICE_NAME: &str = "tokenwatch-proxy";

/// 上游路径：去掉协议前缀，保留原始编码和查询串
fn upstream_path(uri: &Uri, prefix: &str) -> String {
    let path = uri.path().strip_prefix(prefix).unwrap_or("/");
    let path = if path.is_empty() { "/" } else { path };
    match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

async fn proxy(
    forwarder: &Forwarder,
    api_type: ApiType,
    prefix: &str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = upstream_path(&uri, prefix);
    match forwarder.forward(api_type, method, &path, &headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn anthropic_proxy(
    State(forwarder): State<Forwarder>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(&forwarder, ApiType::Anthropic, "/anthropic", method, uri, headers, body).await
}

async fn openai_proxy(
    State(forwarder): State<Forwarder>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(&forwarder, ApiType::OpenAi, "/openai", method, uri, headers, body).await
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME,
    }))
}

fn forwarding_methods<H, T>(handler: H) -> MethodRouter<Forwarder>
where
    H: axum::handler::Handler<T, Forwarder> + Clone,
    T: 'static,
{
    axum::routing::get(handler.clone())
        .post(handler.clone())
        .put(handler.clone())
        .delete(handler.clone())
        .patch(handler)
}

/// 创建代理路由（含健康检查）
///
/// 请求体不设大小上限，由上游决定是否接受
pub fn create_proxy_router(forwarder: Forwarder) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/anthropic/{*path}", forwarding_methods(anthropic_proxy))
        .route("/openai/{*path}", forwarding_methods(openai_proxy))
        .layer(DefaultBodyLimit::disable())
        .with_state(forwarder)
}
