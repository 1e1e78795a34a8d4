//! 用量报表 API 路由

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
};

use crate::common::auth;

use super::handlers::{get_recent, get_stats, get_time_series, reset_usage};
use super::store::UsageLog;

#[derive(Clone)]
pub struct UsageApiState {
    pub log: Arc<UsageLog>,
}

/// 管理密钥认证中间件
async fn admin_auth_middleware(
    State(admin_api_key): State<Arc<String>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, &admin_api_key) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })),
        )
            .into_response(),
    }
}

/// CORS 层：仪表盘可能从其他端口访问，允许任意来源
fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// 创建用量报表 API 路由
///
/// 返回 Router<()>，由 main nest 到 `/api`。未配置 `admin_api_key` 时不做认证
pub fn create_usage_router(admin_api_key: Option<String>, log: Arc<UsageLog>) -> Router {
    let state = UsageApiState { log };

    let mut router = Router::new()
        .route("/stats", get(get_stats))
        .route("/recent", get(get_recent))
        .route("/timeseries", get(get_time_series))
        .route("/usage", delete(reset_usage));

    if let Some(key) = admin_api_key.filter(|k| !k.is_empty()) {
        router = router.layer(middleware::from_fn_with_state(
            Arc::new(key),
            admin_auth_middleware,
        ));
    }

    router.layer(cors_layer()).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{ApiType, UsageRecord};
    use axum::http::Method;
    use chrono::Utc;
    use tower::ServiceExt;

    fn record(model: &str, input: u64, cost: Option<f64>) -> UsageRecord {
        UsageRecord {
            request_id: uuid::Uuid::new_v4().to_string(),
            api_type: ApiType::Anthropic,
            model: model.to_string(),
            input_tokens: input,
            output_tokens: 1,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            latency_ms: 5,
            status_code: 200,
            created_at: Utc::now(),
            source_app: "test".to_string(),
            estimated_cost: cost,
        }
    }

    async fn setup(key: Option<&str>) -> (tempfile::TempDir, Arc<UsageLog>, Router) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(UsageLog::open(dir.path().join("usage.db")).unwrap());
        log.append(record("claude-haiku-4-5", 100, Some(0.5)));
        log.append(record("glm-4.7", 10, None));
        log.flush().await;
        let router = create_usage_router(key.map(str::to_string), log.clone());
        (dir, log, router)
    }

    async fn call(router: &Router, method: Method, uri: &str, key: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        let response = router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (_dir, _log, router) = setup(None).await;
        let (status, json) = call(&router, Method::GET, "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["timeframe"], "24h");
        assert_eq!(json["total_requests"], 2);
        assert_eq!(json["total_input_tokens"], 110);
        assert_eq!(json["models"][0]["model"], "claude-haiku-4-5");

        let (status, json) = call(&router, Method::GET, "/stats?timeframe=all", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["timeframe"], "all");
    }

    #[tokio::test]
    async fn test_invalid_timeframe_is_bad_request() {
        let (_dir, _log, router) = setup(None).await;
        let (status, json) = call(&router, Method::GET, "/stats?timeframe=2h", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request_error");

        let (status, _) = call(&router, Method::GET, "/timeseries?timeframe=forever", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_recent_limit_is_bad_request() {
        let (_dir, _log, router) = setup(None).await;
        for uri in ["/recent?limit=abc", "/recent?limit=-1", "/recent?limit=0", "/recent?limit=1.5"] {
            let (status, json) = call(&router, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(json["error"]["type"], "invalid_request_error", "{uri}");
            assert!(json["error"]["message"].as_str().unwrap().contains("limit"));
        }

        // 超大值收敛到上限
        let (status, json) = call(&router, Method::GET, "/recent?limit=99999999999", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recent_and_timeseries() {
        let (_dir, _log, router) = setup(None).await;
        let (status, json) = call(&router, Method::GET, "/recent?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0]["id"].as_i64().is_some());
        assert!(entries[0]["request_id"].is_string());
        assert_eq!(entries[0]["api_type"], "anthropic");

        let (status, json) = call(&router, Method::GET, "/timeseries", None).await;
        assert_eq!(status, StatusCode::OK);
        let points = json.as_array().unwrap();
        let requests: u64 = points.iter().map(|p| p["requests"].as_u64().unwrap()).sum();
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn test_delete_usage() {
        let (_dir, log, router) = setup(None).await;
        let (status, json) = call(&router, Method::DELETE, "/usage", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["deleted"], 2);
        assert!(log.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_key_required_when_configured() {
        let (_dir, _log, router) = setup(Some("admin-secret")).await;
        let (status, json) = call(&router, Method::GET, "/stats", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["type"], "authentication_error");

        let (status, _) = call(&router, Method::GET, "/stats", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&router, Method::GET, "/stats", Some("admin-secret")).await;
        assert_eq!(status, StatusCode::OK);
    }
}
