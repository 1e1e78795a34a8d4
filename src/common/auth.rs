//! API Key 提取与比较

use axum::{body::Body, http::Request};
use subtle::ConstantTimeEq;

/// 从 `x-api-key` 或 `Authorization: Bearer <key>` 提取密钥
pub fn extract_api_key(request: &Request<Body>) -> Option<String> {
    let headers = request.headers();
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// 常量时间字符串比较（防止时序攻击）
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
