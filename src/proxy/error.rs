//! 代理错误类型

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// 错误响应体 `{"error": {"type", "message"}}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// 上游调用失败，在任何响应头发出之前产生，不重试
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("无法连接上游 {url}: {message}")]
    UpstreamUnreachable { url: String, message: String },

    #[error("上游请求超时 {url}: {message}")]
    UpstreamTimeout { url: String, message: String },
}

impl ProxyError {
    /// 超时优先判断：建连超时同时满足 `is_connect()`
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        let url = url.to_string();
        let message = err.to_string();
        if err.is_timeout() {
            Self::UpstreamTimeout { url, message }
        } else {
            Self::UpstreamUnreachable { url, message }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UpstreamUnreachable { .. } => "upstream_unreachable",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        tracing::warn!("{}", self);
        let body = ErrorResponse::new(self.error_type(), self.to_string());
        (self.status_code(), Json(body)).into_response()
    }
}
