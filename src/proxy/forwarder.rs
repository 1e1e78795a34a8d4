//! 上游转发与用量计量

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;

use super::error::ProxyError;
use super::headers::{filter_headers, outbound_headers};
use super::stream;
use crate::common::preview_bytes;
use crate::pricing::PriceTable;
use crate::usage::{ApiType, UsageDraft, UsageRecord};
use crate::usage_log::UsageLog;

/// 非 2xx 响应在日志中保留的预览长度
const ERROR_PREVIEW_BYTES: usize = 512;

/// 转发所需的共享依赖
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    log: Arc<UsageLog>,
    prices: Arc<PriceTable>,
    anthropic_upstream: String,
    openai_upstream: String,
    /// 小写的头名
    source_app_header: String,
}

impl Forwarder {
    pub fn new(
        client: reqwest::Client,
        log: Arc<UsageLog>,
        prices: Arc<PriceTable>,
        anthropic_upstream: impl Into<String>,
        openai_upstream: impl Into<String>,
        source_app_header: &str,
    ) -> Self {
        Self {
            client,
            log,
            prices,
            anthropic_upstream: anthropic_upstream.into().trim_end_matches('/').to_string(),
            openai_upstream: openai_upstream.into().trim_end_matches('/').to_string(),
            source_app_header: source_app_header.trim().to_ascii_lowercase(),
        }
    }

    fn upstream(&self, api_type: ApiType) -> &str {
        match api_type {
            ApiType::Anthropic => &self.anthropic_upstream,
            ApiType::OpenAi => &self.openai_upstream,
        }
    }

    fn source_app(&self, headers: &HeaderMap) -> String {
        headers
            .get(self.source_app_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("unknown")
            .to_string()
    }

    /// 转发一次请求
    ///
    /// `path_and_query` 以 `/` 开头，直接拼接到上游基础 URL 后
    pub async fn forward(
        &self,
        api_type: ApiType,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        let started = Instant::now();
        let url = format!("{}{}", self.upstream(api_type), path_and_query);
        let streaming = is_streaming_request(&body);

        tracing::debug!(
            api_type = %api_type,
            method = %method,
            url = %url,
            streaming,
            "转发请求"
        );
        #[cfg(feature = "sensitive-logs")]
        tracing::debug!("请求体: {}", preview_bytes(&body, 2048));

        let response = self
            .client
            .request(method, &url)
            .headers(outbound_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::from_reqwest(&url, &e))?;

        let status = response.status();
        let response_headers = filter_headers(response.headers());
        let meter = UsageMeter {
            draft: UsageDraft::new(api_type, self.source_app(headers)).with_status(status.as_u16()),
            started,
            log: self.log.clone(),
            prices: self.prices.clone(),
        };

        if streaming {
            let (response, _relay) =
                stream::relay(response.bytes_stream(), status, response_headers, meter);
            return Ok(response);
        }

        // 响应头之后的读取失败：不写记录
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::from_reqwest(&url, &e))?;

        if !status.is_success() {
            tracing::warn!(
                "上游返回 {}: {}",
                status,
                preview_bytes(&bytes, ERROR_PREVIEW_BYTES)
            );
        }
        #[cfg(feature = "sensitive-logs")]
        tracing::debug!("响应体: {}", preview_bytes(&bytes, 2048));

        let mut meter = meter;
        meter.observe_body(&bytes);
        meter.finish();

        Ok(build_response(status, response_headers, Body::from(bytes)))
    }
}

/// 单请求的用量计量器，由请求所属任务独占
pub struct UsageMeter {
    draft: UsageDraft,
    started: Instant,
    log: Arc<UsageLog>,
    prices: Arc<PriceTable>,
}

impl UsageMeter {
    pub fn observe_body(&mut self, body: &[u8]) {
        let api_type = self.draft.api_type;
        api_type.parse_body(&mut self.draft, body);
    }

    pub fn observe_frame(&mut self, frame: &[u8]) {
        let api_type = self.draft.api_type;
        api_type.apply_frame(&mut self.draft, frame);
    }

    /// 定稿并提交持久化（不等待落盘）
    pub fn finish(self) -> UsageRecord {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let record = self.draft.finish(latency_ms, &self.prices);
        tracing::info!(
            api_type = %record.api_type,
            model = %record.model,
            status = record.status_code,
            input = record.input_tokens,
            output = record.output_tokens,
            cost = ?record.estimated_cost,
            latency_ms = record.latency_ms,
            "请求完成"
        );
        self.log.append(record.clone());
        record
    }
}

/// 请求体 JSON 顶层 `stream` 为 `true` 时走流式路径
pub fn is_streaming_request(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

pub(crate) fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_streaming_request() {
        assert!(is_streaming_request(br#"{"model":"m","stream":true}"#));
        assert!(!is_streaming_request(br#"{"model":"m","stream":false}"#));
        assert!(!is_streaming_request(br#"{"model":"m"}"#));
        assert!(!is_streaming_request(br#"{"stream":"true"}"#));
        assert!(!is_streaming_request(br#"{"stream":1}"#));
        assert!(!is_streaming_request(br#"[{"stream":true}]"#));
        assert!(!is_streaming_request(b"not json"));
        assert!(!is_streaming_request(b""));
    }

    #[tokio::test]
    async fn test_source_app_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(UsageLog::open(dir.path().join("usage.db")).unwrap());
        let forwarder = Forwarder::new(
            reqwest::Client::new(),
            log,
            Arc::new(PriceTable::default()),
            "http://a/",
            "http://b",
            "X-Client-App",
        );
        let mut headers = HeaderMap::new();
        assert_eq!(forwarder.source_app(&headers), "unknown");
        headers.insert("x-client-app", "my-tool/1.0".parse().unwrap());
        assert_eq!(forwarder.source_app(&headers), "my-tool/1.0");
        assert_eq!(forwarder.upstream(ApiType::Anthropic), "http://a");
    }

    #[tokio::test]
    async fn test_meter_finish_persists_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(UsageLog::open(dir.path().join("usage.db")).unwrap());
        let mut meter = test_support::meter(ApiType::OpenAi, log.clone());
        meter.observe_body(
            br#"{"id":"chatcmpl-1","model":"glm-4.7","usage":{"prompt_tokens":1000000,"completion_tokens":0}}"#,
        );
        let record = meter.finish();
        assert_eq!(record.request_id, "chatcmpl-1");
        assert!((record.estimated_cost.unwrap() - 0.6).abs() < 1e-9);

        log.flush().await;
        let entries = log.recent(5).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record, record);
    }
}
