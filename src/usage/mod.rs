//! 用量解析模块
//!
//! 从上游响应（完整 JSON 或 SSE 流）中提取 token 用量：
//! - `anthropic`: Anthropic Messages 协议
//! - `openai`: OpenAI 兼容 Chat Completions 协议
//! - `sse`: 事件流分帧

pub mod anthropic;
pub mod openai;
pub mod sse;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::pricing::PriceTable;

/// 协议族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ApiType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    /// 解析非流式响应体
    pub fn parse_body(self, draft: &mut UsageDraft, body: &[u8]) {
        match self {
            Self::Anthropic => anthropic::apply_response(draft, body),
            Self::OpenAi => openai::apply_response(draft, body),
        }
    }

    /// 解析单个 SSE 帧，失败只影响当前帧
    pub fn apply_frame(self, draft: &mut UsageDraft, frame: &[u8]) {
        for payload in sse::data_payloads(frame) {
            match self {
                Self::Anthropic => anthropic::apply_event(draft, payload),
                Self::OpenAi => openai::apply_event(draft, payload),
            }
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => anyhow::bail!("未知的 api_type: {}", other),
        }
    }
}

/// 单次请求的用量记录（持久化后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub api_type: ApiType,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub latency_ms: u64,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
    pub source_app: String,
    /// `None` 表示模型价格未知
    pub estimated_cost: Option<f64>,
}

/// 请求进行中的用量累加器
///
/// 由请求所属任务独占，`finish` 时消费为 [`UsageRecord`]
#[derive(Debug, Clone)]
pub struct UsageDraft {
    pub api_type: ApiType,
    /// 上游分配的 ID；缺失时在 `finish` 生成 UUID
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub status_code: u16,
    pub source_app: String,
}

impl UsageDraft {
    pub fn new(api_type: ApiType, source_app: impl Into<String>) -> Self {
        Self {
            api_type,
            request_id: None,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            status_code: 0,
            source_app: source_app.into(),
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// 定稿：按最终 token 数重新计算费用，并打上创建时间
    pub fn finish(self, latency_ms: u64, prices: &PriceTable) -> UsageRecord {
        let model = self.model.unwrap_or_default();
        let estimated_cost = prices.estimate_cost(&model, self.input_tokens, self.output_tokens);
        UsageRecord {
            request_id: self
                .request_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            api_type: self.api_type,
            model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens,
            latency_ms,
            status_code: self.status_code,
            created_at: Utc::now(),
            source_app: self.source_app,
            estimated_cost,
        }
    }
}

/// 宽松解析 token 数：非数字 / 负数 / null 均视为缺失
pub(crate) fn lenient_tokens<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_u64()))
}

/// 宽松解析字符串字段：非字符串视为缺失
pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    })
}
