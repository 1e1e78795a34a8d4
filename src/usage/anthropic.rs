//! Anthropic Messages 协议用量解析

use serde::Deserialize;

use super::{UsageDraft, lenient_string, lenient_tokens};

/// `usage` 对象，所有字段可选
#[derive(Debug, Default, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default, deserialize_with = "lenient_tokens")]
    pub input_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient_tokens")]
    pub output_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient_tokens")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient_tokens")]
    pub cache_read_input_tokens: Option<u64>,
}

/// 非流式响应体，也是 `message_start.message` 的结构
#[derive(Debug, Default, Deserialize)]
pub struct AnthropicMessage {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// 流式事件
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        #[serde(default)]
        message: AnthropicMessage,
    },
    MessageDelta {
        #[serde(default)]
        usage: AnthropicUsage,
    },
    #[serde(other)]
    Unknown,
}

/// 解析非流式响应，无效 JSON 时保持空模型和 0 token
pub fn apply_response(draft: &mut UsageDraft, body: &[u8]) {
    let message: AnthropicMessage = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("Anthropic 响应体无法解析用量: {}", e);
            return;
        }
    };

    if message.id.is_some() {
        draft.request_id = message.id;
    }
    draft.model = message.model;
    let usage = message.usage.unwrap_or_default();
    draft.input_tokens = usage.input_tokens.unwrap_or(0);
    draft.output_tokens = usage.output_tokens.unwrap_or(0);
    draft.cache_creation_tokens = usage.cache_creation_input_tokens.unwrap_or(0);
    draft.cache_read_tokens = usage.cache_read_input_tokens.unwrap_or(0);
}

/// 解析单个 `data:` 负载
pub fn apply_event(draft: &mut UsageDraft, payload: &str) {
    let event: AnthropicStreamEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!("跳过无法解析的 Anthropic 事件: {}", e);
            return;
        }
    };

    match event {
        AnthropicStreamEvent::MessageStart { message } => {
            if message.id.is_some() {
                draft.request_id = message.id;
            }
            if message.model.is_some() {
                draft.model = message.model;
            }
            let usage = message.usage.unwrap_or_default();
            draft.input_tokens = usage.input_tokens.unwrap_or(0);
            draft.cache_creation_tokens = usage.cache_creation_input_tokens.unwrap_or(0);
            draft.cache_read_tokens = usage.cache_read_input_tokens.unwrap_or(0);
        }
        AnthropicStreamEvent::MessageDelta { usage } => {
            // output_tokens 是累计值，直接覆盖
            if let Some(output_tokens) = usage.output_tokens {
                draft.output_tokens = output_tokens;
            }
        }
        AnthropicStreamEvent::Unknown => {}
    }
}
