//! OpenAI 兼容协议用量解析

use serde::Deserialize;

use super::{UsageDraft, lenient_string, lenient_tokens};

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default, deserialize_with = "lenient_tokens")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient_tokens")]
    pub completion_tokens: Option<u64>,
}

/// 非流式响应体，也是流式 chunk 的结构
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiCompletion {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

/// 流式帧：JSON chunk 或 `[DONE]`
#[derive(Debug)]
pub enum OpenAiStreamFrame {
    Chunk(OpenAiCompletion),
    Done,
}

impl OpenAiStreamFrame {
    pub fn parse(payload: &str) -> serde_json::Result<Self> {
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            return Ok(Self::Done);
        }
        serde_json::from_str(payload).map(Self::Chunk)
    }
}

pub fn apply_response(draft: &mut UsageDraft, body: &[u8]) {
    let completion: OpenAiCompletion = match serde_json::from_slice(body) {
        Ok(completion) => completion,
        Err(e) => {
            tracing::debug!("OpenAI 响应体无法解析用量: {}", e);
            return;
        }
    };

    if completion.id.is_some() {
        draft.request_id = completion.id;
    }
    draft.model = completion.model;
    let usage = completion.usage.unwrap_or_default();
    draft.input_tokens = usage.prompt_tokens.unwrap_or(0);
    draft.output_tokens = usage.completion_tokens.unwrap_or(0);
}

pub fn apply_event(draft: &mut UsageDraft, payload: &str) {
    let chunk = match OpenAiStreamFrame::parse(payload) {
        Ok(OpenAiStreamFrame::Chunk(chunk)) => chunk,
        Ok(OpenAiStreamFrame::Done) => return,
        Err(e) => {
            tracing::debug!("跳过无法解析的 OpenAI chunk: {}", e);
            return;
        }
    };

    // model / id 只取第一次出现的值
    if draft.model.is_none() {
        draft.model = chunk.model.filter(|m| !m.is_empty());
    }
    if draft.request_id.is_none() {
        draft.request_id = chunk.id.filter(|id| !id.is_empty());
    }
    // 仅在客户端请求 include_usage 时出现于最后一个 chunk
    if let Some(usage) = chunk.usage {
        if let Some(prompt_tokens) = usage.prompt_tokens {
            draft.input_tokens = prompt_tokens;
        }
        if let Some(completion_tokens) = usage.completion_tokens {
            draft.output_tokens = completion_tokens;
        }
    }
}
