//! 计量反向代理
//!
//! 把 `/anthropic/*`、`/openai/*` 原样转发到对应上游，并从响应中提取用量

pub mod error;
pub mod forwarder;
pub mod headers;
mod router;
mod stream;

pub use forwarder::Forwarder;
pub use router::create_proxy_router;
