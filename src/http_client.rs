//! HTTP Client 构建模块
//!
//! 进程内共享一个上游客户端（连接池复用）

use reqwest::{Client, Proxy};
use std::time::Duration;

/// 构建上游 HTTP Client
///
/// # Arguments
/// * `proxy_url` - 可选的出站代理 URL，支持 `http://`、`socks5://`（可带 `user:pass@`）
/// * `connect_timeout_secs` - 建连超时（秒）
/// * `request_timeout_secs` - 整体超时（秒），流式响应同样受此限制
pub fn build_client(
    proxy_url: Option<&str>,
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
) -> anyhow::Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(request_timeout_secs));

    if let Some(url) = proxy_url.filter(|u| !u.is_empty()) {
        let proxy = Proxy::all(url)?;
        builder = builder.proxy(proxy);
        tracing::debug!("HTTP Client 使用代理: {}", url);
    }

    Ok(builder.build()?)
}
