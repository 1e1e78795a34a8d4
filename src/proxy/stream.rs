//! 流式响应中继
//!
//! 后台任务逐帧把上游字节原样转发给客户端，同时喂给增量解析器。
//! 客户端断开（或长时间不读取）后继续读取上游直到结束，保证用量仍被记录。

use std::fmt::Display;
use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;

use super::forwarder::{UsageMeter, build_response};
use crate::usage::sse::FrameBuffer;

/// 中继通道容量（帧数）
const RELAY_BUFFER: usize = 32;

/// 通道满时等待客户端读取的最长时间，超时按断开处理
const CLIENT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// 启动中继任务，立即返回流式响应
pub fn relay<S, E>(
    upstream: S,
    status: StatusCode,
    headers: HeaderMap,
    meter: UsageMeter,
) -> (Response, JoinHandle<()>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    relay_with_timeout(upstream, status, headers, meter, CLIENT_SEND_TIMEOUT)
}

fn relay_with_timeout<S, E>(
    upstream: S,
    status: StatusCode,
    headers: HeaderMap,
    meter: UsageMeter,
    send_timeout: Duration,
) -> (Response, JoinHandle<()>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(RELAY_BUFFER);
    let client = ClientSink {
        tx,
        connected: true,
        send_timeout,
    };
    let handle = tokio::spawn(pump(upstream, client, meter));
    (build_response(status, headers, Body::from_stream(rx)), handle)
}

struct ClientSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    connected: bool,
    send_timeout: Duration,
}

impl ClientSink {
    async fn send(&mut self, item: Result<Bytes, io::Error>) {
        if !self.connected {
            return;
        }
        let sent = tokio::time::timeout(self.send_timeout, self.tx.send(item)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.connected = false;
                tracing::debug!("客户端已断开，继续读取上游以统计用量");
            }
            Err(_) => {
                // 关闭通道，客户端侧的响应体随之结束
                self.connected = false;
                self.tx.close_channel();
                tracing::warn!(
                    "客户端 {}s 内未读取响应，停止转发，继续读取上游以统计用量",
                    self.send_timeout.as_secs_f64()
                );
            }
        }
    }
}

async fn pump<S, E>(upstream: S, mut client: ClientSink, mut meter: UsageMeter)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut frames = FrameBuffer::new();
    let mut failure = None;

    while let Some(item) = upstream.next().await {
        match item {
            Ok(chunk) => {
                frames.push(&chunk);
                while let Some(frame) = frames.next_frame() {
                    meter.observe_frame(&frame);
                    client.send(Ok(frame)).await;
                }
            }
            Err(e) => {
                tracing::warn!("上游流读取中断: {}", e);
                failure = Some(e.to_string());
                break;
            }
        }
    }

    // 不完整的尾帧同样原样转发并尝试解析
    if let Some(rest) = frames.take_residual() {
        meter.observe_frame(&rest);
        client.send(Ok(rest)).await;
    }

    meter.finish();

    if let Some(message) = failure {
        client.send(Err(io::Error::other(message))).await;
    }
}
