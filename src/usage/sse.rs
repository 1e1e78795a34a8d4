//! SSE 分帧
//!
//! 帧以空行结束（`\n\n` 或 `\r\n\r\n`）。切出的帧保留原始字节（含分隔符），
//! 依次拼接即为上游原始字节流。

use bytes::{Bytes, BytesMut};

/// 单请求的累积缓冲区
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    /// 已确认不含帧边界的前缀长度
    scanned: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 切出一个完整帧（含结尾空行）
    pub fn next_frame(&mut self) -> Option<Bytes> {
        // 边界可能跨 chunk，回退两个字节重新扫描
        let from = self.scanned.saturating_sub(2);
        match find_frame_end(&self.buf, from) {
            Some(end) => {
                self.scanned = 0;
                Some(self.buf.split_to(end).freeze())
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// 流结束时取出剩余的不完整帧
    pub fn take_residual(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

fn find_frame_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some(i + 2),
                (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// 帧内所有 `data:` 行的内容
pub fn data_payloads(frame: &[u8]) -> impl Iterator<Item = &str> {
    frame.split(|b| *b == b'\n').filter_map(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let rest = line.strip_prefix(b"data:")?;
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        std::str::from_utf8(rest).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buffer: &mut FrameBuffer) -> Vec<Bytes> {
        std::iter::from_fn(|| buffer.next_frame()).collect()
    }

    #[test]
    fn test_splits_complete_frames() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"data: a\n\ndata: b\n\ndata: c");
        let frames = drain(&mut buffer);
        assert_eq!(frames, vec![Bytes::from("data: a\n\n"), Bytes::from("data: b\n\n")]);
        assert_eq!(buffer.take_residual(), Some(Bytes::from("data: c")));
        assert_eq!(buffer.take_residual(), None);
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"event: ping\ndata: {}\n");
        assert!(buffer.next_frame().is_none());
        buffer.push(b"\nrest");
        assert_eq!(buffer.next_frame(), Some(Bytes::from("event: ping\ndata: {}\n\n")));
        assert!(buffer.next_frame().is_none());
    }

    #[test]
    fn test_crlf_delimiter() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"data: x\r\n\r");
        assert!(buffer.next_frame().is_none());
        buffer.push(b"\ndata: y\r\n\r\n");
        let frames = drain(&mut buffer);
        assert_eq!(frames, vec![Bytes::from("data: x\r\n\r\n"), Bytes::from("data: y\r\n\r\n")]);
    }

    #[test]
    fn test_byte_by_byte_reassembles_input() {
        let input: &[u8] = b"event: a\ndata: 1\n\n\n\ndata: \xe4\xbd\xa0\n\ntrailing";
        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        for byte in input {
            buffer.push(std::slice::from_ref(byte));
            while let Some(frame) = buffer.next_frame() {
                out.extend_from_slice(&frame);
            }
        }
        if let Some(rest) = buffer.take_residual() {
            out.extend_from_slice(&rest);
        }
        assert_eq!(out, input);
    }

    #[test]
    fn test_data_payloads() {
        let frame = b"event: message_start\r\ndata: {\"a\":1}\r\ndata:[DONE]\n: comment\n\n";
        let payloads: Vec<&str> = data_payloads(frame).collect();
        assert_eq!(payloads, vec![r#"{"a":1}"#, "[DONE]"]);
    }

    #[test]
    fn test_data_payloads_skips_invalid_utf8() {
        let frame = b"data: \xff\xfe\ndata: ok\n\n";
        let payloads: Vec<&str> = data_payloads(frame).collect();
        assert_eq!(payloads, vec!["ok"]);
    }
}
