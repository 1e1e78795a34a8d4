//! 公共工具模块

pub mod auth;

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_bytes` 字节的最长有效 UTF-8 子串
pub fn truncate_str_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

/// 字节内容的日志预览：按 UTF-8 有损解码后截断并加省略号
pub fn preview_bytes(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return text.into_owned();
    }

    // 为省略号预留空间
    let truncate_at = if max_bytes > 3 { max_bytes - 3 } else { max_bytes };
    format!("{}...", truncate_str_safe(&text, truncate_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "你好世界";
        assert_eq!(truncate_str_safe(s, 4), "你");
        assert_eq!(truncate_str_safe(s, 100), s);
    }

    #[test]
    fn test_preview_bytes() {
        assert_eq!(preview_bytes(b"short", 10), "short");
        assert_eq!(preview_bytes(b"0123456789abc", 8), "01234...");
        assert_eq!(preview_bytes(b"\xff", 10), "\u{fffd}");
    }
}
