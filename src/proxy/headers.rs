//! 请求/响应头过滤

use http::HeaderMap;
use http::header;

/// 只对单跳连接有意义的头，两个方向都不转发
const HOP_BY_HOP: [&str; 11] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "trailer",
];

/// 复制一份去掉逐跳头的 HeaderMap
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = headers.clone();
    for name in HOP_BY_HOP {
        filtered.remove(name);
    }
    filtered
}

/// 发往上游的请求头：在逐跳过滤之外去掉 accept-encoding，保证响应体未压缩、可解析
pub fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = filter_headers(headers);
    filtered.remove(header::ACCEPT_ENCODING);
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http::header::HeaderName;

    fn sample() -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("proxy-authorization", "Basic x"),
            ("te", "trailers"),
            ("trailers", "x"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "h2c"),
            ("host", "localhost:8877"),
            ("content-length", "42"),
            ("accept-encoding", "gzip"),
            ("x-api-key", "sk-test"),
            ("anthropic-version", "2023-06-01"),
            ("content-type", "application/json"),
        ] {
            headers.append(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        headers
    }

    #[test]
    fn test_filter_strips_hop_by_hop_only() {
        let filtered = filter_headers(&sample());
        let names: Vec<&str> = filtered.keys().map(|k| k.as_str()).collect();
        assert_eq!(filtered.len(), 4);
        for name in ["accept-encoding", "x-api-key", "anthropic-version", "content-type"] {
            assert!(names.contains(&name), "missing {name}");
        }
    }

    #[test]
    fn test_outbound_also_strips_accept_encoding() {
        let filtered = outbound_headers(&sample());
        assert!(filtered.get("accept-encoding").is_none());
        assert_eq!(filtered.get("x-api-key").unwrap(), "sk-test");
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn test_multi_valued_headers_are_kept() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        let filtered = filter_headers(&headers);
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
    }
}
