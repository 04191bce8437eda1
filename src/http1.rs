//! Minimal HTTP/1.1 request-head (de)serialization shared by both processes.
//!
//! The ship side reshapes an incoming proxy request into origin form and
//! serializes just the request line + headers (the body, if any, travels as
//! subsequent `DATA` frames — see `crate::ship::worker`). The offshore side
//! parses that head back with `httparse` to recover method, path, and
//! headers before dialing the origin.

use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};

use crate::error::{LinkError, Result};

/// Hop-by-hop headers stripped before forwarding in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove the standard hop-by-hop headers, plus any header named in the
/// request's `Connection` header.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    if let Some(conn_val) = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    {
        for token in conn_val.split(',') {
            let name = token.trim().to_ascii_lowercase();
            if !name.is_empty() {
                if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                    headers.remove(&name);
                }
            }
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// `Via` header value this proxy appends to every forwarded request.
pub fn via_header_value() -> HeaderValue {
    HeaderValue::from_static("1.1 ship-proxy")
}

/// Split a `host[:port]` string into its parts, defaulting the port.
pub fn split_host_port(host_port: &str, default_port: u16) -> (String, u16) {
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (host_port.to_string(), default_port),
        },
        None => (host_port.to_string(), default_port),
    }
}

/// A serialized origin-form request head, plus the destination it resolved to.
pub struct OriginFormHead {
    pub head_bytes: Vec<u8>,
    pub host: String,
    pub port: u16,
}

/// Reshape an absolute-form or origin-form proxy request into the origin-form
/// head (request line + headers + CRLF CRLF) that travels in the `HTTP_REQ`
/// frame payload. `content_length` is the already-resolved (and, if the
/// client sent `Transfer-Encoding: chunked`, already-decoded) body length.
#[allow(clippy::too_many_arguments)]
pub fn build_origin_form_head(
    method: &Method,
    uri: &http::Uri,
    version: Version,
    mut headers: HeaderMap,
    content_length: usize,
) -> std::result::Result<OriginFormHead, LinkError> {
    let (host, port) = if let Some(authority) = uri.authority() {
        split_host_port(authority.as_str(), 80)
    } else if let Some(host_header) = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        split_host_port(host_header, 80)
    } else {
        return Err(LinkError::MalformedProxyRequest(
            "no authority in request-target and no Host header".to_string(),
        ));
    };

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    strip_hop_by_hop_headers(&mut headers);
    headers.insert(
        http::header::HOST,
        HeaderValue::from_str(&format!("{host}:{port}"))
            .map_err(|e| LinkError::MalformedProxyRequest(e.to_string()))?,
    );
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(HeaderName::from_static("via"), via_header_value());

    let version_str = match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    let mut head = Vec::new();
    head.extend_from_slice(method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(path_and_query.as_bytes());
    head.push(b' ');
    head.extend_from_slice(version_str.as_bytes());
    head.extend_from_slice(b"\r\n");
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    Ok(OriginFormHead {
        head_bytes: head,
        host,
        port,
    })
}

/// Result of parsing an origin-form request head recovered from an `HTTP_REQ`
/// frame.
pub struct ParsedHead {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub content_length: usize,
}

/// Parse the raw request head produced by [`build_origin_form_head`].
pub fn parse_request_head(buf: &[u8]) -> Result<ParsedHead> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req
        .parse(buf)
        .map_err(|e| LinkError::ProtocolViolation(format!("invalid request head: {e}")))?;
    if status.is_partial() {
        return Err(LinkError::ProtocolViolation(
            "truncated request head".to_string(),
        ));
    }

    let method_str = req
        .method
        .ok_or_else(|| LinkError::ProtocolViolation("missing method".to_string()))?;
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| LinkError::ProtocolViolation(format!("invalid method {method_str}")))?;
    let path = req
        .path
        .ok_or_else(|| LinkError::ProtocolViolation("missing path".to_string()))?
        .to_string();

    let mut headers = HeaderMap::new();
    for h in req.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| LinkError::ProtocolViolation(format!("invalid header name {}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| LinkError::ProtocolViolation("invalid header value".to_string()))?;
        headers.append(name, value);
    }

    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);

    Ok(ParsedHead {
        method,
        path,
        headers,
        content_length,
    })
}

/// Result of parsing the status line + headers off the front of an
/// upstream response (the ship worker reads
/// `HTTP_RESP_CHUNK` payloads, which are the origin's raw response bytes).
pub struct ParsedResponseHead {
    pub status: u16,
    pub headers: HeaderMap,
}

/// Parse a response head from `buf`. Returns `Ok(None)` if `buf` does not
/// yet contain a complete head (the caller should append more bytes and
/// retry), `Err` if what's there so far is malformed.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ParsedResponseHead, usize)>> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut header_storage);
    let status = resp
        .parse(buf)
        .map_err(|e| LinkError::ProtocolViolation(format!("invalid response head: {e}")))?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let code = resp
        .code
        .ok_or_else(|| LinkError::ProtocolViolation("missing status code".to_string()))?;

    let mut headers = HeaderMap::new();
    for h in resp.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| LinkError::ProtocolViolation(format!("invalid header name {}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| LinkError::ProtocolViolation("invalid header value".to_string()))?;
        headers.append(name, value);
    }

    Ok(Some((ParsedResponseHead { status: code, headers }, consumed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderName, HeaderValue, Method, Uri};

    #[test]
    fn strips_hop_by_hop_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("keep-alive, X-Custom"),
        );
        headers.insert(http::header::TE, HeaderValue::from_static("trailers"));
        headers.insert(
            HeaderName::from_static("x-custom"),
            HeaderValue::from_static("drop-me"),
        );
        headers.insert(
            HeaderName::from_static("x-keep"),
            HeaderValue::from_static("keep-me"),
        );
        strip_hop_by_hop_headers(&mut headers);
        assert!(!headers.contains_key(http::header::CONNECTION));
        assert!(!headers.contains_key(http::header::TE));
        assert!(!headers.contains_key("x-custom"));
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn builds_origin_form_head_from_absolute_uri() {
        let uri: Uri = "http://example.invalid:8080/path?x=1".parse().unwrap();
        let head = build_origin_form_head(&Method::GET, &uri, Version::HTTP_11, HeaderMap::new(), 0)
            .unwrap();
        assert_eq!(head.host, "example.invalid");
        assert_eq!(head.port, 8080);
        let text = String::from_utf8(head.head_bytes).unwrap();
        assert!(text.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.invalid:8080\r\n"));
        assert!(text.contains("via: 1.1 ship-proxy\r\n"));
    }

    #[test]
    fn round_trips_through_parse_request_head() {
        let uri: Uri = "http://example.invalid/hello".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-test"),
            HeaderValue::from_static("1"),
        );
        let head = build_origin_form_head(&Method::POST, &uri, Version::HTTP_11, headers, 5).unwrap();
        let parsed = parse_request_head(&head.head_bytes).unwrap();
        assert_eq!(parsed.method, Method::POST);
        assert_eq!(parsed.path, "/hello");
        assert_eq!(parsed.content_length, 5);
        assert_eq!(parsed.headers.get("x-test").unwrap(), "1");
    }

    #[test]
    fn parses_response_head_and_splits_leftover_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (head, consumed) = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers.get("content-length").unwrap(), "5");
        assert_eq!(&raw[consumed..], b"hello");
    }

    #[test]
    fn response_head_reports_partial_until_blank_line_arrives() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n";
        assert!(parse_response_head(raw).unwrap().is_none());
    }

    #[test]
    fn response_head_rejects_garbage() {
        assert!(parse_response_head(b"not an http response at all\r\n\r\n").is_err());
    }
}
