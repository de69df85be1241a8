//! HTTP/1.1 wire-format conversions for tunneled payloads.
//!
//! Requests travel in proxy form (the request-target as seen on a forwarding
//! hop), responses in origin form. The raw bytes are kept as the exchange
//! format so header order, duplicate headers, unusual methods and bodies
//! survive the trip untouched.

use bytes::Bytes;
use http_body_util::Full;
use hyper::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use hyper::Request;
use url::Url;

use crate::error::TunnelError;

const MAX_HEADERS: usize = 64;

/// A buffered HTTP request, target kept verbatim as it appeared on the wire.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A buffered HTTP response.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WireRequest {
    /// Build from the parts of an ingress request, preserving the original
    /// request-target (path and query).
    pub fn from_ingress(parts: hyper::http::request::Parts, body: Bytes) -> Self {
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| parts.uri.path().to_owned());

        Self {
            method: parts.method,
            target,
            headers: parts.headers,
            body,
        }
    }

    /// Serialize in proxy wire form.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = Vec::with_capacity(128 + self.body.len());
        buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.target).as_bytes());
        let length = (!self.body.is_empty()).then_some(self.body.len());
        write_headers(&mut buf, &self.headers, length);
        buf.extend_from_slice(&self.body);
        buf.into()
    }

    /// Parse a proxy-form request from wire bytes.
    pub fn from_wire(raw: &[u8]) -> Result<Self, TunnelError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parser = httparse::Request::new(&mut headers);
        let offset = match parser.parse(raw) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => {
                return Err(TunnelError::Parse("truncated http request".to_owned()));
            }
            Err(err) => return Err(TunnelError::Parse(err.to_string())),
        };

        let method = parser
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| TunnelError::Parse("invalid request method".to_owned()))?;
        let target = parser
            .path
            .ok_or_else(|| TunnelError::Parse("missing request target".to_owned()))?
            .to_owned();
        let headers = collect_headers(parser.headers)?;
        let body = body_slice(raw, offset, &headers)?;

        Ok(Self {
            method,
            target,
            headers,
            body,
        })
    }

    /// Consume the proxy-form target, rewriting it against the upstream base
    /// URL, and produce a request ready for a direct client dispatch.
    pub fn into_upstream(self, base: &Url) -> Result<Request<Full<Bytes>>, TunnelError> {
        // Url always renders a trailing "/" path; trim it so the origin-form
        // target composes without a double slash.
        let base = base.as_str().trim_end_matches('/');
        let url = Url::parse(&format!("{}{}", base, self.target))
            .map_err(|err| TunnelError::InvalidUrl(err.to_string()))?;
        let uri: hyper::Uri = url
            .as_str()
            .parse()
            .map_err(|err: hyper::http::uri::InvalidUri| TunnelError::InvalidUrl(err.to_string()))?;

        let mut req = Request::builder()
            .method(self.method)
            .uri(uri)
            .body(Full::new(self.body))
            .map_err(|err| TunnelError::Serialize(err.to_string()))?;
        *req.headers_mut() = self.headers;

        Ok(req)
    }
}

impl WireResponse {
    /// Serialize in origin wire form.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = Vec::with_capacity(128 + self.body.len());
        let reason = self.status.canonical_reason().unwrap_or("");
        buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).as_bytes());
        write_headers(&mut buf, &self.headers, Some(self.body.len()));
        buf.extend_from_slice(&self.body);
        buf.into()
    }

    /// Parse an origin-form response from wire bytes.
    pub fn from_wire(raw: &[u8]) -> Result<Self, TunnelError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parser = httparse::Response::new(&mut headers);
        let offset = match parser.parse(raw) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => {
                return Err(TunnelError::Parse("truncated http response".to_owned()));
            }
            Err(err) => return Err(TunnelError::Parse(err.to_string())),
        };

        let status = parser
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| TunnelError::Parse("invalid response status".to_owned()))?;
        let headers = collect_headers(parser.headers)?;
        let body = body_slice(raw, offset, &headers)?;

        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

/// Write the header block and the terminating blank line.
///
/// `Transfer-Encoding` never survives re-framing (bodies are fully buffered
/// before they hit the wire), so it is dropped. When `body_len` is given and
/// no `Content-Length` is present, one is synthesized so the peer can
/// delimit the body.
fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap, body_len: Option<usize>) {
    for (name, value) in headers {
        if name == TRANSFER_ENCODING {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if let Some(len) = body_len {
        if !headers.contains_key(CONTENT_LENGTH) {
            buf.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
        }
    }
    buf.extend_from_slice(b"\r\n");
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, TunnelError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|err| TunnelError::Parse(err.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|err| TunnelError::Parse(err.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Delimit the body: by `Content-Length` when present, to end-of-frame
/// otherwise (the whole message always arrives in a single frame).
fn body_slice(raw: &[u8], offset: usize, headers: &HeaderMap) -> Result<Bytes, TunnelError> {
    let rest = &raw[offset..];
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(Bytes::copy_from_slice(rest));
    };

    let len: usize = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| TunnelError::Parse("invalid content-length".to_owned()))?;
    if rest.len() < len {
        return Err(TunnelError::Parse("body shorter than content-length".to_owned()));
    }
    Ok(Bytes::copy_from_slice(&rest[..len]))
}
