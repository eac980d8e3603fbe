//! Outbound request construction.

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Empty, Full, StreamBody, combinators::UnsyncBoxBody};
use hyper::body::Frame;
use hyper::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use hyper::{Method, Request};
use tokio_util::io::ReaderStream;
use url::{Position, Url};

use crate::config::BodySource;
use crate::error::{ProbeError, Result};

pub type ProbeBody = UnsyncBoxBody<Bytes, std::io::Error>;

const DEFAULT_USER_AGENT: &str = concat!("httpstat/", env!("CARGO_PKG_VERSION"));

/// How the request target is written on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
    /// `GET /path?query HTTP/1.1`, direct HTTP/1 connections.
    Origin,
    /// `GET http://host/path HTTP/1.1`, plain HTTP through a forward proxy.
    Absolute,
    /// Scheme and authority carried as HTTP/2 pseudo headers.
    Http2,
}

/// Request body resolved from a `BodySource`.
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    File { file: tokio::fs::File, len: u64 },
}

/// A fully populated request for one hop.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    /// Value of the `Host` header (or `:authority`); the URL authority unless
    /// a `Host` header overrides it.
    pub host: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Split a raw `Name: Value` header line on its first colon.
///
/// Spaces around the name are trimmed; only leading spaces and colons are
/// trimmed from the value.
pub fn parse_header(raw: &str) -> Result<(&str, &str)> {
    let idx = raw
        .find(':')
        .ok_or_else(|| ProbeError::InvalidHeader(raw.to_string()))?;
    let key = raw[..idx].trim_matches(' ');
    let value = raw[idx..].trim_start_matches([' ', ':']);
    Ok((key, value))
}

/// The URL authority as it should appear in a `Host` header.
pub fn url_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Build the request for `url`. `@file` bodies are opened here, so a
/// missing file aborts before any network activity.
pub async fn build_request(
    method: &Method,
    url: &Url,
    body: &BodySource,
    headers: &[String],
) -> Result<OutboundRequest> {
    let mut request = OutboundRequest {
        method: method.clone(),
        url: url.clone(),
        host: url_authority(url),
        headers: HeaderMap::new(),
        body: open_body(body).await?,
    };

    for header in headers {
        let (key, value) = parse_header(header)?;
        if key.eq_ignore_ascii_case("host") {
            request.host = value.to_string();
            continue;
        }

        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            ProbeError::InvalidHeaderValue {
                name: key.to_string(),
                reason: e.to_string(),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| ProbeError::InvalidHeaderValue {
            name: key.to_string(),
            reason: e.to_string(),
        })?;
        request.headers.append(name, value);
    }

    if !request.headers.contains_key(USER_AGENT) {
        request
            .headers
            .insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }

    Ok(request)
}

async fn open_body(body: &BodySource) -> Result<RequestBody> {
    match body {
        BodySource::Empty => Ok(RequestBody::Empty),
        BodySource::Inline(text) => Ok(RequestBody::Bytes(Bytes::from(text.clone()))),
        BodySource::File(path) => {
            let body_err = |source| ProbeError::BodyFile {
                path: path.clone(),
                source,
            };
            let file = tokio::fs::File::open(path).await.map_err(body_err)?;
            let len = file.metadata().await.map_err(body_err)?.len();
            Ok(RequestBody::File { file, len })
        }
    }
}

impl OutboundRequest {
    /// SNI name: the effective host with any port stripped.
    pub fn server_name(&self) -> &str {
        strip_port(&self.host)
    }

    /// Convert into a hyper request written in the given target form.
    pub fn into_hyper(self, target: RequestTarget) -> Result<Request<ProbeBody>> {
        let path_and_query = &self.url[Position::BeforePath..Position::AfterQuery];
        let uri = match target {
            RequestTarget::Origin => path_and_query.to_string(),
            RequestTarget::Absolute => self.url[..Position::AfterQuery].to_string(),
            RequestTarget::Http2 => {
                format!("{}://{}{}", self.url.scheme(), self.host, path_and_query)
            }
        };

        let mut builder = Request::builder().method(self.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
            if target != RequestTarget::Http2 {
                let host = HeaderValue::from_str(&self.host).map_err(|e| {
                    ProbeError::InvalidHeaderValue {
                        name: HOST.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                headers.insert(HOST, host);
            }
        }

        let body = match self.body {
            RequestBody::Empty => Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync(),
            RequestBody::Bytes(bytes) => Full::new(bytes)
                .map_err(|never| match never {})
                .boxed_unsync(),
            RequestBody::File { file, len } => {
                if let Some(headers) = builder.headers_mut() {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
                StreamBody::new(ReaderStream::new(file).map_ok(Frame::data)).boxed_unsync()
            }
        };

        Ok(builder.body(body)?)
    }
}

/// Strip a trailing `:port` from a host, keeping IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
