//! Response body disposition.

use std::path::{Path, PathBuf};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONTENT_DISPOSITION, HeaderMap};
use hyper::{Method, StatusCode};
use percent_encoding::percent_decode_str;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::BodyDisposition;
use crate::error::{ProbeError, Result};

/// What became of a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyOutcome {
    /// `HEAD` requests and redirects never read a body.
    NotRead,
    Discarded { bytes: u64 },
    Saved { path: PathBuf, bytes: u64 },
    Inline(String),
}

impl BodyOutcome {
    /// Informational message for the caller to render, if any.
    pub fn message(&self) -> Option<String> {
        match self {
            BodyOutcome::NotRead => None,
            BodyOutcome::Discarded { .. } => Some("Body discarded".to_string()),
            BodyOutcome::Saved { path, .. } => Some(format!("Body read into {}", path.display())),
            BodyOutcome::Inline(_) => Some("Body read".to_string()),
        }
    }
}

pub fn is_redirect(status: StatusCode) -> bool {
    (300..400).contains(&status.as_u16())
}

/// Whether a response body should be consumed at all.
pub fn should_read_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD && !is_redirect(status)
}

/// Filename from a `Content-Disposition: attachment` header. An RFC 5987
/// `filename*` wins over a plain `filename`. Directory components are dropped.
pub fn filename_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let (disposition, params) = parse_disposition(value);
    if !disposition.eq_ignore_ascii_case("attachment") {
        return None;
    }

    let param = |name: &str| {
        params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    };
    let name = param("filename*")
        .and_then(decode_ext_value)
        .or_else(|| param("filename").map(str::to_string))?;

    Path::new(&name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// Splits a header value into its leading token and `name=value` parameters.
/// Quoted values may contain `;` and backslash escapes.
fn parse_disposition(value: &str) -> (&str, Vec<(String, String)>) {
    let (disposition, mut rest) = value.split_once(';').unwrap_or((value, ""));
    let mut params = Vec::new();

    loop {
        rest = rest.trim_start_matches([' ', '\t', ';']);
        if rest.is_empty() {
            break;
        }

        let name_end = rest.find(['=', ';']).unwrap_or(rest.len());
        let name = rest[..name_end].trim().to_string();
        rest = &rest[name_end..];
        let Some(raw) = rest.strip_prefix('=') else {
            continue;
        };
        let raw = raw.trim_start();

        let (value, remaining) = match raw.strip_prefix('"') {
            Some(quoted) => {
                let mut value = String::new();
                let mut end = quoted.len();
                let mut escaped = false;
                for (i, c) in quoted.char_indices() {
                    if escaped {
                        value.push(c);
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        end = i + 1;
                        break;
                    } else {
                        value.push(c);
                    }
                }
                (value, &quoted[end..])
            }
            None => {
                let end = raw.find(';').unwrap_or(raw.len());
                (raw[..end].trim().to_string(), &raw[end..])
            }
        };

        if !name.is_empty() {
            params.push((name, value));
        }
        rest = remaining;
    }

    (disposition.trim(), params)
}

/// Decodes an RFC 5987 `charset'language'percent-encoded` value.
fn decode_ext_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = percent_decode_str(parts.next()?);

    if charset.eq_ignore_ascii_case("utf-8") {
        encoded.decode_utf8().ok().map(|name| name.into_owned())
    } else if charset.eq_ignore_ascii_case("iso-8859-1") {
        Some(encoded.map(char::from).collect())
    } else {
        log::debug!("Unsupported filename* charset {charset:?}");
        None
    }
}

/// Last path segment of the request URL, ignoring a trailing slash.
pub fn filename_from_url(url: &Url) -> Option<String> {
    let path = url.path().trim_end_matches('/');
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Output path for `SaveRemoteName`: `Content-Disposition` first, URL second.
pub fn remote_filename(url: &Url, headers: &HeaderMap) -> Result<PathBuf> {
    filename_from_headers(headers)
        .or_else(|| filename_from_url(url))
        .map(PathBuf::from)
        .ok_or(ProbeError::NoRemoteFilename)
}

/// Consume (or skip) the body of a response according to the disposition.
pub async fn dispose_body(
    mut body: Incoming,
    disposition: &BodyDisposition,
    method: &Method,
    status: StatusCode,
    url: &Url,
    headers: &HeaderMap,
) -> Result<BodyOutcome> {
    if !should_read_body(method, status) {
        return Ok(BodyOutcome::NotRead);
    }

    let path = match disposition {
        BodyDisposition::Discard => None,
        BodyDisposition::SaveAs(path) => Some(path.clone()),
        BodyDisposition::SaveRemoteName => Some(remote_filename(url, headers)?),
        BodyDisposition::Inline => {
            let bytes = body
                .collect()
                .await
                .map_err(|e| ProbeError::BodyRead(e.to_string()))?
                .to_bytes();
            return Ok(BodyOutcome::Inline(
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
    };

    let mut file = match &path {
        Some(path) => Some(tokio::fs::File::create(path).await.map_err(|source| {
            ProbeError::OutputFile {
                path: path.clone(),
                source,
            }
        })?),
        None => None,
    };

    let mut bytes = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProbeError::BodyRead(e.to_string()))?;
        if let Some(data) = frame.data_ref() {
            bytes += data.len() as u64;
            if let Some(file) = file.as_mut() {
                file.write_all(data)
                    .await
                    .map_err(|e| ProbeError::BodyRead(e.to_string()))?;
            }
        }
    }

    match (path, file) {
        (Some(path), Some(mut file)) => {
            file.flush()
                .await
                .map_err(|e| ProbeError::BodyRead(e.to_string()))?;
            log::debug!("Wrote {bytes} bytes to {}", path.display());
            Ok(BodyOutcome::Saved { path, bytes })
        }
        _ => Ok(BodyOutcome::Discarded { bytes }),
    }
}
