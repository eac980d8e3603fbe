use url::Url;

use crate::error::{ProbeError, Result};

/// Turn a command line target into a fully qualified URL.
///
/// A scheme-less target (`example.com/path`, `//example.com:8080`) gets
/// `http` when its authority explicitly carries port 80 and `https`
/// otherwise. Already qualified URLs pass through untouched.
pub fn normalize_url(raw: &str) -> Result<Url> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        let rest = raw.strip_prefix("//").unwrap_or(raw);
        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let scheme = if rest[..authority_end].ends_with(":80") {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{rest}")
    };

    let url = Url::parse(&candidate).map_err(|source| ProbeError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProbeError::UnsupportedScheme(other.to_string())),
    }
}

/// Resolve a `Location` header value against the URL that produced it.
pub fn resolve_location(base: &Url, location: &str) -> Option<Url> {
    let resolved = base.join(location).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved),
        _ => None,
    }
}
