//! Forward proxy selection.
//!
//! Matching is hyper-util's proxy matcher: `HTTP_PROXY`, `HTTPS_PROXY`,
//! `ALL_PROXY` and `NO_PROXY` in either case, with wildcard, domain suffix
//! and IP/CIDR exclusions. A profile may replace the environment with its
//! own `proxy` section. Only plain `http://` forward proxies can be dialed.

use std::fmt;
use std::net::IpAddr;

use hyper::Uri;
use hyper::header::HeaderValue;
use hyper_util::client::proxy::matcher::Matcher;
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{ProbeError, Result};

/// A forward proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    /// `Basic` credentials taken from the proxy URL's userinfo.
    pub authorization: Option<HeaderValue>,
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct ProxySettings {
    matcher: Matcher,
}

impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySettings").finish_non_exhaustive()
    }
}

impl ProxySettings {
    pub fn from_env() -> Self {
        Self {
            matcher: Matcher::from_env(),
        }
    }

    /// An explicit profile section replaces the environment entirely.
    pub fn from_config(config: &ProxyConfig) -> Self {
        if config.is_empty() {
            return Self::from_env();
        }

        let mut builder = Matcher::builder();
        if let Some(http) = &config.http {
            builder = builder.http(http.as_str());
        }
        if let Some(https) = &config.https {
            builder = builder.https(https.as_str());
        }
        if let Some(no_proxy) = &config.no_proxy {
            builder = builder.no(no_proxy.as_str());
        }
        Self {
            matcher: builder.build(),
        }
    }

    /// The proxy to dial for `url`, if any.
    pub fn proxy_for(&self, url: &Url) -> Result<Option<ProxyTarget>> {
        let host = url.host_str().unwrap_or_default().trim_matches(['[', ']']);
        // Loopback never leaves the machine.
        if is_loopback(host) {
            return Ok(None);
        }

        let uri: Uri = url.as_str().parse().map_err(|e| ProbeError::Proxy {
            proxy: url.to_string(),
            reason: format!("target is not a valid request URI: {e}"),
        })?;
        let Some(intercept) = self.matcher.intercept(&uri) else {
            return Ok(None);
        };

        let proxy = intercept.uri();
        if proxy.scheme_str() != Some("http") {
            return Err(ProbeError::Proxy {
                proxy: proxy.to_string(),
                reason: "only http:// forward proxies are supported".to_string(),
            });
        }
        let proxy_host = proxy.host().ok_or_else(|| ProbeError::Proxy {
            proxy: proxy.to_string(),
            reason: "proxy URL has no host".to_string(),
        })?;

        let target = ProxyTarget {
            host: proxy_host.trim_matches(['[', ']']).to_string(),
            port: proxy.port_u16().unwrap_or(80),
            authorization: intercept.basic_auth().cloned(),
        };
        log::debug!("Using proxy {target} for {url}");
        Ok(Some(target))
    }
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
