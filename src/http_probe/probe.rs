use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::header::{LOCATION, PROXY_AUTHORIZATION};
use hyper::{Method, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use tokio_util::sync::CancellationToken;
use trust_dns_resolver::TokioAsyncResolver;
use url::Url;

use super::body::{dispose_body, is_redirect};
use super::connect::{Connection, DialTarget, Dialer};
use super::headers::ordered_headers;
use super::normalize::{normalize_url, resolve_location};
use super::proxy::ProxySettings;
use super::request::{ProbeBody, RequestTarget, build_request};
use super::result::{Durations, HopReport, ProbeResult};
use super::tls::{build_tls_config, load_client_cert};
use super::trace::{ClientTrace, FirstByteWatch, TimingTrace};
use crate::config::app_config::setup_resolver;
use crate::config::{MAX_REDIRECTS, ProbeConfig};
use crate::error::{ProbeError, Result};

/// Counts followed redirects for one invocation and enforces the bound.
#[derive(Debug, Clone, Copy)]
pub struct RedirectSession {
    hops_followed: usize,
    max_hops: usize,
}

impl RedirectSession {
    pub fn new(max_hops: usize) -> Self {
        Self {
            hops_followed: 0,
            max_hops,
        }
    }

    pub fn hops_followed(&self) -> usize {
        self.hops_followed
    }

    /// Records one more redirect. Going past the bound is fatal.
    pub fn follow(&mut self) -> Result<()> {
        if self.hops_followed >= self.max_hops {
            return Err(ProbeError::TooManyRedirects(self.max_hops));
        }
        self.hops_followed += 1;
        Ok(())
    }
}

impl Default for RedirectSession {
    fn default() -> Self {
        Self::new(MAX_REDIRECTS)
    }
}

/// Where to go next after a hop, if anywhere.
///
/// Only 3xx responses with a resolvable `Location` continue the chain; a
/// redirect without one is a normal end of the probe.
pub fn next_location(follow_redirects: bool, hop: &HopReport, location: Option<&str>) -> Option<Url> {
    if !follow_redirects || !is_redirect(hop.status) {
        return None;
    }

    let Some(location) = location else {
        log::warn!(
            "Redirect status {} for {} but no Location header",
            hop.status.as_u16(),
            hop.url
        );
        return None;
    };

    let next = resolve_location(&hop.url, location);
    if next.is_none() {
        log::warn!("Unable to follow redirect from {} to {location:?}", hop.url);
    }
    next
}

/// State shared by every hop of one invocation. Nothing outlives the call.
struct Prober<'a> {
    config: &'a ProbeConfig,
    method: Method,
    resolver: TokioAsyncResolver,
    tls_config: Arc<ClientConfig>,
    proxies: ProxySettings,
}

/// Probe `target`, following redirects when configured.
pub async fn probe_url(config: &ProbeConfig, target: &str) -> Result<ProbeResult> {
    probe_url_with_cancel(config, target, CancellationToken::new(), |_| {}).await
}

/// Same as [`probe_url`], aborting as soon as `cancel` fires. `on_hop` sees
/// every completed hop before the next one starts, so callers can render a
/// chain that later fails.
pub async fn probe_url_with_cancel(
    config: &ProbeConfig,
    target: &str,
    cancel: CancellationToken,
    mut on_hop: impl FnMut(&HopReport),
) -> Result<ProbeResult> {
    // Everything that can be checked without the network is checked first.
    config.validate()?;
    let method = config.effective_method()?;
    let mut url = normalize_url(target)?;
    let credential = config
        .client_cert
        .as_deref()
        .map(load_client_cert)
        .transpose()?;
    let tls_config = build_tls_config(config.insecure, credential.as_ref())?;

    let prober = Prober {
        config,
        method,
        resolver: setup_resolver(&config.dns_servers, config.ip_family),
        tls_config,
        proxies: ProxySettings::from_config(&config.proxy),
    };

    let started_at = Utc::now();
    let mut session = RedirectSession::default();
    let mut hops = Vec::new();

    loop {
        let (hop, location) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            visited = prober.visit(&url) => visited?,
        };

        on_hop(&hop);
        let next = next_location(config.follow_redirects, &hop, location.as_deref());
        hops.push(hop);

        let Some(next) = next else {
            break;
        };
        session.follow()?;
        log::info!("Following redirect #{} to {next}", session.hops_followed());
        url = next;
    }

    Ok(ProbeResult {
        started_at,
        hops,
        redirects_followed: session.hops_followed(),
    })
}

impl Prober<'_> {
    /// One complete, freshly traced request/response exchange. Returns the
    /// hop report and the raw `Location` header, if any.
    async fn visit(&self, url: &Url) -> Result<(HopReport, Option<String>)> {
        let mut trace = TimingTrace::new();

        let mut request =
            build_request(&self.method, url, &self.config.body, &self.config.headers).await?;
        let encrypted = url.scheme() == "https";
        let proxy = self.proxies.proxy_for(url)?;
        let host = url.host_str().unwrap_or_default();
        let port = url.port_or_known_default().unwrap_or(if encrypted { 443 } else { 80 });

        let dialer = Dialer {
            resolver: &self.resolver,
            family: self.config.ip_family,
            tls_config: &self.tls_config,
        };
        let target = DialTarget {
            host,
            port,
            tls_server_name: encrypted.then(|| request.server_name()),
            proxy: proxy.as_ref(),
        };
        let conn = dialer.dial(&target, &mut trace).await?;
        let remote_addr = conn.remote_addr;
        let connected_via = conn.tls_version;

        let request_target = match &proxy {
            _ if conn.http2 => RequestTarget::Http2,
            Some(proxy) if !encrypted => {
                if let Some(auth) = &proxy.authorization {
                    request.headers.insert(PROXY_AUTHORIZATION, auth.clone());
                }
                RequestTarget::Absolute
            }
            _ => RequestTarget::Origin,
        };
        let request = request.into_hyper(request_target)?;

        let response = send(conn, request, &mut trace).await?;

        let (parts, body) = response.into_parts();
        let location = parts
            .headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let outcome = dispose_body(
            body,
            &self.config.body_disposition,
            &self.method,
            parts.status,
            url,
            &parts.headers,
        )
        .await?;
        trace.body_done();

        let hop = HopReport {
            url: url.clone(),
            method: self.method.clone(),
            remote_addr: Some(remote_addr),
            connected_via,
            version: parts.version,
            status: parts.status,
            headers: ordered_headers(&parts.headers),
            body: outcome,
            durations: Durations::from_trace(&trace, connected_via.is_encrypted()),
            trace,
        };
        Ok((hop, location))
    }
}

/// HTTP handshake over an established connection and send the request.
/// The connection driver runs on its own task until the response is dropped.
async fn send(
    conn: Connection,
    request: hyper::Request<ProbeBody>,
    trace: &mut dyn ClientTrace,
) -> Result<Response<Incoming>> {
    if conn.http2 {
        let io = TokioIo::new(conn.stream);
        let (mut sender, connection) = http2::handshake(TokioExecutor::new(), io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("HTTP/2 connection error: {e}");
            }
        });
        trace.got_conn();
        let response = sender.send_request(request).await?;
        // Server SETTINGS arrive before any response, so the first byte of
        // the response is the HEADERS frame, seen as the head resolves.
        trace.got_first_response_byte(Instant::now());
        Ok(response)
    } else {
        let (stream, first_read) = FirstByteWatch::new(conn.stream);
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("HTTP/1.1 connection error: {e}");
            }
        });
        trace.got_conn();
        let response = sender.send_request(request).await?;
        trace.got_first_response_byte(first_read.get().copied().unwrap_or_else(Instant::now));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_probe::body::BodyOutcome;
    use crate::http_probe::result::TlsVersionLabel;
    use hyper::{StatusCode, Version};

    fn hop(url: &str, status: u16) -> HopReport {
        HopReport {
            url: Url::parse(url).unwrap(),
            method: Method::GET,
            remote_addr: None,
            connected_via: TlsVersionLabel::Plaintext,
            version: Version::HTTP_11,
            status: StatusCode::from_u16(status).unwrap(),
            headers: Vec::new(),
            body: BodyOutcome::NotRead,
            trace: TimingTrace::default(),
            durations: Durations::default(),
        }
    }

    #[test]
    fn test_session_allows_exactly_max_hops() {
        let mut session = RedirectSession::new(MAX_REDIRECTS);
        for _ in 0..MAX_REDIRECTS {
            session.follow().unwrap();
        }
        assert_eq!(session.hops_followed(), MAX_REDIRECTS);
        assert!(matches!(
            session.follow(),
            Err(ProbeError::TooManyRedirects(MAX_REDIRECTS))
        ));
        assert_eq!(session.hops_followed(), MAX_REDIRECTS);
    }

    #[test]
    fn test_next_location_requires_follow_flag() {
        let redirect = hop("http://example.com/a", 302);
        assert!(next_location(false, &redirect, Some("/b")).is_none());
        assert_eq!(
            next_location(true, &redirect, Some("/b")).unwrap().as_str(),
            "http://example.com/b"
        );
    }

    #[test]
    fn test_redirect_without_location_is_terminal() {
        let redirect = hop("http://example.com/a", 301);
        assert!(next_location(true, &redirect, None).is_none());
    }

    #[test]
    fn test_non_redirect_status_is_terminal() {
        for status in [200, 204, 299, 400, 500] {
            let response = hop("http://example.com/a", status);
            assert!(next_location(true, &response, Some("/b")).is_none());
        }
        let edge = hop("http://example.com/a", 300);
        assert!(next_location(true, &edge, Some("/b")).is_some());
    }

    #[tokio::test]
    async fn test_configuration_errors_precede_network() {
        let config = ProbeConfig {
            method: "POST".to_string(),
            ..Default::default()
        };
        // The host is unroutable; reaching the network would time out instead.
        let err = probe_url(&config, "http://10.255.255.1/").await.unwrap_err();
        assert!(matches!(err, ProbeError::MissingBody(_)));

        let config = ProbeConfig {
            client_cert: Some("/nonexistent/client.pem".into()),
            ..Default::default()
        };
        let err = probe_url(&config, "http://10.255.255.1/").await.unwrap_err();
        assert!(matches!(err, ProbeError::ClientCert { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_probe_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = probe_url_with_cancel(&ProbeConfig::default(), "http://10.255.255.1/", cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled));
    }
}
