use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hyper::{Method, StatusCode, Version};
use url::Url;

use super::body::BodyOutcome;
use super::trace::TimingTrace;

/// Negotiated transport security of a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersionLabel {
    Plaintext,
    Tls12,
    Tls13,
    /// Encrypted with a version that has no label.
    Unlabeled,
}

impl TlsVersionLabel {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            TlsVersionLabel::Plaintext => Some("plaintext"),
            TlsVersionLabel::Tls12 => Some("TLSv1.2"),
            TlsVersionLabel::Tls13 => Some("TLSv1.3"),
            TlsVersionLabel::Unlabeled => None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, TlsVersionLabel::Plaintext)
    }
}

impl From<Option<rustls::ProtocolVersion>> for TlsVersionLabel {
    fn from(version: Option<rustls::ProtocolVersion>) -> Self {
        match version {
            None => TlsVersionLabel::Plaintext,
            Some(rustls::ProtocolVersion::TLSv1_2) => TlsVersionLabel::Tls12,
            Some(rustls::ProtocolVersion::TLSv1_3) => TlsVersionLabel::Tls13,
            Some(_) => TlsVersionLabel::Unlabeled,
        }
    }
}

/// Phase and cumulative durations of one hop, derived from its trace.
///
/// `tls_handshake` and `pre_transfer` are only present for encrypted hops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Durations {
    pub dns_lookup: Duration,
    pub tcp_connection: Duration,
    pub tls_handshake: Option<Duration>,
    pub server_processing: Duration,
    pub content_transfer: Duration,

    pub name_lookup: Duration,
    pub connect: Duration,
    pub pre_transfer: Option<Duration>,
    pub start_transfer: Duration,
    pub total: Duration,
}

fn between(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from),
        _ => Duration::ZERO,
    }
}

impl Durations {
    pub fn from_trace(trace: &TimingTrace, encrypted: bool) -> Self {
        let origin = trace.origin();
        // DNS skipped: the lookup "ends" when connecting starts.
        let lookup_done = trace.dns_done.or(trace.connect_start);

        if encrypted {
            Durations {
                dns_lookup: between(trace.dns_start, trace.dns_done),
                tcp_connection: between(trace.connect_start, trace.connect_done),
                tls_handshake: Some(between(trace.tls_start, trace.tls_done)),
                server_processing: between(trace.got_conn, trace.first_byte),
                content_transfer: between(trace.first_byte, trace.body_done),
                name_lookup: between(origin, lookup_done),
                connect: between(origin, trace.connect_done),
                pre_transfer: Some(between(origin, trace.got_conn)),
                start_transfer: between(origin, trace.first_byte),
                total: between(origin, trace.body_done),
            }
        } else {
            Durations {
                dns_lookup: between(trace.dns_start, trace.dns_done),
                tcp_connection: between(lookup_done, trace.got_conn),
                tls_handshake: None,
                server_processing: between(trace.got_conn, trace.first_byte),
                content_transfer: between(trace.first_byte, trace.body_done),
                name_lookup: between(origin, lookup_done),
                connect: between(origin, trace.got_conn),
                pre_transfer: None,
                start_transfer: between(origin, trace.first_byte),
                total: between(origin, trace.body_done),
            }
        }
    }
}

/// Everything observed for one request/response exchange.
#[derive(Debug, Clone)]
pub struct HopReport {
    pub url: Url,
    pub method: Method,
    pub remote_addr: Option<SocketAddr>,
    pub connected_via: TlsVersionLabel,
    pub version: Version,
    pub status: StatusCode,
    /// Response headers in display order.
    pub headers: Vec<(String, String)>,
    pub body: BodyOutcome,
    pub trace: TimingTrace,
    pub durations: Durations,
}

impl HopReport {
    /// e.g. `HTTP/1.1 200 OK`.
    pub fn status_line(&self) -> String {
        let reason = self.status.canonical_reason().unwrap_or_default();
        format!(
            "{} {} {}",
            http_version_label(self.version),
            self.status.as_u16(),
            reason
        )
        .trim_end()
        .to_string()
    }
}

pub fn http_version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "UNKNOWN",
    }
}

/// Result of a whole probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub started_at: DateTime<Utc>,
    /// One entry per hop, in request order; the last is the terminal response.
    pub hops: Vec<HopReport>,
    pub redirects_followed: usize,
}

impl ProbeResult {
    pub fn final_hop(&self) -> Option<&HopReport> {
        self.hops.last()
    }
}
