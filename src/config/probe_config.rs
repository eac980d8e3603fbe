use std::net::IpAddr;
use std::path::PathBuf;

use hyper::Method;
use serde::Deserialize;

use crate::error::{ProbeError, Result};
use crate::http_probe::request::parse_header;

/// Restriction on the address family used when dialing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl IpFamily {
    /// Maps the pair of IPv4-only / IPv6-only switches onto a family.
    /// Asking for both is a configuration error.
    pub fn from_flags(ipv4_only: bool, ipv6_only: bool) -> Result<Self> {
        match (ipv4_only, ipv6_only) {
            (true, true) => Err(ProbeError::ConflictingIpFamily),
            (true, false) => Ok(IpFamily::Ipv4),
            (false, true) => Ok(IpFamily::Ipv6),
            (false, false) => Ok(IpFamily::Any),
        }
    }

    pub fn permits(&self, ip: &IpAddr) -> bool {
        match self {
            IpFamily::Any => true,
            IpFamily::Ipv4 => ip.is_ipv4(),
            IpFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Where the request body comes from. A raw value starting with `@` names a
/// local file that is streamed as the body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum BodySource {
    #[default]
    Empty,
    Inline(String),
    File(PathBuf),
}

impl BodySource {
    pub fn is_empty(&self) -> bool {
        matches!(self, BodySource::Empty)
    }
}

impl From<&str> for BodySource {
    fn from(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix('@') {
            BodySource::File(PathBuf::from(path))
        } else if raw.is_empty() {
            BodySource::Empty
        } else {
            BodySource::Inline(raw.to_string())
        }
    }
}

impl From<String> for BodySource {
    fn from(raw: String) -> Self {
        BodySource::from(raw.as_str())
    }
}

/// What happens to the body of the terminal response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyDisposition {
    #[default]
    Discard,
    /// Write the body to the given file.
    SaveAs(PathBuf),
    /// Write the body to a file named after `Content-Disposition` or the URL path.
    SaveRemoteName,
    /// Hand the body back to the caller for display.
    Inline,
}

/// Forward proxy URLs. When none is set, the conventional environment
/// variables apply instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
    /// Comma separated hosts, domains, IPs or CIDR blocks reached directly.
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none() && self.no_proxy.is_none()
    }
}

/// Immutable per-invocation configuration of a probe.
///
/// Every field has a default, so a YAML profile only needs to carry the
/// values it wants to change.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// HTTP verb, `GET` unless specified.
    pub method: String,

    /// Request body, inline text or `@filename`.
    pub body: BodySource,

    /// Raw `Name: Value` header lines, applied in order.
    pub headers: Vec<String>,

    /// Follow 30x responses, re-probing every hop.
    pub follow_redirects: bool,

    /// Send `HEAD` and never read a body.
    pub only_header: bool,

    /// Skip server certificate verification.
    pub insecure: bool,

    /// PEM bundle holding one client certificate and its private key.
    pub client_cert: Option<PathBuf>,

    pub ip_family: IpFamily,

    pub body_disposition: BodyDisposition,

    /// Nameservers to query instead of the system configuration.
    pub dns_servers: Vec<IpAddr>,

    pub proxy: ProxyConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: Method::GET.to_string(),
            body: BodySource::Empty,
            headers: Vec::new(),
            follow_redirects: false,
            only_header: false,
            insecure: false,
            client_cert: None,
            ip_family: IpFamily::Any,
            body_disposition: BodyDisposition::Discard,
            dns_servers: Vec::new(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl ProbeConfig {
    /// The method actually sent on the wire. `only_header` forces `HEAD`.
    pub fn effective_method(&self) -> Result<Method> {
        if self.only_header {
            return Ok(Method::HEAD);
        }
        parse_method(&self.method)
    }

    /// Runs every configuration check that does not need the network.
    pub fn validate(&self) -> Result<()> {
        let method = parse_method(&self.method)?;
        if (method == Method::POST || method == Method::PUT) && self.body.is_empty() {
            return Err(ProbeError::MissingBody(method.to_string()));
        }

        for header in &self.headers {
            parse_header(header)?;
        }

        Ok(())
    }
}

fn parse_method(raw: &str) -> Result<Method> {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return Ok(Method::GET);
    }
    Method::from_bytes(upper.as_bytes()).map_err(|_| ProbeError::InvalidMethod(raw.to_string()))
}
