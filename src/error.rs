//! Error taxonomy for the probe.
//!
//! Every variant is fatal: the probe never retries and never degrades to a
//! partial result.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("could not parse url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported url scheme {0:?}, only http and https are supported")]
    UnsupportedScheme(String),

    #[error("header {0:?} has invalid format, missing ':'")]
    InvalidHeader(String),

    #[error("header {name:?} cannot be sent: {reason}")]
    InvalidHeaderValue { name: String, reason: String },

    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),

    #[error("only one of IPv4-only and IPv6-only may be specified")]
    ConflictingIpFamily,

    #[error("must supply a request body when {0} is used")]
    MissingBody(String),

    #[error("failed to open data file {path}: {source}")]
    BodyFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to load client cert and key pair from {path}: {reason}")]
    ClientCert { path: PathBuf, reason: String },

    #[error("failed to load profile {path}: {reason}")]
    Profile { path: PathBuf, reason: String },

    #[error("invalid DNS server {0:?}")]
    InvalidDnsServer(String),

    #[error("failed to configure TLS: {0}")]
    TlsConfig(String),

    #[error("failed to resolve host {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("unable to connect to host {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("proxy {proxy} refused tunnel: {reason}")]
    Proxy { proxy: String, reason: String },

    #[error("failed to read response: {0}")]
    Http(#[from] hyper::Error),

    #[error("unable to build request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("maximum number of redirects ({0}) followed")]
    TooManyRedirects(usize),

    #[error("no remote filename; specify an output filename to save the response body")]
    NoRemoteFilename,

    #[error("unable to create file {path}: {source}")]
    OutputFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read response body: {0}")]
    BodyRead(String),

    #[error("{phase} timed out after {seconds}s")]
    Timeout { phase: &'static str, seconds: u64 },

    #[error("probe cancelled")]
    Cancelled,
}

impl ProbeError {
    /// True for errors raised while validating the invocation, before any
    /// network activity took place.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ProbeError::InvalidUrl { .. }
                | ProbeError::UnsupportedScheme(_)
                | ProbeError::InvalidHeader(_)
                | ProbeError::InvalidHeaderValue { .. }
                | ProbeError::InvalidMethod(_)
                | ProbeError::ConflictingIpFamily
                | ProbeError::MissingBody(_)
                | ProbeError::ClientCert { .. }
                | ProbeError::Profile { .. }
                | ProbeError::InvalidDnsServer(_)
                | ProbeError::TlsConfig(_)
        )
    }
}

pub type Result<T, E = ProbeError> = std::result::Result<T, E>;
