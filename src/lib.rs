//! Timing probe for a single HTTP(S) request.
//!
//! [`probe_url`] issues one request, records the DNS, TCP, TLS, server
//! processing and content transfer phases, and follows redirects hop by hop
//! (each hop on a fresh connection with its own trace) when asked to.

pub mod config;
pub mod error;
pub mod http_probe;

pub use config::{BodyDisposition, BodySource, IpFamily, ProbeConfig, ProxyConfig};
pub use error::ProbeError;
pub use http_probe::prelude::*;
