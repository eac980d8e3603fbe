pub mod app_config;
pub mod probe_config;

pub use probe_config::{BodyDisposition, BodySource, IpFamily, ProbeConfig, ProxyConfig};

/// Number of redirects followed before the probe gives up.
pub const MAX_REDIRECTS: usize = 10;

/// Upper bound for establishing a TCP connection (including a proxy tunnel).
pub const TCP_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Upper bound for the TLS handshake.
pub const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Environment variable pointing at an optional YAML profile with probe defaults.
pub const CONFIG_FILE_ENV: &str = "HTTPSTAT_CONFIG";

/// Profile location used when `HTTPSTAT_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "httpstat.yml";

/// Comma separated nameserver IPs overriding the system resolver.
pub const DNS_HOSTS_ENV: &str = "DNS_HOSTS";
