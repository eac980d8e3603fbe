use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{
        LookupIpStrategy, NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig,
        ResolverOpts,
    },
};

use super::probe_config::{IpFamily, ProbeConfig};
use super::{CONFIG_FILE_ENV, DEFAULT_CONFIG_FILE, DNS_HOSTS_ENV};
use crate::error::{ProbeError, Result};

/// Load the probe defaults from the YAML profile and environment variables.
///
/// The profile location comes from `HTTPSTAT_CONFIG` and falls back to
/// `httpstat.yml`; a missing default profile is not an error, a missing
/// explicitly named one is. `DNS_HOSTS` replaces the profile nameservers.
pub fn load_config() -> Result<ProbeConfig> {
    let explicit = env::var(CONFIG_FILE_ENV).ok();
    let location = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_FILE));

    let mut config = if explicit.is_some() || location.exists() {
        load_profile(&location)?
    } else {
        ProbeConfig::default()
    };

    if let Ok(hosts) = env::var(DNS_HOSTS_ENV) {
        config.dns_servers = parse_dns_hosts(&hosts)?;
    }

    if !config.dns_servers.is_empty() {
        log::info!("Using DNS hosts: {:?}", config.dns_servers);
    }

    Ok(config)
}

/// Parse a single YAML profile into a `ProbeConfig`.
pub fn load_profile(path: &Path) -> Result<ProbeConfig> {
    let profile_err = |reason: String| ProbeError::Profile {
        path: path.to_path_buf(),
        reason,
    };

    let config_str = std::fs::read_to_string(path).map_err(|e| profile_err(e.to_string()))?;
    let config: ProbeConfig =
        serde_yaml::from_str(&config_str).map_err(|e| profile_err(e.to_string()))?;

    log::debug!("Loaded profile {}", path.display());
    Ok(config)
}

/// Split a comma separated list of nameserver IPs.
pub fn parse_dns_hosts(hosts: &str) -> Result<Vec<IpAddr>> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|_| ProbeError::InvalidDnsServer(s.to_string()))
        })
        .collect()
}

/// Setup a DNS resolver for a single probe invocation.
///
/// Explicit `dns_hosts` are queried over TCP; otherwise the system
/// configuration is used. Caching is disabled so that every hop of a
/// redirect chain performs (and times) its own lookup. The address family
/// restriction is applied at lookup time.
pub fn setup_resolver(dns_hosts: &[IpAddr], family: IpFamily) -> TokioAsyncResolver {
    let (resolver_config, mut opts) = if dns_hosts.is_empty() {
        match trust_dns_resolver::system_conf::read_system_conf() {
            Ok(system) => system,
            Err(e) => {
                log::warn!("Unable to read system resolver configuration, using defaults: {e}");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        }
    } else {
        let mut name_servers = NameServerConfigGroup::new();
        for ip in dns_hosts {
            name_servers.push(NameServerConfig {
                socket_addr: (*ip, 53).into(),
                protocol: Protocol::Tcp,
                tls_dns_name: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }
        (
            ResolverConfig::from_parts(None, vec![], name_servers),
            ResolverOpts::default(),
        )
    };

    opts.attempts = 2;
    opts.timeout = Duration::from_secs(5);
    opts.cache_size = 0;
    opts.ip_strategy = match family {
        IpFamily::Any => LookupIpStrategy::Ipv4thenIpv6,
        IpFamily::Ipv4 => LookupIpStrategy::Ipv4Only,
        IpFamily::Ipv6 => LookupIpStrategy::Ipv6Only,
    };

    TokioAsyncResolver::tokio(resolver_config, opts)
}
