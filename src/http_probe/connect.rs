//! Connection establishment for a single hop.
//!
//! Each step reports to the hop's [`ClientTrace`] before and after it runs,
//! so the timestamps bracket exactly the work done for that phase.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::either::Either;
use trust_dns_resolver::TokioAsyncResolver;

use super::proxy::ProxyTarget;
use super::result::TlsVersionLabel;
use super::tls::server_name;
use super::trace::ClientTrace;
use crate::config::{IpFamily, TCP_CONNECT_TIMEOUT_SECS, TLS_HANDSHAKE_TIMEOUT_SECS};
use crate::error::{ProbeError, Result};

pub type ProbeStream = Either<TcpStream, TlsStream<TcpStream>>;

/// Largest proxy `CONNECT` response head we are willing to read.
const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

/// Where and how to connect for one hop.
#[derive(Debug)]
pub struct DialTarget<'a> {
    /// Host and port of the origin server.
    pub host: &'a str,
    pub port: u16,
    /// Name presented in SNI; `None` for plaintext.
    pub tls_server_name: Option<&'a str>,
    pub proxy: Option<&'a ProxyTarget>,
}

/// An established connection, ready for the HTTP handshake.
#[derive(Debug)]
pub struct Connection {
    pub stream: ProbeStream,
    pub remote_addr: SocketAddr,
    pub tls_version: TlsVersionLabel,
    /// Server selected `h2` through ALPN.
    pub http2: bool,
}

pub struct Dialer<'a> {
    pub resolver: &'a TokioAsyncResolver,
    pub family: IpFamily,
    pub tls_config: &'a Arc<ClientConfig>,
}

impl Dialer<'_> {
    pub async fn dial(&self, target: &DialTarget<'_>, trace: &mut dyn ClientTrace) -> Result<Connection> {
        let (dial_host, dial_port) = match target.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (target.host, target.port),
        };

        let ip = self.resolve(dial_host, trace).await?;
        let addr = SocketAddr::new(ip, dial_port);

        trace.connect_start(addr);
        let mut tcp = timeout(
            Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| ProbeError::Timeout {
            phase: "TCP connect",
            seconds: TCP_CONNECT_TIMEOUT_SECS,
        })?
        .map_err(|source| ProbeError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        trace.connect_done(addr);

        if let (Some(proxy), Some(_)) = (target.proxy, target.tls_server_name) {
            let authority = format_authority(target.host, target.port);
            timeout(
                Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS),
                open_tunnel(&mut tcp, &authority, proxy),
            )
            .await
            .map_err(|_| ProbeError::Timeout {
                phase: "proxy CONNECT",
                seconds: TCP_CONNECT_TIMEOUT_SECS,
            })??;
        }

        let Some(sni) = target.tls_server_name else {
            return Ok(Connection {
                stream: Either::Left(tcp),
                remote_addr: addr,
                tls_version: TlsVersionLabel::Plaintext,
                http2: false,
            });
        };

        let name = server_name(sni)?;
        let connector = TlsConnector::from(self.tls_config.clone());

        trace.tls_handshake_start();
        let tls = timeout(
            Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS),
            connector.connect(name, tcp),
        )
        .await
        .map_err(|_| ProbeError::Timeout {
            phase: "TLS handshake",
            seconds: TLS_HANDSHAKE_TIMEOUT_SECS,
        })?
        .map_err(|source| ProbeError::Tls {
            host: sni.to_string(),
            source,
        })?;
        trace.tls_handshake_done();

        let (_, session) = tls.get_ref();
        let tls_version = TlsVersionLabel::from(session.protocol_version());
        let http2 = session.alpn_protocol() == Some(b"h2".as_slice());

        Ok(Connection {
            stream: Either::Right(tls),
            remote_addr: addr,
            tls_version,
            http2,
        })
    }

    /// Literal IPs skip DNS entirely; names are looked up with the family
    /// restriction and the first address is used.
    async fn resolve(&self, host: &str, trace: &mut dyn ClientTrace) -> Result<IpAddr> {
        let literal = host.trim_matches(['[', ']']);
        if let Ok(ip) = literal.parse::<IpAddr>() {
            if !self.family.permits(&ip) {
                return Err(ProbeError::Resolve {
                    host: host.to_string(),
                    reason: format!("address does not match {:?}", self.family),
                });
            }
            return Ok(ip);
        }

        trace.dns_start(host);
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ProbeError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        let addrs: Vec<IpAddr> = lookup.iter().filter(|ip| self.family.permits(ip)).collect();
        trace.dns_done(&addrs);

        addrs.first().copied().ok_or_else(|| ProbeError::Resolve {
            host: host.to_string(),
            reason: "no suitable address found".to_string(),
        })
    }
}

pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Ask an HTTP proxy to open a tunnel to `authority`.
async fn open_tunnel(tcp: &mut TcpStream, authority: &str, proxy: &ProxyTarget) -> Result<()> {
    let proxy_err = |reason: String| ProbeError::Proxy {
        proxy: proxy.to_string(),
        reason,
    };

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = &proxy.authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&String::from_utf8_lossy(auth.as_bytes()));
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    tcp.write_all(request.as_bytes())
        .await
        .map_err(|e| proxy_err(e.to_string()))?;

    // Read byte by byte so nothing past the response head is consumed.
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_TUNNEL_RESPONSE {
            return Err(proxy_err("response head too large".to_string()));
        }
        let byte = tcp.read_u8().await.map_err(|e| proxy_err(e.to_string()))?;
        head.push(byte);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(proxy_err(status_line.to_string()));
    }

    log::debug!("Tunnel to {authority} established via {proxy}");
    Ok(())
}
