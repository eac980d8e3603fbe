use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use tokio_util::sync::CancellationToken;

use httpstat::config::app_config::load_config;
use httpstat::http_probe::report;
use httpstat::{
    BodyDisposition, BodyOutcome, BodySource, HopReport, IpFamily, ProbeConfig, probe_url_with_cancel,
};

const HTTPS_TEMPLATE: &str = "  DNS Lookup   TCP Connection   TLS Handshake   Server Processing   Content Transfer
[{a0}  |     {a1}  |    {a2}  |        {a3}  |       {a4}  ]
            |                |               |                   |                  |
   namelookup:{b0}      |               |                   |                  |
                       connect:{b1}     |                   |                  |
                                   pretransfer:{b2}         |                  |
                                                     starttransfer:{b3}        |
                                                                                total:{b4}
";

const HTTP_TEMPLATE: &str = "   DNS Lookup   TCP Connection   Server Processing   Content Transfer
[ {a0}  |     {a1}  |        {a2}  |       {a3}  ]
             |                |                   |                  |
    namelookup:{b0}      |                   |                  |
                        connect:{b1}         |                  |
                                      starttransfer:{b2}        |
                                                                 total:{b3}
";

/// Visualise the phases of an HTTP(S) request.
#[derive(Parser, Debug)]
#[command(name = "httpstat", version, about)]
#[command(after_help = "ENVIRONMENT:\n  HTTP_PROXY, HTTPS_PROXY, NO_PROXY    forward proxy selection\n  HTTPSTAT_CONFIG                      YAML profile with default settings\n  DNS_HOSTS                            comma-separated DNS servers\n  RUST_LOG                             log filter")]
struct Cli {
    /// Target URL; the scheme defaults to https unless the port is 80
    url: String,

    /// HTTP method to use
    #[arg(short = 'X', long = "request")]
    method: Option<String>,

    /// Request body, or @file to read it from a file
    #[arg(short = 'd', long = "data")]
    data: Option<String>,

    /// Follow 30x redirects
    #[arg(short = 'L', long = "location")]
    follow_redirects: bool,

    /// Send a HEAD request
    #[arg(short = 'I', long = "head")]
    only_header: bool,

    /// Skip server certificate verification
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Save the body under its remote file name
    #[arg(short = 'O', long = "remote-name")]
    save_remote_name: bool,

    /// Save the body to this file
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// PEM file holding a client certificate and its private key
    #[arg(short = 'E', long = "cert")]
    client_cert: Option<PathBuf>,

    /// Resolve IPv4 addresses only
    #[arg(short = '4', long = "ipv4")]
    ipv4: bool,

    /// Resolve IPv6 addresses only
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,

    /// Extra request header, e.g. "Accept: text/html"; repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Print the response body instead of discarding it
    #[arg(long)]
    show_body: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,
}

fn init_logger(level: LevelFilter) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    builder.filter_module("hyper", LevelFilter::Warn);
    builder.filter_module("rustls", LevelFilter::Warn);
    builder.filter_module("trust_dns_proto", LevelFilter::Error);
    builder.filter_module("trust_dns_resolver", LevelFilter::Warn);
    builder.filter_module("httpstat", level);
    // A second init only happens in tests; ignore it.
    let _ = builder.try_init();
}

/// Command line flags layered over the profile; flags win.
fn merge_cli(mut config: ProbeConfig, cli: &Cli) -> anyhow::Result<ProbeConfig> {
    if let Some(method) = &cli.method {
        config.method = method.clone();
    }
    if let Some(data) = &cli.data {
        config.body = BodySource::from(data.clone());
    }
    config.headers.extend(cli.headers.iter().cloned());
    config.follow_redirects |= cli.follow_redirects;
    config.only_header |= cli.only_header;
    config.insecure |= cli.insecure;
    if let Some(cert) = &cli.client_cert {
        config.client_cert = Some(cert.clone());
    }

    if cli.ipv4 || cli.ipv6 {
        config.ip_family = IpFamily::from_flags(cli.ipv4, cli.ipv6)?;
    }

    if cli.save_remote_name {
        config.body_disposition = BodyDisposition::SaveRemoteName;
    } else if let Some(path) = &cli.output {
        config.body_disposition = BodyDisposition::SaveAs(path.clone());
    } else if cli.show_body {
        config.body_disposition = BodyDisposition::Inline;
    }

    Ok(config)
}

fn millis(d: Duration) -> u128 {
    d.as_millis()
}

fn fmt_phase(d: Duration) -> String {
    format!("{:>7}ms", millis(d))
}

fn fmt_total(d: Duration) -> String {
    format!("{:<9}", format!("{}ms", millis(d)))
}

fn render_timings(hop: &HopReport) -> String {
    let d = &hop.durations;
    match (d.tls_handshake, d.pre_transfer) {
        (Some(tls), Some(pre_transfer)) => HTTPS_TEMPLATE
            .replace("{a0}", &fmt_phase(d.dns_lookup))
            .replace("{a1}", &fmt_phase(d.tcp_connection))
            .replace("{a2}", &fmt_phase(tls))
            .replace("{a3}", &fmt_phase(d.server_processing))
            .replace("{a4}", &fmt_phase(d.content_transfer))
            .replace("{b0}", &fmt_total(d.name_lookup))
            .replace("{b1}", &fmt_total(d.connect))
            .replace("{b2}", &fmt_total(pre_transfer))
            .replace("{b3}", &fmt_total(d.start_transfer))
            .replace("{b4}", &fmt_total(d.total)),
        _ => HTTP_TEMPLATE
            .replace("{a0}", &fmt_phase(d.dns_lookup))
            .replace("{a1}", &fmt_phase(d.tcp_connection))
            .replace("{a2}", &fmt_phase(d.server_processing))
            .replace("{a3}", &fmt_phase(d.content_transfer))
            .replace("{b0}", &fmt_total(d.name_lookup))
            .replace("{b1}", &fmt_total(d.connect))
            .replace("{b2}", &fmt_total(d.start_transfer))
            .replace("{b3}", &fmt_total(d.total)),
    }
}

fn render_hop(hop: &HopReport) -> String {
    let mut out = String::new();

    if let Some(addr) = hop.remote_addr {
        out.push_str(&format!("\nConnected to {addr}\n"));
    }
    // Unlabeled TLS versions are reported like plaintext.
    let via = hop.connected_via.label().unwrap_or("plaintext");
    out.push_str(&format!("\nConnected via {via}\n"));

    out.push_str(&format!("\n{}\n", hop.status_line()));
    for (name, value) in &hop.headers {
        out.push_str(&format!("{name}: {value}\n"));
    }

    if let Some(message) = hop.body.message() {
        out.push_str(&format!("\n{message}\n"));
    }
    if let BodyOutcome::Inline(text) = &hop.body {
        out.push_str(&format!("\n{}\n", text.trim_end()));
    }

    out.push('\n');
    out.push_str(&render_timings(hop));
    out
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let profile = load_config().context("failed to load configuration")?;
    let config = merge_cli(profile, &cli)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = probe_url_with_cancel(&config, &cli.url, cancel, |hop| {
        print!("{}", render_hop(hop));
    })
    .await?;

    log::debug!(
        "Probe started at {} finished after {} redirect(s)",
        result.started_at.to_rfc3339(),
        result.redirects_followed
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logger(cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("httpstat: {}", report(e.as_ref()));
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpstat::{Durations, TimingTrace, TlsVersionLabel};
    use hyper::{Method, StatusCode, Version};

    fn hop(connected_via: TlsVersionLabel, durations: Durations) -> HopReport {
        HopReport {
            url: url::Url::parse("https://example.com/").unwrap(),
            method: Method::GET,
            remote_addr: Some("93.184.216.34:443".parse().unwrap()),
            connected_via,
            version: Version::HTTP_11,
            status: StatusCode::OK,
            headers: vec![
                ("Server".to_string(), "nginx".to_string()),
                ("Content-Type".to_string(), "text/html".to_string()),
            ],
            body: BodyOutcome::Discarded { bytes: 12 },
            trace: TimingTrace::default(),
            durations,
        }
    }

    #[test]
    fn test_phase_formatting() {
        assert_eq!(fmt_phase(Duration::from_millis(12)), "     12ms");
        assert_eq!(fmt_total(Duration::from_millis(12)), "12ms     ");
        assert_eq!(fmt_phase(Duration::from_micros(1_999)), "      1ms");
    }

    #[test]
    fn test_render_https_hop() {
        let durations = Durations {
            dns_lookup: Duration::from_millis(10),
            tls_handshake: Some(Duration::from_millis(39)),
            pre_transfer: Some(Duration::from_millis(72)),
            total: Duration::from_millis(150),
            ..Default::default()
        };
        let rendered = render_hop(&hop(TlsVersionLabel::Tls13, durations));

        assert!(rendered.contains("Connected to 93.184.216.34:443\n"));
        assert!(rendered.contains("Connected via TLSv1.3\n"));
        assert!(rendered.contains("HTTP/1.1 200 OK\nServer: nginx\nContent-Type: text/html\n"));
        assert!(rendered.contains("Body discarded"));
        assert!(rendered.contains("TLS Handshake"));
        assert!(rendered.contains("pretransfer:72ms"));
        assert!(rendered.contains("total:150ms"));
        assert!(!rendered.contains('{'));
    }

    #[test]
    fn test_render_plain_hop() {
        let rendered = render_hop(&hop(TlsVersionLabel::Plaintext, Durations::default()));
        assert!(rendered.contains("Connected via plaintext\n"));
        assert!(!rendered.contains("TLS Handshake"));
        assert!(rendered.contains("starttransfer:0ms"));
        assert!(!rendered.contains('{'));
    }

    #[test]
    fn test_render_inline_body() {
        let mut inline = hop(TlsVersionLabel::Tls12, Durations::default());
        inline.body = BodyOutcome::Inline("hello\n".to_string());
        let rendered = render_hop(&inline);
        assert!(rendered.contains("\nBody read\n\nhello\n"));

        inline.body = BodyOutcome::NotRead;
        assert!(!render_hop(&inline).contains("Body"));
    }

    #[test]
    fn test_cli_flags_override_profile() {
        let cli = Cli::parse_from([
            "httpstat", "-X", "post", "-d", "@body.json", "-L", "-4", "-H", "Accept: */*", "-o", "out.bin",
            "example.com",
        ]);
        let profile = ProbeConfig {
            headers: vec!["X-Profile: 1".to_string()],
            ..Default::default()
        };
        let config = merge_cli(profile, &cli).unwrap();

        assert_eq!(config.method, "post");
        assert_eq!(config.body, BodySource::File(PathBuf::from("body.json")));
        assert!(config.follow_redirects);
        assert_eq!(config.ip_family, IpFamily::Ipv4);
        assert_eq!(config.headers, vec!["X-Profile: 1", "Accept: */*"]);
        assert_eq!(config.body_disposition, BodyDisposition::SaveAs(PathBuf::from("out.bin")));
    }

    #[test]
    fn test_cli_rejects_both_families() {
        let cli = Cli::parse_from(["httpstat", "-4", "-6", "example.com"]);
        assert!(merge_cli(ProbeConfig::default(), &cli).is_err());
    }

    #[test]
    fn test_remote_name_wins_over_output() {
        let cli = Cli::parse_from(["httpstat", "-O", "-o", "out.bin", "example.com/file.tar.gz"]);
        let config = merge_cli(ProbeConfig::default(), &cli).unwrap();
        assert_eq!(config.body_disposition, BodyDisposition::SaveRemoteName);
    }
}
