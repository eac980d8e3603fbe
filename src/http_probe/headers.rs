//! Deterministic ordering of response headers for display.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use hyper::header::HeaderMap;

/// Headers that only concern a single transport-level connection.
const HOP_BY_HOP: [&str; 8] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// Exact, case-sensitive match. Names are canonicalized before sorting, so
/// `te` arrives as `Te` and is ordered as an end-to-end header.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// `Server` first, then end-to-end headers, then hop-by-hop headers;
/// lexical order within a class.
pub fn compare_header_names(a: &str, b: &str) -> Ordering {
    match (a == "Server", b == "Server") {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => is_hop_by_hop(a)
            .cmp(&is_hop_by_hop(b))
            .then_with(|| a.cmp(b)),
    }
}

pub fn sort_header_names<S: AsRef<str>>(names: &mut [S]) {
    names.sort_by(|a, b| compare_header_names(a.as_ref(), b.as_ref()));
}

/// Canonical MIME form of a header name: `content-type` becomes `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

/// Response headers in display order, with repeated fields joined by `,`.
pub fn ordered_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        grouped
            .entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let mut ordered: Vec<(String, String)> = grouped
        .into_iter()
        .map(|(name, values)| (name, values.join(",")))
        .collect();
    ordered.sort_by(|(a, _), (b, _)| compare_header_names(a, b));
    ordered
}
