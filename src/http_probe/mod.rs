pub mod body;
pub mod connect;
pub mod headers;
pub mod normalize;
pub mod probe;
pub mod proxy;
pub mod request;
pub mod result;
pub mod tls;
pub mod trace;

pub mod prelude {
    pub use super::body::BodyOutcome;
    pub use super::probe::{probe_url, probe_url_with_cancel};
    pub use super::result::{Durations, HopReport, ProbeResult, TlsVersionLabel};
    pub use super::trace::{ClientTrace, TimingTrace};
    pub use crate::error::ProbeError;
}

use std::fmt::Write;

/// Render an error together with its chain of causes.
pub fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, "\n\nCaused by: {}", src);
        err = src;
    }
    s
}
