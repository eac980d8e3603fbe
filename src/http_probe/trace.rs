//! Connection lifecycle hooks.
//!
//! The dialer and the hop executor call into a [`ClientTrace`] synchronously,
//! once per event and in lifecycle order. [`TimingTrace`] is the listener the
//! probe installs for each hop; it only records wall-clock instants.
//!
//! The first response byte is observed inside the I/O driver, which runs on
//! another task, so [`FirstByteWatch`] stamps it and the executor reports the
//! stamped instant once the response head is back.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Listener for the lifecycle events of a single request.
pub trait ClientTrace: Send {
    fn dns_start(&mut self, _host: &str) {}
    fn dns_done(&mut self, _addrs: &[IpAddr]) {}
    fn connect_start(&mut self, _addr: SocketAddr) {}
    fn connect_done(&mut self, _addr: SocketAddr) {}
    fn tls_handshake_start(&mut self) {}
    fn tls_handshake_done(&mut self) {}
    fn got_conn(&mut self) {}
    /// `at` is when the byte arrived, which may be earlier than the call.
    fn got_first_response_byte(&mut self, _at: Instant) {}
}

/// Timestamps of one hop. Phases that did not happen stay `None`: DNS for
/// literal IPs, TLS for plaintext.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingTrace {
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
    pub got_conn: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub body_done: Option<Instant>,
    pub remote_addr: Option<SocketAddr>,
}

impl TimingTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the end of the content transfer.
    pub fn body_done(&mut self) {
        self.body_done = Some(Instant::now());
    }

    /// Beginning of the hop: DNS start, or connect start when DNS was skipped.
    pub fn origin(&self) -> Option<Instant> {
        self.dns_start.or(self.connect_start)
    }
}

impl ClientTrace for TimingTrace {
    fn dns_start(&mut self, host: &str) {
        log::debug!("DNS lookup for {host}");
        self.dns_start = Some(Instant::now());
    }

    fn dns_done(&mut self, addrs: &[IpAddr]) {
        self.dns_done = Some(Instant::now());
        log::debug!("DNS resolved {addrs:?}");
    }

    fn connect_start(&mut self, addr: SocketAddr) {
        log::debug!("Connecting to {addr}");
        if self.connect_start.is_none() {
            self.connect_start = Some(Instant::now());
        }
    }

    fn connect_done(&mut self, addr: SocketAddr) {
        self.connect_done = Some(Instant::now());
        self.remote_addr = Some(addr);
        log::info!("Connected to {addr}");
    }

    fn tls_handshake_start(&mut self) {
        self.tls_start = Some(Instant::now());
    }

    fn tls_handshake_done(&mut self) {
        self.tls_done = Some(Instant::now());
        log::debug!("TLS handshake complete");
    }

    fn got_conn(&mut self) {
        self.got_conn = Some(Instant::now());
    }

    fn got_first_response_byte(&mut self, at: Instant) {
        self.first_byte = Some(at);
        log::debug!("Received first response byte");
    }
}

/// Stream wrapper recording when the first non-empty read completes.
#[derive(Debug)]
pub struct FirstByteWatch<T> {
    inner: T,
    first_read: Arc<OnceLock<Instant>>,
}

impl<T> FirstByteWatch<T> {
    pub fn new(inner: T) -> (Self, Arc<OnceLock<Instant>>) {
        let first_read = Arc::new(OnceLock::new());
        let watch = Self {
            inner,
            first_read: first_read.clone(),
        };
        (watch, first_read)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for FirstByteWatch<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            let _ = this.first_read.set(Instant::now());
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for FirstByteWatch<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_falls_back_to_connect_start() {
        let mut trace = TimingTrace::new();
        assert!(trace.origin().is_none());

        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        trace.connect_start(addr);
        assert_eq!(trace.origin(), trace.connect_start);

        trace.dns_start("example.com");
        assert_eq!(trace.origin(), trace.dns_start);
    }

    #[test]
    fn test_connect_start_keeps_first_attempt() {
        let mut trace = TimingTrace::new();
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        trace.connect_start(addr);
        let first = trace.connect_start;
        trace.connect_start(addr);
        assert_eq!(trace.connect_start, first);

        trace.connect_done(addr);
        assert_eq!(trace.remote_addr, Some(addr));
    }

    #[tokio::test]
    async fn test_first_byte_watch_stamps_first_read_only() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

        let (client, mut server) = duplex(64);
        let (mut watched, first_read) = FirstByteWatch::new(client);

        watched.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(first_read.get().is_none());

        let before = Instant::now();
        server.write_all(b"HTTP/1.1").await.unwrap();
        let mut buf = [0u8; 4];
        watched.read_exact(&mut buf).await.unwrap();
        let stamped = *first_read.get().unwrap();
        assert!(stamped >= before);

        watched.read_exact(&mut buf).await.unwrap();
        assert_eq!(first_read.get(), Some(&stamped));
    }

    #[test]
    fn test_first_byte_keeps_reported_instant() {
        let mut trace = TimingTrace::new();
        let at = Instant::now();
        trace.got_first_response_byte(at);
        assert_eq!(trace.first_byte, Some(at));
    }
}
