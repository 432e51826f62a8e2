//! Tokio streams that strip a PROXY protocol header on first use.
//!
//! [`ProxyStream`] behaves like [`ProxyConn`](crate::ProxyConn): the header is
//! looked for on the first read (or on [`ProxyStream::remote_addr`]), stripped,
//! and the outcome is kept for the lifetime of the stream.
//!
//! ## Example
//!
//! ```no_run
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use proxied_listener::stream::AsyncProxyListener;
//! use proxied_listener::ProxyConfig;
//!
//! let listener = AsyncProxyListener::bind("[::]:1234", ProxyConfig::default()).await?;
//!
//! loop {
//!     let mut socket = listener.accept().await?;
//!     tokio::spawn(async move {
//!         println!("connection from {:?}", socket.remote_addr().await);
//!
//!         let mut buf = vec![0; 1024];
//!         loop {
//!             let n = match socket.read(&mut buf).await {
//!                 Ok(0) | Err(_) => return,
//!                 Ok(n) => n,
//!             };
//!             if socket.write_all(&buf[0..n]).await.is_err() {
//!                 return;
//!             }
//!         }
//!     });
//! }
//! # }
//! ```
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::{sleep, Sleep};
use tracing::debug;

use crate::conn::{outcome, ScanResult};
use crate::v2::{self, Scan};
use crate::{Error, ProxiedAddress, ProxyConfig, TrustPolicy};

pin_project! {
    /// Wrapper around a stream that may start with a proxy header.
    ///
    /// If looking for the header fails, every later read and write returns
    /// the same error, but the underlying stream stays open. Shut it down with
    /// [`AsyncWriteExt::shutdown`](tokio::io::AsyncWriteExt::shutdown) or drop
    /// the stream to release it.
    ///
    /// See [module level documentation](`crate::stream`)
    #[derive(Debug)]
    pub struct ProxyStream<IO> {
        #[pin]
        io: IO,
        peer: Option<SocketAddr>,
        trusted: bool,
        remaining: Vec<u8>,
        capacity: usize,
        eof: bool,
        state: Option<ScanResult>,
        header_read_timeout: Option<Duration>,
        deadline: Option<Pin<Box<Sleep>>>,
    }
}

impl<IO> ProxyStream<IO> {
    /// Wraps `io`, accepted from `peer`.
    ///
    /// If `trusted` is false, a decoded source address is never reported by
    /// [`remote_addr`](Self::remote_addr).
    pub fn new(io: IO, peer: Option<SocketAddr>, trusted: bool, config: &ProxyConfig) -> Self {
        Self {
            io,
            peer,
            trusted,
            remaining: Vec::new(),
            capacity: config.max_header_len,
            eof: false,
            state: None,
            header_read_timeout: config.header_deadline(),
            deadline: None,
        }
    }

    /// Address of the peer on the transport level (usually the proxy).
    pub fn raw_peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether a source address from the header is honoured.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    /// Gets a pinned mutable reference to the underlying stream.
    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut IO> {
        self.project().io
    }
}

impl<IO> ProxyStream<IO>
where
    IO: AsyncRead,
{
    fn poll_scan(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ScanResult> {
        let mut me = self.project();
        if let Some(res) = me.state.as_ref() {
            return Poll::Ready(res.clone());
        }

        let res = loop {
            match v2::scan(&me.remaining[..], *me.capacity, *me.eof) {
                Scan::NeedMore => {}
                Scan::Passthrough => break Ok(None),
                Scan::Header(block, consumed) => {
                    me.remaining.drain(..consumed);
                    break Ok(Some(block));
                }
                Scan::Failed(e) => break Err(e),
            }

            if let Some(timeout) = *me.header_read_timeout {
                let deadline = me.deadline.get_or_insert_with(|| Box::pin(sleep(timeout)));
                if deadline.as_mut().poll(cx).is_ready() {
                    break Err(Error::from(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out reading PROXY header",
                    )));
                }
            }

            let len = me.remaining.len();
            let room = me.capacity.saturating_sub(len);
            if room == 0 {
                // full buffer, scan again as if the stream ended
                *me.eof = true;
                continue;
            }

            me.remaining.resize(len + room, 0);
            let mut buf = ReadBuf::new(&mut me.remaining[len..]);
            let polled = me.io.as_mut().poll_read(cx, &mut buf);
            let read = buf.filled().len();
            me.remaining.truncate(len + read);

            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => break Err(e.into()),
                Poll::Ready(Ok(())) if read == 0 => *me.eof = true,
                Poll::Ready(Ok(())) => {}
            }
        };

        *me.deadline = None;
        let res = outcome(*me.peer, *me.trusted, res);
        *me.state = Some(res.clone());
        Poll::Ready(res)
    }
}

impl<IO> ProxyStream<IO>
where
    IO: AsyncRead + Unpin,
{
    /// Looks for the header if that has not happened yet, and returns the
    /// decoded addresses, whether the peer is trusted or not.
    pub async fn proxied_address(&mut self) -> Result<Option<ProxiedAddress>, Error> {
        poll_fn(|cx| Pin::new(&mut *self).poll_scan(cx)).await
    }

    /// Address of the client.
    ///
    /// This is the source address from the PROXY header if there was one and
    /// the peer is trusted, otherwise the address of the peer itself. Returns
    /// `None` if the header could not be read.
    pub async fn remote_addr(&mut self) -> Option<SocketAddr> {
        match self.proxied_address().await {
            Ok(Some(addr)) if self.trusted => Some(addr.source),
            Ok(_) => self.peer,
            Err(_) => None,
        }
    }
}

impl<IO> AsyncRead for ProxyStream<IO>
where
    IO: AsyncRead,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_scan(cx))?;
        let me = self.project();

        if !me.remaining.is_empty() {
            let len = std::cmp::min(me.remaining.len(), buf.remaining());

            buf.put_slice(&me.remaining[..len]);
            me.remaining.drain(..len);

            return Poll::Ready(Ok(()));
        }

        me.io.poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for ProxyStream<IO>
where
    IO: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.project();
        if let Some(Err(e)) = me.state {
            return Poll::Ready(Err(e.clone().into()));
        }
        me.io.poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        let me = self.project();
        if let Some(Err(e)) = me.state {
            return Poll::Ready(Err(e.clone().into()));
        }
        me.io.poll_write_vectored(cx, bufs)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

/// Tokio counterpart of [`ProxyListener`](crate::ProxyListener)
#[derive(Debug)]
pub struct AsyncProxyListener {
    listener: TcpListener,
    policy: TrustPolicy,
    config: ProxyConfig,
}

impl AsyncProxyListener {
    pub fn new(listener: TcpListener, config: ProxyConfig) -> Self {
        Self {
            policy: TrustPolicy::new(config.authorized_sources.iter().copied()),
            listener,
            config,
        }
    }

    pub async fn bind(addr: impl ToSocketAddrs, config: ProxyConfig) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?, config))
    }

    /// Waits for the next connection. The header is not read here.
    pub async fn accept(&self) -> io::Result<ProxyStream<TcpStream>> {
        let (stream, peer) = self.listener.accept().await?;

        let trusted = self.policy.is_trusted(Some(peer.ip()));
        if !trusted {
            debug!(%peer, "peer not authorized, PROXY header will be ignored");
        }

        Ok(ProxyStream::new(stream, Some(peer), trusted, &self.config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Gets a reference to the underlying listener.
    pub fn get_ref(&self) -> &TcpListener {
        &self.listener
    }

    /// Stops listening by dropping the underlying listener.
    pub fn close(self) {
        drop(self.listener);
    }
}
