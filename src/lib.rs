//! PROXY protocol v2 aware listener and connection wrappers
//!
//! When a server sits behind a load balancer, the TCP peer of every accepted
//! connection is the load balancer itself. Load balancers such as HAProxy or
//! Amazon NLB can prepend a binary
//! [PROXY protocol](https://www.haproxy.org/download/2.8/doc/proxy-protocol.txt)
//! version 2 header to the stream that carries the address of the original client.
//!
//! This crate wraps an accepting listener so that:
//!
//! - the header (if any) is detected and decoded lazily, on the first read or
//!   on the first address query of a connection, exactly once;
//! - the header bytes are stripped, so the application only ever reads its own payload;
//! - [`ProxyConn::remote_addr`] reports the original client address, but only if
//!   the immediate peer is trusted (see [`ProxyConfig::authorized_sources`]).
//!
//! Streams that do not start with the PROXY protocol signature are passed
//! through untouched. Version 1 (text) headers are not recognized.
//!
//! # Usage
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::io::Read;
//! use std::net::TcpListener;
//! use std::time::Duration;
//!
//! use proxied_listener::{ProxyConfig, ProxyListener};
//!
//! let config = ProxyConfig::default()
//!     .with_header_read_timeout(Duration::from_secs(5))
//!     .with_authorized_sources(["10.0.0.1".parse()?]);
//!
//! let listener = ProxyListener::new(TcpListener::bind("[::]:8080")?, config);
//!
//! loop {
//!     let conn = listener.accept()?;
//!     std::thread::spawn(move || {
//!         println!("connection from {:?}", conn.remote_addr());
//!
//!         let mut buf = Vec::new();
//!         let _ = (&conn).read_to_end(&mut buf);
//!     });
//! }
//! # }
//! ```
//!
//! The decoder itself lives in [`v2`] and can be used on plain byte buffers.
//! With the `tokio` feature, [`stream`] provides the same behaviour for Tokio streams.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

mod util;

pub mod conn;
pub mod io;
pub mod listener;
#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub mod stream;
pub mod v2;

pub use conn::{Connection, ProxyConn};
pub use listener::{Incoming, Listener, ProxyListener, TrustPolicy};

use std::io as stdio;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of the buffer used to look for a header.
///
/// A header (signature, fixed fields and address block) larger than this
/// is rejected as malformed.
pub const DEFAULT_MAX_HEADER_LEN: usize = 4096;

/// Address information from a PROXY protocol header
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct ProxiedAddress {
    /// Source address (this is the address of the actual client)
    pub source: SocketAddr,
    /// Destination address (this is the address of the proxy)
    pub destination: SocketAddr,
}

impl ProxiedAddress {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// Configuration for [`ProxyListener`] and the connections it accepts
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Maximum time to wait for the header when a connection is first used.
    ///
    /// [`Duration::ZERO`] means no deadline. The deadline only applies while
    /// the header is being read; the previous read timeout of the connection
    /// is restored afterwards.
    pub header_read_timeout: Duration,

    /// Peers whose headers are trusted
    ///
    /// If empty, every peer is trusted. Otherwise the address from the header
    /// is only honoured when the TCP peer address is exactly one of these.
    /// Headers from other peers are still stripped, but ignored.
    pub authorized_sources: Vec<IpAddr>,

    /// Capacity of the peek buffer, which bounds the size of an acceptable header
    ///
    /// The whole header must fit, including extension TLVs that follow an
    /// IPv4 or IPv6 address block, even though those are skipped. A larger
    /// header is rejected as [`Error::MalformedHeader`]. Raise this when the
    /// proxy in front sends large TLVs (e.g. client certificates).
    pub max_header_len: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            header_read_timeout: Duration::ZERO,
            authorized_sources: Vec::new(),
            max_header_len: DEFAULT_MAX_HEADER_LEN,
        }
    }
}

impl ProxyConfig {
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn with_authorized_sources(mut self, sources: impl IntoIterator<Item = IpAddr>) -> Self {
        self.authorized_sources = sources.into_iter().collect();
        self
    }

    pub(crate) fn header_deadline(&self) -> Option<Duration> {
        (!self.header_read_timeout.is_zero()).then_some(self.header_read_timeout)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The buffer is too short to contain a complete PROXY protocol header
    #[error("buffer too short")]
    BufferTooShort,
    /// Unknown protocol version or command
    #[error("unsupported PROXY protocol version or command")]
    UnsupportedProtocol,
    /// The header is truncated or inconsistent
    #[error("malformed PROXY protocol header")]
    MalformedHeader,
    /// The source and destination address families do not match
    #[error("source and destination address families do not match")]
    AddressFamilyMismatch,
    /// The underlying transport failed
    #[error(transparent)]
    Io(Arc<stdio::Error>),
}

impl Error {
    /// Whether this error comes from the transport rather than from the header contents
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

impl From<stdio::Error> for Error {
    fn from(err: stdio::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Error> for stdio::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => Arc::try_unwrap(inner)
                .unwrap_or_else(|shared| stdio::Error::new(shared.kind(), shared.to_string())),
            other @ Error::BufferTooShort => {
                stdio::Error::new(stdio::ErrorKind::UnexpectedEof, other)
            }
            other => stdio::Error::new(stdio::ErrorKind::InvalidData, other),
        }
    }
}
