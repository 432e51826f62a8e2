//! Connections that strip a PROXY protocol header on first use.
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::io::PeekReader;
use crate::v2::AddressBlock;
use crate::{Error, ProxiedAddress, ProxyConfig};

/// A connected byte stream.
///
/// All methods take `&self`, so the same connection can be read from on one
/// thread while its address is queried from another.
pub trait Connection {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn flush(&self) -> io::Result<()>;

    /// Shuts down both halves of the connection.
    fn close(&self) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn read_timeout(&self) -> io::Result<Option<Duration>>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }

    fn close(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        TcpStream::read_timeout(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Read half handed to the peek buffer
#[derive(Debug)]
struct Source<C>(Arc<C>);

impl<C: Connection> Read for Source<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Connection::read(&*self.0, buf)
    }
}

pub(crate) type ScanResult = Result<Option<ProxiedAddress>, Error>;

/// Logs the result of looking for a header and keeps the address worth reporting.
pub(crate) fn outcome(
    peer: Option<SocketAddr>,
    trusted: bool,
    res: Result<Option<AddressBlock>, Error>,
) -> ScanResult {
    match res {
        Ok(None) => {
            trace!(?peer, "no PROXY header");
            Ok(None)
        }
        Ok(Some(AddressBlock::Local)) => {
            debug!(?peer, "PROXY header with LOCAL command");
            Ok(None)
        }
        Ok(Some(AddressBlock::Proxied(addr))) => {
            debug!(
                ?peer,
                source = %addr.source,
                destination = %addr.destination,
                trusted,
                "decoded PROXY header"
            );
            Ok(Some(addr))
        }
        Ok(Some(AddressBlock::Unsupported { fam, len })) => {
            debug!(?peer, family = fam, len, "skipped unsupported address family");
            Ok(None)
        }
        Err(e) => {
            warn!(?peer, error = %e, "failed to read PROXY header, closing connection");
            Err(e)
        }
    }
}

/// Connection accepted through a [`ProxyListener`](crate::ProxyListener).
///
/// The first read, or the first call to [`remote_addr`](Self::remote_addr),
/// looks for a PROXY protocol header at the start of the stream and strips it.
/// This happens exactly once, even if both are called concurrently; every
/// later call observes the outcome of that scan, including its error.
///
/// If the scan fails the connection is closed and every subsequent read
/// returns the same error.
#[derive(Debug)]
pub struct ProxyConn<C> {
    conn: Arc<C>,
    reader: Mutex<PeekReader<Source<C>>>,
    state: Mutex<Option<ScanResult>>,
    trusted: bool,
    header_read_timeout: Option<Duration>,
}

impl<C> ProxyConn<C>
where
    C: Connection,
{
    /// Wraps `conn`. If `trusted` is false, a decoded source address is never
    /// reported by [`remote_addr`](Self::remote_addr).
    pub fn new(conn: C, trusted: bool, config: &ProxyConfig) -> Self {
        let conn = Arc::new(conn);

        Self {
            reader: Mutex::new(PeekReader::with_capacity(
                config.max_header_len,
                Source(conn.clone()),
            )),
            conn,
            state: Mutex::new(None),
            trusted,
            header_read_timeout: config.header_deadline(),
        }
    }

    /// Address of the client.
    ///
    /// This is the source address from the PROXY header if there was one and
    /// the peer is trusted, otherwise the address of the peer itself. Returns
    /// `None` if the header could not be read, or the peer address is unknown.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self.scanned() {
            Ok(Some(addr)) if self.trusted => Some(addr.source),
            Ok(_) => self.conn.peer_addr().ok(),
            Err(_) => None,
        }
    }

    /// Addresses decoded from the PROXY header, whether the peer is trusted or not.
    pub fn proxied_address(&self) -> Result<Option<ProxiedAddress>, Error> {
        self.scanned()
    }

    /// Address of the peer on the transport level (usually the proxy).
    pub fn raw_peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn.local_addr()
    }

    /// Whether a source address from the header is honoured.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Gets a reference to the underlying connection.
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn close(&self) -> io::Result<()> {
        self.conn.close()
    }

    fn scanned(&self) -> ScanResult {
        let mut state = self.state.lock();
        state.get_or_insert_with(|| self.scan()).clone()
    }

    fn scan(&self) -> ScanResult {
        let peer = self.conn.peer_addr().ok();

        let res = outcome(peer, self.trusted, self.read_header());
        if res.is_err() {
            let _ = self.conn.close();
        }
        res
    }

    fn read_header(&self) -> Result<Option<AddressBlock>, Error> {
        let mut reader = self.reader.lock();

        let Some(timeout) = self.header_read_timeout else {
            return reader.read_header();
        };

        let previous = self.conn.read_timeout()?;
        self.conn.set_read_timeout(Some(timeout))?;

        let res = reader.read_header().map_err(|e| match e {
            // std reports an expired read timeout as WouldBlock on unix
            Error::Io(inner) if inner.kind() == io::ErrorKind::WouldBlock => io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out reading PROXY header",
            )
            .into(),
            e => e,
        });

        // a failed restore must not mask the scan error
        let restored = self.conn.set_read_timeout(previous);
        let block = res?;
        restored?;
        Ok(block)
    }
}

impl<C> Read for &ProxyConn<C>
where
    C: Connection,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.scanned()?;
        self.reader.lock().read(buf)
    }
}

impl<C> Read for ProxyConn<C>
where
    C: Connection,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }
}

impl<C> Write for &ProxyConn<C>
where
    C: Connection,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

impl<C> Write for ProxyConn<C>
where
    C: Connection,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

impl<C> Connection for ProxyConn<C>
where
    C: Connection,
{
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.conn.flush()
    }

    fn close(&self) -> io::Result<()> {
        self.conn.close()
    }

    /// Same as [`ProxyConn::remote_addr`], but reports why the address is unknown.
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.scanned()? {
            Some(addr) if self.trusted => Ok(addr.source),
            _ => self.conn.peer_addr(),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn.local_addr()
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.conn.read_timeout()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.conn.set_read_timeout(timeout)
    }
}
