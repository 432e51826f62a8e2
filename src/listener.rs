//! Listener wrapper deciding which peers may send a PROXY header.
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};

use tracing::debug;

use crate::conn::{Connection, ProxyConn};
use crate::ProxyConfig;

/// Source of accepted connections
pub trait Listener {
    type Conn;

    fn accept(&self) -> io::Result<Self::Conn>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).map(|(stream, _)| stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Set of peers whose PROXY headers are honoured
///
/// An empty set trusts every peer. Addresses are compared exactly (no
/// subnets); IPv4-mapped IPv6 addresses are treated as the IPv4 address.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    authorized: Option<HashSet<IpAddr>>,
}

impl TrustPolicy {
    /// Policy that trusts every peer
    pub fn trust_all() -> Self {
        Default::default()
    }

    pub fn new(sources: impl IntoIterator<Item = IpAddr>) -> Self {
        let authorized: HashSet<_> = sources.into_iter().map(|ip| ip.to_canonical()).collect();

        Self {
            authorized: (!authorized.is_empty()).then_some(authorized),
        }
    }

    /// Whether a header received from `peer` should be honoured.
    ///
    /// A peer with an unknown address is only trusted if every peer is.
    pub fn is_trusted(&self, peer: Option<IpAddr>) -> bool {
        match &self.authorized {
            None => true,
            Some(authorized) => peer.is_some_and(|ip| authorized.contains(&ip.to_canonical())),
        }
    }
}

/// Listener whose connections may start with a PROXY protocol v2 header
///
/// Accepting a connection never reads from it; the header is looked for on
/// first use of the returned [`ProxyConn`].
#[derive(Debug)]
pub struct ProxyListener<L> {
    listener: L,
    policy: TrustPolicy,
    config: ProxyConfig,
}

impl<L> ProxyListener<L>
where
    L: Listener,
    L::Conn: Connection,
{
    pub fn new(listener: L, config: ProxyConfig) -> Self {
        Self {
            policy: TrustPolicy::new(config.authorized_sources.iter().copied()),
            listener,
            config,
        }
    }

    /// Waits for the next connection.
    pub fn accept(&self) -> io::Result<ProxyConn<L::Conn>> {
        let conn = self.listener.accept()?;

        let peer = conn.peer_addr().ok();
        let trusted = self.policy.is_trusted(peer.map(|addr| addr.ip()));
        if !trusted {
            debug!(?peer, "peer not authorized, PROXY header will be ignored");
        }

        Ok(ProxyConn::new(conn, trusted, &self.config))
    }

    /// Iterator over accepted connections, which never returns `None`.
    pub fn incoming(&self) -> Incoming<'_, L> {
        Incoming { listener: self }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Gets a reference to the underlying listener.
    pub fn get_ref(&self) -> &L {
        &self.listener
    }

    /// Stops listening by dropping the underlying listener.
    ///
    /// Connections already accepted are not affected.
    pub fn close(self) {
        drop(self.listener);
    }
}

impl<L> Listener for ProxyListener<L>
where
    L: Listener,
    L::Conn: Connection,
{
    type Conn = ProxyConn<L::Conn>;

    fn accept(&self) -> io::Result<Self::Conn> {
        ProxyListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        ProxyListener::local_addr(self)
    }
}

/// Iterator returned by [`ProxyListener::incoming`]
#[derive(Debug)]
pub struct Incoming<'a, L> {
    listener: &'a ProxyListener<L>,
}

impl<L> Iterator for Incoming<'_, L>
where
    L: Listener,
    L::Conn: Connection,
{
    type Item = io::Result<ProxyConn<L::Conn>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.listener.accept())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::conn::tests::MockConn;
    use crate::{v2, Error, ProxiedAddress};

    struct MockListener(Mutex<Vec<MockConn>>);

    impl Listener for MockListener {
        type Conn = MockConn;

        fn accept(&self) -> io::Result<MockConn> {
            self.0
                .lock()
                .pop()
                .ok_or_else(|| io::ErrorKind::WouldBlock.into())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("10.0.0.1:80".parse().unwrap())
        }
    }

    fn header(source: &str) -> Vec<u8> {
        let addr = ProxiedAddress::new(source.parse().unwrap(), "10.0.0.1:80".parse().unwrap());
        let mut buf = Vec::new();
        v2::encode(Some(&addr), &mut buf).unwrap();
        buf
    }

    fn loopback(config: ProxyConfig) -> ProxyListener<TcpListener> {
        ProxyListener::new(TcpListener::bind("127.0.0.1:0").unwrap(), config)
    }

    #[test]
    fn test_trust_policy() {
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let policy = TrustPolicy::trust_all();
        assert!(policy.is_trusted(Some(local)));
        assert!(policy.is_trusted(None));

        assert!(TrustPolicy::new([]).is_trusted(Some(local)));

        let policy = TrustPolicy::new(["10.0.0.1".parse().unwrap(), "2001:db8::1".parse().unwrap()]);
        assert!(policy.is_trusted(Some("10.0.0.1".parse().unwrap())));
        assert!(policy.is_trusted(Some("2001:db8::1".parse().unwrap())));
        assert!(!policy.is_trusted(Some("10.0.0.2".parse().unwrap())));
        assert!(!policy.is_trusted(Some(local)));
        assert!(!policy.is_trusted(None));

        // IPv4-mapped IPv6 peers match their IPv4 entry
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());
        assert!(policy.is_trusted(Some(mapped)));
        assert!(!policy.is_trusted(Some(IpAddr::V6(Ipv6Addr::LOCALHOST))));
    }

    #[test]
    fn test_accept_applies_policy() {
        let mut input = header("203.0.113.9:4000");
        input.extend_from_slice(b"payload");

        let listener = ProxyListener::new(
            MockListener(Mutex::new(vec![
                MockConn::new("192.168.1.10:50000", vec![input.clone()]),
                MockConn::new("10.0.0.2:50000", vec![input]),
            ])),
            ProxyConfig::default().with_authorized_sources(["10.0.0.2".parse().unwrap()]),
        );

        let trusted = listener.accept().unwrap();
        assert!(trusted.is_trusted());
        assert_eq!(trusted.remote_addr(), Some("203.0.113.9:4000".parse().unwrap()));

        let untrusted = listener.accept().unwrap();
        assert!(!untrusted.is_trusted());
        assert_eq!(untrusted.remote_addr(), Some("192.168.1.10:50000".parse().unwrap()));

        let mut buf = Vec::new();
        (&untrusted).read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload");

        assert!(listener.accept().is_err());
    }

    #[test]
    fn test_accept_does_not_scan() {
        let listener = ProxyListener::new(
            MockListener(Mutex::new(vec![MockConn::new(
                "192.168.1.10:50000",
                vec![b"\r\n\r\n\0\r\nQUIT\n\x21".to_vec()],
            )])),
            ProxyConfig::default(),
        );

        // the truncated header only surfaces on first use
        let conn = listener.accept().unwrap();
        assert!(!conn.get_ref().is_closed());
        assert!(matches!(conn.proxied_address(), Err(Error::MalformedHeader)));
        assert!(conn.get_ref().is_closed());
    }

    #[test]
    fn test_loopback_proxied() {
        let listener = loopback(ProxyConfig::default());
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&header("10.0.0.5:1234")).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        });

        let mut conn = listener.accept().unwrap();
        let mut buf = String::new();
        conn.read_to_string(&mut buf).unwrap();
        client.join().unwrap();

        assert_eq!(buf, "GET / HTTP/1.1\r\n");
        assert_eq!(conn.remote_addr(), Some("10.0.0.5:1234".parse().unwrap()));
        assert_eq!(
            conn.raw_peer_addr().unwrap().ip(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[test]
    fn test_loopback_untrusted() {
        let listener =
            loopback(ProxyConfig::default().with_authorized_sources(["10.9.9.9".parse().unwrap()]));
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&header("10.0.0.5:1234")).unwrap();
            stream.write_all(b"hello").unwrap();
            stream.local_addr().unwrap()
        });

        let mut conn = listener.incoming().next().unwrap().unwrap();
        let mut buf = String::new();
        conn.read_to_string(&mut buf).unwrap();
        let client_addr = client.join().unwrap();

        assert_eq!(buf, "hello");
        assert_eq!(conn.remote_addr(), Some(client_addr));
    }

    #[test]
    fn test_loopback_plain() {
        let listener = loopback(ProxyConfig::default());
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").unwrap();
            stream.local_addr().unwrap()
        });

        let mut conn = listener.accept().unwrap();
        let mut buf = String::new();
        conn.read_to_string(&mut buf).unwrap();
        let client_addr = client.join().unwrap();

        assert_eq!(buf, "SSH-2.0-OpenSSH_9.6\r\n");
        assert_eq!(conn.remote_addr(), Some(client_addr));
    }

    #[test]
    fn test_loopback_header_timeout() {
        let listener = loopback(
            ProxyConfig::default().with_header_read_timeout(Duration::from_millis(100)),
        );
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&v2::SIGNATURE[..6]).unwrap();

            // the server gives up on the header and closes the connection
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0; 16];
            stream.read(&mut buf).unwrap()
        });

        let conn = listener.accept().unwrap();
        let mut buf = [0; 16];
        let err = (&conn).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // recorded, the connection is not read from again
        let err = (&conn).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(conn.remote_addr(), None);

        assert_eq!(client.join().unwrap(), 0);
    }
}
