//! PROXY protocol version 2 header codec
//!
//! Wire layout (all integers big-endian):
//!
//! | bytes  | contents                                                      |
//! |--------|---------------------------------------------------------------|
//! | 0..12  | signature `\r\n\r\n\0\r\nQUIT\n`                              |
//! | 12     | version (high nibble, always 2) and command (low nibble)      |
//! | 13     | address family (high nibble) and transport protocol (low)     |
//! | 14..16 | length of everything that follows                             |
//! | 16..   | address block, optionally followed by extension TLVs          |
//!
//! Only TCP over IPv4 and IPv6 address blocks are decoded. Blocks of any other
//! family are skipped, as are extension TLVs.
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::util::{be_u16, AddressFamily};
use crate::{
    Error::{self, *},
    ProxiedAddress,
};

pub const SIGNATURE: &[u8; 12] = b"\r\n\r\n\x00\r\nQUIT\n";

/// Length of the signature plus the fixed header fields
pub const HEADER_LEN: usize = SIGNATURE.len() + 4;

const VERSION: u8 = 0x2;

const CMD_LOCAL: u8 = 0x0;
const CMD_PROXY: u8 = 0x1;

const TCP_OVER_IPV4: u8 = 0x11;
const TCP_OVER_IPV6: u8 = 0x21;

/// Returns `true` if `peeked` starts with the complete protocol signature.
///
/// A window shorter than the signature never matches.
pub fn matches_signature(peeked: &[u8]) -> bool {
    peeked.get(..SIGNATURE.len()) == Some(&SIGNATURE[..])
}

/// Fixed part of a version 2 header
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    /// Version (high nibble) and command (low nibble)
    pub ver_cmd: u8,
    /// Address family (high nibble) and transport protocol (low nibble)
    pub fam: u8,
    /// Number of bytes following the fixed header
    pub len: u16,
}

impl Header {
    /// Decode the fixed header from a buffer starting with the signature.
    ///
    /// Fails with [`Error::UnsupportedProtocol`] if the version is not 2.
    pub fn decode(buf: &[u8]) -> Result<Header, Error> {
        if !matches_signature(buf) {
            return Err(if SIGNATURE.starts_with(buf) {
                BufferTooShort
            } else {
                MalformedHeader
            });
        }
        if buf.len() < HEADER_LEN {
            return Err(BufferTooShort);
        }

        let pos = SIGNATURE.len();
        let header = Header {
            ver_cmd: buf[pos],
            fam: buf[pos + 1],
            len: be_u16(buf, pos + 2).ok_or(BufferTooShort)?,
        };

        if header.version() != VERSION {
            return Err(UnsupportedProtocol);
        }

        Ok(header)
    }

    pub fn version(&self) -> u8 {
        self.ver_cmd >> 4
    }

    pub fn command(&self) -> u8 {
        self.ver_cmd & 0x0f
    }

    /// Total length of the header including the signature and everything
    /// covered by the length field
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.len as usize
    }
}

/// Contents following the fixed header
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AddressBlock {
    /// LOCAL command, e.g. a health check initiated by the proxy itself
    Local,
    /// PROXY command with a TCP over IPv4 or IPv6 address block
    Proxied(ProxiedAddress),
    /// PROXY command with an address family this crate does not decode
    Unsupported {
        /// Raw address family and protocol byte
        fam: u8,
        /// Number of bytes skipped
        len: usize,
    },
}

impl AddressBlock {
    pub fn proxied_address(&self) -> Option<&ProxiedAddress> {
        match self {
            AddressBlock::Proxied(addr) => Some(addr),
            _ => None,
        }
    }
}

fn parse_addrs<T: AddressFamily>(buf: &[u8], rest: usize) -> Result<ProxiedAddress, Error> {
    let block_len = T::BYTES * 2 + 4;

    if rest < block_len {
        return Err(MalformedHeader);
    }
    if buf.len() < block_len {
        return Err(BufferTooShort);
    }

    let ip = |pos: usize| T::from_slice(&buf[pos..pos + T::BYTES]).ok_or(MalformedHeader);
    let port = |pos: usize| be_u16(buf, pos).ok_or(MalformedHeader);

    Ok(ProxiedAddress {
        source: SocketAddr::new(ip(0)?.to_ip_addr(), port(T::BYTES * 2)?),
        destination: SocketAddr::new(ip(T::BYTES)?.to_ip_addr(), port(T::BYTES * 2 + 2)?),
    })
}

/// Decode the address block that follows `header`.
///
/// `buf` starts right after the fixed header. Bytes of unsupported address
/// families are not interpreted, but must all be present.
pub fn decode_address_block(buf: &[u8], header: &Header) -> Result<AddressBlock, Error> {
    let rest = header.len as usize;

    match header.command() {
        CMD_LOCAL => Ok(AddressBlock::Local),
        CMD_PROXY => match header.fam {
            TCP_OVER_IPV4 => parse_addrs::<Ipv4Addr>(buf, rest).map(AddressBlock::Proxied),
            TCP_OVER_IPV6 => parse_addrs::<Ipv6Addr>(buf, rest).map(AddressBlock::Proxied),
            fam => {
                if buf.len() < rest {
                    return Err(BufferTooShort);
                }
                Ok(AddressBlock::Unsupported { fam, len: rest })
            }
        },
        _ => Err(UnsupportedProtocol),
    }
}

/// Decode a version 2 PROXY header from a buffer.
///
/// Returns the decoded address block and the number of bytes the header
/// occupies, including any extension TLVs (which are skipped). If the buffer
/// ends before the header does, returns [`Error::BufferTooShort`].
pub fn decode(buf: &[u8]) -> Result<(AddressBlock, usize), Error> {
    let header = Header::decode(buf)?;
    let block = decode_address_block(&buf[HEADER_LEN..], &header)?;

    let total = header.total_len();
    if buf.len() < total {
        return Err(BufferTooShort);
    }

    Ok((block, total))
}

/// Outcome of inspecting the start of a stream
#[derive(Debug, Clone)]
pub(crate) enum Scan {
    /// More bytes are needed to decide
    NeedMore,
    /// The stream does not start with a header
    Passthrough,
    /// A header occupying the given number of bytes was decoded
    Header(AddressBlock, usize),
    Failed(Error),
}

/// Inspect the bytes received so far from the start of a stream.
///
/// `max_len` is the capacity of the buffer holding `buf`, `eof` whether the
/// stream has ended. A stream that ends (or cannot fit) before a complete
/// signature is seen is not proxied. Once the signature matched, running
/// out of bytes or space means the header is malformed.
pub(crate) fn scan(buf: &[u8], max_len: usize, eof: bool) -> Scan {
    let window = buf.len().min(SIGNATURE.len());
    if buf[..window] != SIGNATURE[..window] {
        return Scan::Passthrough;
    }

    if !matches_signature(buf) {
        return if eof || max_len < SIGNATURE.len() {
            Scan::Passthrough
        } else {
            Scan::NeedMore
        };
    }

    match decode(buf) {
        Ok((block, consumed)) => Scan::Header(block, consumed),
        Err(BufferTooShort) => {
            let needed = Header::decode(buf).map_or(HEADER_LEN, |h| h.total_len());
            if eof || needed > max_len {
                Scan::Failed(MalformedHeader)
            } else {
                Scan::NeedMore
            }
        }
        Err(e) => Scan::Failed(e),
    }
}

/// Encode a version 2 header into `buf`.
///
/// `None` produces a LOCAL header, otherwise a PROXY header for a TCP stream.
pub fn encode(addr: Option<&ProxiedAddress>, buf: &mut Vec<u8>) -> Result<(), Error> {
    buf.extend_from_slice(SIGNATURE);

    let (src, dest) = match addr {
        Some(addr) => (addr.source, addr.destination),
        None => {
            buf.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
            return Ok(());
        }
    };

    match (src, dest) {
        (SocketAddr::V4(src), SocketAddr::V4(dest)) => {
            buf.extend_from_slice(&[0x21, TCP_OVER_IPV4]);
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&src.ip().octets());
            buf.extend_from_slice(&dest.ip().octets());
        }
        (SocketAddr::V6(src), SocketAddr::V6(dest)) => {
            buf.extend_from_slice(&[0x21, TCP_OVER_IPV6]);
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&src.ip().octets());
            buf.extend_from_slice(&dest.ip().octets());
        }
        _ => {
            buf.truncate(buf.len() - SIGNATURE.len());
            return Err(AddressFamilyMismatch);
        }
    }

    buf.extend_from_slice(&src.port().to_be_bytes());
    buf.extend_from_slice(&dest.port().to_be_bytes());
    Ok(())
}
