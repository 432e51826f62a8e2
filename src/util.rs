use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub trait AddressFamily: Sized {
    const BYTES: usize;

    fn to_ip_addr(self) -> IpAddr;
    fn from_slice(slice: &[u8]) -> Option<Self>;
}

impl AddressFamily for Ipv4Addr {
    const BYTES: usize = 4;

    fn to_ip_addr(self) -> IpAddr {
        IpAddr::V4(self)
    }

    fn from_slice(slice: &[u8]) -> Option<Self> {
        let arr: [u8; 4] = slice.try_into().ok()?;
        Some(arr.into())
    }
}

impl AddressFamily for Ipv6Addr {
    const BYTES: usize = 16;

    fn to_ip_addr(self) -> IpAddr {
        IpAddr::V6(self)
    }

    fn from_slice(slice: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = slice.try_into().ok()?;
        Some(arr.into())
    }
}

/// Reads a big-endian `u16` at `pos`, if the slice is long enough.
pub fn be_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
