// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use super::ProtocolError;

/// Socks5-like address field.
///
/// ``` text
/// | ATYP (1) | DST.ADDR (variable) | DST.PORT (2) |
/// ```
///
/// - `0x01` IPv4: `DST.ADDR` is 4 octets.
/// - `0x03` DOMAINNAME: `DST.ADDR` is `<len:1><len bytes>`.
/// - `0x04` IPv6: `DST.ADDR` is 16 octets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address<'a> {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(Cow<'a, str>, u16),
}

impl<'a> Address<'a> {
    /// Parse a Socks5-like address field from the front of `bytes`.
    ///
    /// Doesn't consume the whole slice — trailing bytes (port, CRLF,
    /// payload) are the caller's concern.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        let atyp = *bytes.first().ok_or(ProtocolError)?;
        match atyp {
            0x01 => {
                let b = bytes.get(1..7).ok_or(ProtocolError)?;
                let addr = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = u16::from_be_bytes([b[4], b[5]]);
                Ok(Address::V4(addr, port))
            }
            0x03 => {
                let len = *bytes.get(1).ok_or(ProtocolError)? as usize;
                let b = bytes.get(2..2 + len + 2).ok_or(ProtocolError)?;
                let name = std::str::from_utf8(&b[..len]).map_err(|_| ProtocolError)?;
                let port = u16::from_be_bytes([b[len], b[len + 1]]);
                Ok(Address::Domain(Cow::Borrowed(name), port))
            }
            0x04 => {
                let b = bytes.get(1..19).ok_or(ProtocolError)?;
                let octets: [u8; 16] = b[..16].try_into().unwrap();
                let addr = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([b[16], b[17]]);
                Ok(Address::V6(addr, port))
            }
            _ => Err(ProtocolError),
        }
    }

    /// Number of bytes this address takes on the wire (ATYP + addr + port).
    pub fn wire_len(&self) -> usize {
        match self {
            Address::V4(..) => 1 + 4 + 2,
            Address::V6(..) => 1 + 16 + 2,
            Address::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    /// Append the wire encoding to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Address::V4(addr, port) => {
                buf.push(0x01);
                buf.extend(addr.octets());
                buf.extend(port.to_be_bytes());
            }
            Address::V6(addr, port) => {
                buf.push(0x04);
                buf.extend(addr.octets());
                buf.extend(port.to_be_bytes());
            }
            Address::Domain(name, port) => {
                buf.push(0x03);
                buf.push(name.len() as u8);
                buf.extend(name.as_bytes());
                buf.extend(port.to_be_bytes());
            }
        }
    }

    /// Resolve the requested target to a single socket address. IPv4/IPv6
    /// literals resolve trivially; a domain name goes through DNS. Kept
    /// apart from the connect step so the caller can log and report the two
    /// failure kinds distinctly — a lookup failure and a refused connection
    /// are not the same event.
    ///
    /// Only the first resolved endpoint (for domain names) is attempted —
    /// happy-eyeballs is out of scope.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            Address::V4(addr, port) => Ok(SocketAddr::V4(SocketAddrV4::new(*addr, *port))),
            Address::V6(addr, port) => Ok(SocketAddr::V6(SocketAddrV6::new(*addr, *port, 0, 0))),
            Address::Domain(name, port) => tokio::net::lookup_host((name.as_ref(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no addresses found for domain")
                }),
        }
    }
}

impl Display for Address<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(addr, port) => write!(f, "{}:{}", addr, port),
            Address::V6(addr, port) => write!(f, "[{}]:{}", addr, port),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}
