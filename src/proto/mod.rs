// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! Tunneling protocol
//!
//! A knowing client prepends a one-shot in-band header to its TLS-plaintext
//! stream: a 56-character hex credential digest, then a SOCKS5-like
//! command/address/port line, both terminated by `b"\r\n"`. Anything after
//! the second CRLF is payload and must be forwarded verbatim.
//!
//! ``` text
//! | digest (56 hex) | CRLF | cmd (1) | address | port (2) | CRLF | payload |
//! ```
//!
//! A server that fails to parse this header, or whose digest doesn't match,
//! must not behave any differently on the wire than it would for a
//! legitimate tunnel: both paths end up splicing the connection somewhere,
//! the only difference is where.

use std::fmt::{self, Display, Formatter};
use subtle::ConstantTimeEq;

mod addr;
pub use addr::*;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// The data is malformed or truncated.
#[derive(Debug)]
pub struct ProtocolError;

impl From<ProtocolError> for std::io::Error {
    fn from(_: ProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed tunnel request")
    }
}

/// A SHA-224 credential digest, always 56 lowercase hex characters.
///
/// Equality is constant-time: see [`Digest::from_hex`] for the parser and
/// [`crate::config::sha224_hex`] for the hashing function used at config
/// load time.
#[derive(Clone, Copy, Debug)]
pub struct Digest {
    raw: [u8; 28],
}

impl Digest {
    /// Build a digest directly from its raw 28-byte SHA-224 output.
    #[inline]
    pub fn from_raw(raw: [u8; 28]) -> Self {
        Digest { raw }
    }

    /// Parse 56 hex characters into a digest.
    ///
    /// # Errors
    ///
    /// If `bytes` is shorter than 56 bytes or contains non-hex characters.
    #[inline]
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes = bytes.get(..56).ok_or(ProtocolError)?;
        let mut raw = [0u8; 28];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = hex_byte(bytes[i * 2], bytes[i * 2 + 1])?;
        }
        Ok(Digest { raw })
    }

    /// Lowercase hex encoding, always 56 bytes of valid UTF-8.
    #[inline]
    pub fn to_hex(&self) -> [u8; 56] {
        let mut out = [0u8; 56];
        for (i, b) in self.raw.iter().enumerate() {
            let (h0, h1) = byte_hex(*b);
            out[2 * i] = h0;
            out[2 * i + 1] = h1;
        }
        out
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        // hex digits are always valid UTF-8
        f.write_str(std::str::from_utf8(&hex).unwrap())
    }
}

impl PartialEq for Digest {
    /// Constant-time over the fixed 28-byte digest.
    fn eq(&self, other: &Self) -> bool {
        self.raw.as_slice().ct_eq(other.raw.as_slice()).into()
    }
}

impl Eq for Digest {}

/// A tunneling command. Only [`Command::Connect`] is honored; others parse
/// but cause the session to fall through to fallback mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// `0x01`: open a TCP connection to the requested address.
    Connect = 0x01,
    /// Any other command byte the wire format permits but this server does
    /// not implement (e.g. UDP associate).
    Other = 0xff,
}

impl Command {
    #[inline]
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Command::Connect,
            _ => Command::Other,
        }
    }
}

/// A parsed tunneling request, borrowing from the buffer it was parsed from.
pub struct Request<'a> {
    pub digest: Digest,
    pub cmd: Command,
    pub addr: Address<'a>,
    /// Bytes following the header's closing CRLF — must be forwarded as
    /// the first write on the outbound socket, verbatim.
    pub payload: &'a [u8],
}

impl<'a> Request<'a> {
    /// Parse a full request header out of `bytes`.
    ///
    /// Never blocks for more data: if `bytes` doesn't contain a complete,
    /// well-formed header, this returns `Err` and the caller should fall
    /// back rather than wait for more bytes.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        let head = bytes.get(..59).ok_or(ProtocolError)?;
        let digest = Digest::from_hex(head)?;
        if &head[56..58] != CRLF {
            return Err(ProtocolError);
        }
        let cmd = Command::from_byte(head[58]);

        let addr = Address::parse(&bytes[59..])?;

        let offset = 59 + addr.wire_len() + 2;
        let tail = bytes.get(offset - 2..offset).ok_or(ProtocolError)?;
        if tail != CRLF {
            return Err(ProtocolError);
        }

        Ok(Request {
            digest,
            cmd,
            addr,
            payload: &bytes[offset..],
        })
    }

    /// Serialize back into wire format. Used by tests to round-trip.
    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(56 + 2 + 1 + self.addr.wire_len() + 2 + self.payload.len());
        buf.extend(self.digest.to_hex());
        buf.extend(CRLF);
        buf.push(match self.cmd {
            Command::Connect => 0x01,
            Command::Other => 0x00,
        });
        self.addr.write_to(&mut buf);
        buf.extend(CRLF);
        buf.extend(self.payload);
        buf
    }
}

#[inline]
fn hex_byte(h0: u8, h1: u8) -> Result<u8, ProtocolError> {
    Ok(hex_nibble(h0)? << 4 | hex_nibble(h1)?)
}

#[inline]
fn hex_nibble(h: u8) -> Result<u8, ProtocolError> {
    match h {
        b'0'..=b'9' => Ok(h - b'0'),
        b'a'..=b'f' => Ok(h - b'a' + 0x0a),
        _ => Err(ProtocolError),
    }
}

#[inline]
fn byte_hex(b: u8) -> (u8, u8) {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    (TABLE[(b >> 4) as usize], TABLE[(b & 0x0f) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_hex_round_trip() {
        let raw = [0x3a; 28];
        let d = Digest { raw };
        let hex = d.to_hex();
        assert_eq!(hex.len(), 56);
        assert!(hex.iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        let parsed = Digest::from_hex(&hex).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn digest_rejects_non_hex() {
        let mut bytes = [b'0'; 56];
        bytes[0] = b'z';
        assert!(Digest::from_hex(&bytes).is_err());
    }

    #[test]
    fn digest_rejects_short_input() {
        assert!(Digest::from_hex(b"deadbeef").is_err());
    }

    fn sample_digest() -> Digest {
        Digest::from_hex(&[b'a'; 56]).unwrap()
    }

    #[test]
    fn request_round_trip_ipv4() {
        let req = Request {
            digest: sample_digest(),
            cmd: Command::Connect,
            addr: Address::V4([1, 2, 3, 4].into(), 80),
            payload: b"GET / HTTP/1.0\r\n\r\n",
        };
        let bytes = req.to_bytes();
        let parsed = Request::parse(&bytes).unwrap();
        assert_eq!(parsed.digest, req.digest);
        assert_eq!(parsed.cmd, Command::Connect);
        assert_eq!(parsed.addr, req.addr);
        assert_eq!(parsed.payload, req.payload);
    }

    #[test]
    fn request_round_trip_domain_no_payload() {
        let req = Request {
            digest: sample_digest(),
            cmd: Command::Connect,
            addr: Address::Domain("example.com".into(), 443),
            payload: b"",
        };
        let bytes = req.to_bytes();
        let parsed = Request::parse(&bytes).unwrap();
        assert_eq!(parsed.addr, req.addr);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn request_round_trip_ipv6() {
        let req = Request {
            digest: sample_digest(),
            cmd: Command::Connect,
            addr: Address::V6(std::net::Ipv6Addr::LOCALHOST, 8443),
            payload: b"x",
        };
        let bytes = req.to_bytes();
        let parsed = Request::parse(&bytes).unwrap();
        assert_eq!(parsed.addr, req.addr);
        assert_eq!(parsed.payload, b"x");
    }

    #[test]
    fn request_rejects_truncated_header() {
        let req = Request {
            digest: sample_digest(),
            cmd: Command::Connect,
            addr: Address::Domain("example.com".into(), 443),
            payload: b"",
        };
        let mut bytes = req.to_bytes();
        bytes.truncate(bytes.len() - 5);
        assert!(Request::parse(&bytes).is_err());
    }

    #[test]
    fn request_rejects_bad_atyp() {
        let mut bytes = vec![b'a'; 56];
        bytes.extend(CRLF);
        bytes.push(0x01); // cmd
        bytes.push(0x09); // bad atyp
        bytes.extend(b"garbage");
        bytes.extend(CRLF);
        assert!(Request::parse(&bytes).is_err());
    }
}
