// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! The per-connection session state machine.
//!
//! `Session::run` drives one accepted, TLS-terminated connection through
//! classification, dial, full-duplex relay and teardown. A valid tunneling
//! request connects to its requested target; anything else — bad digest,
//! malformed header, a plain browser saying hello — connects to the
//! fallback origin instead. Both paths look identical from the wire: same
//! handshake already happened, same shape of dial-then-splice, same
//! teardown. That's the whole point.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::proto::Request;

/// Caps how much of the first TLS-plaintext read we buffer to look for a
/// tunneling header.
const MAX_LENGTH: usize = 8192;

/// Where the state machine currently is when teardown happens — reported in
/// the disconnect log line so a dangling connection can be told apart from
/// one that never got past the header. The forwarding loop itself is `relay`
/// below, which already has the "at most one outstanding read/write per
/// direction" property the forwarding discipline requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Handshake,
    ConnectingRemote,
    Forwarding,
    Destroying,
}

/// One accepted, TLS-terminated connection.
pub struct Session {
    config: Arc<Config>,
    peer: SocketAddr,
    status: Status,
}

impl Session {
    pub fn new(config: Arc<Config>, peer: SocketAddr) -> Self {
        Session {
            config,
            peer,
            status: Status::Handshake,
        }
    }

    /// Drive the session to completion. `stream` is the already-accepted
    /// TLS stream (handshake is the acceptor's job, not this state
    /// machine's — see [`crate::server`]).
    ///
    /// Idempotent in effect: this consumes `self`, so there is exactly one
    /// teardown per session by construction. Returns the error that caused
    /// teardown, if any; accept-loop callers log it and move on.
    pub async fn run<S>(mut self, mut stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.drive(&mut stream).await;

        let last = self.status;
        self.status = Status::Destroying;
        match &result {
            Ok(()) => log::info!("{}: disconnected ({:?})", self.peer, last),
            Err(e) => log::info!("{}: disconnected ({:?}): {}", self.peer, last, e),
        }
        result
    }

    async fn drive<S>(&mut self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; MAX_LENGTH];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);

        self.status = Status::ConnectingRemote;

        match self.classify(&buf) {
            Classified::Tunnel { target, payload_at } => {
                let target_display = target.to_string();
                let sockaddr = match target.resolve().await {
                    Ok(a) => a,
                    Err(e) => {
                        log::error!("{}: cannot resolve {}: {}", self.peer, target_display, e);
                        return Err(e);
                    }
                };
                let mut outbound = match tokio::net::TcpStream::connect(sockaddr).await {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!(
                            "{}: cannot establish connection to {}: {}",
                            self.peer,
                            target_display,
                            e
                        );
                        return Err(e);
                    }
                };
                log::info!("{}: tunnel established to {}", self.peer, target_display);

                self.status = Status::Forwarding;
                let payload = &buf[payload_at..];
                if !payload.is_empty() {
                    outbound.write_all(payload).await?;
                }
                relay(stream, outbound).await
            }
            Classified::NotATunnel => {
                let sockaddr = match self.resolve_fallback().await {
                    Ok(a) => a,
                    Err(e) => {
                        log::error!(
                            "{}: cannot resolve fallback {}:{}: {}",
                            self.peer,
                            self.config.fallback_host,
                            self.config.fallback_port,
                            e
                        );
                        return Err(e);
                    }
                };
                let mut outbound = match tokio::net::TcpStream::connect(sockaddr).await {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!(
                            "{}: cannot establish connection to fallback {}:{}: {}",
                            self.peer,
                            self.config.fallback_host,
                            self.config.fallback_port,
                            e
                        );
                        return Err(e);
                    }
                };
                log::info!(
                    "{}: not a tunnel request, falling back to {}:{}",
                    self.peer,
                    self.config.fallback_host,
                    self.config.fallback_port
                );

                self.status = Status::Forwarding;
                if !buf.is_empty() {
                    outbound.write_all(&buf).await?;
                }
                relay(stream, outbound).await
            }
        }
    }

    /// Parse and authenticate the first read. Never blocks for more bytes:
    /// a buffer that doesn't contain a complete, valid header classifies as
    /// "not a tunnel" rather than waiting for more.
    fn classify<'a>(&self, buf: &'a [u8]) -> Classified<'a> {
        let req = match Request::parse(buf) {
            Ok(req) => req,
            Err(_) => {
                log::warn!("{}: malformed tunnel header", self.peer);
                return Classified::NotATunnel;
            }
        };

        if req.digest != self.config.password_digest {
            log::warn!("{}: bad password", self.peer);
            return Classified::NotATunnel;
        }

        if req.cmd != crate::proto::Command::Connect {
            log::warn!("{}: unsupported command", self.peer);
            return Classified::NotATunnel;
        }

        let payload_at = buf.len() - req.payload.len();
        Classified::Tunnel {
            target: req.addr,
            payload_at,
        }
    }

    async fn resolve_fallback(&self) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((self.config.fallback_host.as_str(), self.config.fallback_port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
    }
}

/// Splice two streams bidirectionally, same as `tokio::io::copy_bidirectional`,
/// except each direction shuts its writer down on its own once its reader
/// hits EOF, and that shutdown's outcome is discarded rather than
/// propagated. A failed close-notify on a side that has already finished
/// relaying isn't a relay failure — the original trojan server's own
/// teardown explicitly ignores this error the same way.
async fn relay<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    tokio::try_join!(pump(ar, bw), pump(br, aw))?;
    Ok(())
}

async fn pump(mut r: impl AsyncRead + Unpin, mut w: impl AsyncWrite + Unpin) -> io::Result<()> {
    tokio::io::copy(&mut r, &mut w).await?;
    let _ = w.shutdown().await;
    Ok(())
}

enum Classified<'a> {
    Tunnel {
        target: crate::proto::Address<'a>,
        payload_at: usize,
    },
    NotATunnel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sha224_hex;
    use crate::proto::Digest;
    use tokio::net::TcpListener;

    fn test_config(fallback: SocketAddr) -> Arc<Config> {
        Arc::new(Config {
            run_type: crate::config::RunType::Server,
            listen: "127.0.0.1:0".parse().unwrap(),
            fallback_host: fallback.ip().to_string(),
            fallback_port: fallback.port(),
            password_digest: Digest::from_hex(sha224_hex(b"hunter2").as_bytes()).unwrap(),
            certfile: Default::default(),
            keyfile: Default::default(),
            keyfile_password: String::new(),
            ssl_verify: true,
            ssl_verify_hostname: true,
            ca_certs: String::new(),
            log_level: log::LevelFilter::Off,
        })
    }

    /// A minimal echo server standing in for "the dial target" or "the
    /// fallback origin": accepts one connection, echoes back everything
    /// until EOF.
    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let (mut r, mut w) = sock.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            }
        });
        addr
    }

    /// A server that records every byte it receives on the first
    /// connection, without echoing anything back.
    async fn spawn_capture_server() -> (SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let _ = sock.read_to_end(&mut buf).await;
                let _ = tx.send(buf);
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn s1_happy_path_ipv4_connect() {
        let (target_addr, rx) = spawn_capture_server().await;
        let fallback_addr = spawn_echo_server().await;
        let config = test_config(fallback_addr);

        let pwd = sha224_hex(b"hunter2");
        let octets = target_addr.ip().to_string();
        let parts: Vec<u8> = octets.split('.').map(|p| p.parse().unwrap()).collect();
        let mut wire = Vec::new();
        wire.extend(pwd.as_bytes());
        wire.extend(b"\r\n");
        wire.push(0x01); // CONNECT
        wire.push(0x01); // IPv4
        wire.extend(&parts);
        wire.extend(target_addr.port().to_be_bytes());
        wire.extend(b"\r\n");
        wire.extend(b"GET / HTTP/1.0\r\n\r\n");

        let (client, server) = tokio::io::duplex(MAX_LENGTH * 2);
        let session = Session::new(config, "10.0.0.1:1234".parse().unwrap());

        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(&wire).await.unwrap();

        let run = tokio::spawn(session.run(server));
        let got = rx.await.unwrap();
        assert_eq!(got, b"GET / HTTP/1.0\r\n\r\n");

        drop(client_w);
        let mut drain = Vec::new();
        let _ = client_r.read_to_end(&mut drain).await;
        let _ = run.await;
    }

    #[tokio::test]
    async fn s2_happy_path_domain_no_payload() {
        let (target_addr, rx) = spawn_capture_server().await;
        let fallback_addr = spawn_echo_server().await;
        let config = test_config(fallback_addr);

        let pwd = sha224_hex(b"hunter2");
        let mut wire = Vec::new();
        wire.extend(pwd.as_bytes());
        wire.extend(b"\r\n");
        wire.push(0x01);
        wire.push(0x03);
        wire.push(9);
        wire.extend(b"127.0.0.1");
        wire.extend(target_addr.port().to_be_bytes());
        wire.extend(b"\r\n");

        let (client, server) = tokio::io::duplex(MAX_LENGTH * 2);
        let session = Session::new(config, "10.0.0.1:1234".parse().unwrap());
        let (_client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(&wire).await.unwrap();

        let run = tokio::spawn(session.run(server));
        let got = rx.await.unwrap();
        assert!(got.is_empty());

        drop(client_w);
        let _ = run.await;
    }

    #[tokio::test]
    async fn s3_wrong_password_falls_back_verbatim() {
        let (fallback_addr, rx) = spawn_capture_server().await;
        let config = test_config(fallback_addr);

        let wire = vec![b'X'; 300];

        let (client, server) = tokio::io::duplex(MAX_LENGTH * 2);
        let session = Session::new(config, "10.0.0.1:1234".parse().unwrap());
        let (_client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(&wire).await.unwrap();

        let run = tokio::spawn(session.run(server));
        let got = rx.await.unwrap();
        assert_eq!(got, wire);

        drop(client_w);
        let _ = run.await;
    }

    #[tokio::test]
    async fn s4_right_password_malformed_header_falls_back_verbatim() {
        let (fallback_addr, rx) = spawn_capture_server().await;
        let config = test_config(fallback_addr);

        let pwd = sha224_hex(b"hunter2");
        let mut wire = Vec::new();
        wire.extend(pwd.as_bytes());
        wire.extend(b"\r\n");
        wire.push(0x01);
        wire.push(0x09); // bad atyp
        wire.extend(b"garbage");
        wire.extend(b"\r\n");

        let (client, server) = tokio::io::duplex(MAX_LENGTH * 2);
        let session = Session::new(config, "10.0.0.1:1234".parse().unwrap());
        let (_client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(&wire).await.unwrap();

        let run = tokio::spawn(session.run(server));
        let got = rx.await.unwrap();
        assert_eq!(got, wire);

        drop(client_w);
        let _ = run.await;
    }

    #[tokio::test]
    async fn s5_resolve_failure_tears_down() {
        // a reserved, unresolvable TLD (RFC 2606): resolve() itself fails
        let config = test_config("127.0.0.1:1".parse().unwrap());
        let pwd = sha224_hex(b"hunter2");
        let mut wire = Vec::new();
        wire.extend(pwd.as_bytes());
        wire.extend(b"\r\n");
        let domain: &[u8] = b"does-not-exist.invalid";
        wire.push(0x01);
        wire.push(0x03);
        wire.push(domain.len() as u8);
        wire.extend(domain);
        wire.extend(80u16.to_be_bytes());
        wire.extend(b"\r\n");

        let (client, server) = tokio::io::duplex(MAX_LENGTH * 2);
        let session = Session::new(config, "10.0.0.1:1234".parse().unwrap());
        let (_client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(&wire).await.unwrap();

        let result = session.run(server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn teardown_is_idempotent_in_effect() {
        // Session::run consumes self and returns exactly once by
        // construction; calling it "twice" isn't expressible, which is the
        // point — there's no second teardown to perform.
        let fallback_addr = spawn_echo_server().await;
        let config = test_config(fallback_addr);
        let (client, server) = tokio::io::duplex(MAX_LENGTH * 2);
        let session = Session::new(config, "10.0.0.1:1234".parse().unwrap());
        drop(client);
        let result = session.run(server).await;
        assert!(result.is_ok() || result.is_err());
    }
}
