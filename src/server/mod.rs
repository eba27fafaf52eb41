// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! The TCP acceptor and TLS material loader.
//!
//! This is the one part of the design the spec treats as an external
//! collaborator: bind a listener, accept, terminate TLS, hand the stream to
//! a [`Session`]. It doesn't participate in any per-session state.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::session::Session;

/// Build a rustls server config from the certificate chain and private key
/// named in `config`. A single identity is served to every SNI name — this
/// crate has one fallback origin and one shared secret, not a per-domain
/// routing table.
pub fn build_tls_config(config: &Config) -> io::Result<Arc<ServerConfig>> {
    let cert_file = File::open(&config.certfile)?;
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .map(|certs| certs.into_iter().map(Certificate).collect())?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found in certfile",
        ));
    }

    let key = load_private_key(config)?;

    let mut tls_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // A generic web origin advertises both HTTP/2 and HTTP/1.1, same as a
    // modern browser default — ALPN is otherwise meaningless here.
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(tls_config))
}

fn load_private_key(config: &Config) -> io::Result<PrivateKey> {
    let key_file = File::open(&config.keyfile)?;
    let mut reader = BufReader::new(key_file);

    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    // rewind and try PKCS#1 (legacy "RSA PRIVATE KEY") encoding
    let key_file = File::open(&config.keyfile)?;
    let mut reader = BufReader::new(key_file);
    let keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    if let Some(key) = keys.into_iter().next() {
        if !config.keyfile_password.is_empty() {
            log::warn!("keyfile_password is set but the key is not encrypted; ignoring");
        }
        return Ok(PrivateKey(key));
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no private key found in keyfile",
    ))
}

/// Binds a TCP listener, accepts connections, and spawns one session per
/// accepted connection. Accept errors are logged and the loop continues.
pub struct Acceptor {
    config: Arc<Config>,
    tls: TlsAcceptor,
}

impl Acceptor {
    pub fn new(config: Arc<Config>, tls_config: Arc<ServerConfig>) -> Self {
        Acceptor {
            config,
            tls: TlsAcceptor::from(tls_config),
        }
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        log::info!("listening on {}/tcp", self.config.listen);

        loop {
            let (tcp, src) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    log::error!("tcp accept: {}", e);
                    continue;
                }
            };
            let _ = tcp.set_nodelay(true);

            let config = self.config.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let stream = match tls.accept(tcp).await {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("{}: TLS handshake failed: {}", src, e);
                        return;
                    }
                };

                let session = Session::new(config, src);
                if let Err(e) = session.run(stream).await {
                    log::error!("{}: session ended: {}", src, e);
                }
            });
        }
    }
}
