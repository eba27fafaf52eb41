// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! Process configuration: loaded once from JSON, shared read-only by every
//! session for the lifetime of the process.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;

use log::LevelFilter;
use sha2::{Digest as _, Sha224};

use crate::proto::Digest;

/// `run_type` in the config file. This crate only drives [`RunType::Server`];
/// the client role is an external collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Client,
    Server,
}

impl Default for RunType {
    fn default() -> Self {
        RunType::Client
    }
}

#[derive(serde::Deserialize)]
struct RawConfig {
    #[serde(default)]
    run_type: RunType,

    #[serde(default)]
    local_addr: String,
    #[serde(default)]
    local_port: u16,

    #[serde(default)]
    remote_addr: String,
    #[serde(default)]
    remote_port: u16,

    #[serde(default)]
    password: String,

    #[serde(default)]
    certfile: PathBuf,
    #[serde(default)]
    keyfile: PathBuf,
    #[serde(default)]
    keyfile_password: String,

    #[serde(default = "default_true")]
    ssl_verify: bool,
    #[serde(default = "default_true")]
    ssl_verify_hostname: bool,
    #[serde(default)]
    ca_certs: String,

    #[serde(default = "default_log_level")]
    log_level: u8,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> u8 {
    1
}

/// Immutable, process-lifetime configuration shared by every session.
pub struct Config {
    pub run_type: RunType,

    pub listen: SocketAddr,

    /// Fallback origin: where non-authenticated or malformed traffic goes.
    pub fallback_host: String,
    pub fallback_port: u16,

    /// SHA-224 digest of the shared secret. The plaintext password is
    /// discarded once this is computed.
    pub password_digest: Digest,

    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    pub keyfile_password: String,

    /// Used by the client role only; parsed here for config-format parity,
    /// ignored by the server session.
    pub ssl_verify: bool,
    pub ssl_verify_hostname: bool,
    pub ca_certs: String,

    pub log_level: LevelFilter,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &str) -> io::Result<Config> {
        let file = File::open(path)?;
        let raw: RawConfig = serde_json::from_reader(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let listen = format!("{}:{}", raw.local_addr, raw.local_port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        Ok(Config {
            run_type: raw.run_type,
            listen,
            fallback_host: raw.remote_addr,
            fallback_port: raw.remote_port,
            password_digest: sha224_digest(raw.password.as_bytes()),
            certfile: raw.certfile,
            keyfile: raw.keyfile,
            keyfile_password: raw.keyfile_password,
            ssl_verify: raw.ssl_verify,
            ssl_verify_hostname: raw.ssl_verify_hostname,
            ca_certs: raw.ca_certs,
            log_level: level_filter(raw.log_level),
        })
    }
}

/// Compute the SHA-224 digest of a password, as lowercase hex.
///
/// Deterministic, pure, no failure modes.
pub fn sha224_hex(password: &[u8]) -> String {
    sha224_digest(password).to_string()
}

fn sha224_digest(password: &[u8]) -> Digest {
    let raw: [u8; 28] = Sha224::digest(password).into();
    Digest::from_raw(raw)
}

/// `log_level` is 0 (most verbose) .. 4 (most quiet), inverted from the
/// usual convention — normalize to `log::LevelFilter` once, here, so the
/// rest of the program just uses ordinary `log` macros.
fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Trace,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Error,
        _ => LevelFilter::Off,
    }
}
