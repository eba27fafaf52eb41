// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use trojan_relay::config::{Config, RunType};
use trojan_relay::server::{build_tls_config, Acceptor};

fn main() -> ExitCode {
    unsafe { simple_logger::init().unwrap_unchecked() };
    log::set_max_level(log::LevelFilter::Info);

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            log::warn!("no config file path provided, using config.json");
            String::from("config.json")
        }
    };

    match run(&path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("exited unexpectedly: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(path: &str) -> io::Result<()> {
    let config = Config::load(path)?;
    log::set_max_level(config.log_level);

    if config.run_type != RunType::Server {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "run_type must be \"server\"; the client role is a separate program",
        ));
    }

    let tls_config = build_tls_config(&config)?;
    let config = Arc::new(config);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let acceptor = Acceptor::new(config, tls_config);
    rt.spawn(async move {
        if let Err(e) = acceptor.run().await {
            log::error!("acceptor fatal: {}", e);
        }
    });

    rt.block_on(tokio::signal::ctrl_c())?;
    log::info!("SIGINT received, exiting...");

    Ok(())
}
