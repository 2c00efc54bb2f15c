// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Main application entry point for `nhd`, the OpenFlow network
//! hypervisor daemon.

use std::sync::Arc;

use anyhow::Context;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::info;
use structopt::StructOpt;
use tokio::net::TcpListener;

use nhd::config;
use nhd::config::Opt;
use nhd::hypervisor;
use nhd::hypervisor::Hypervisor;

async fn handle_signals(hv: &Arc<Hypervisor>, mut signals: Signals) {
    let log = hv.log.new(slog::o!("unit" => "signal_handler"));
    let handle = signals.handle();

    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGQUIT | SIGINT | SIGHUP => {
                info!(log, "received signal"; "sig" => signal);
                handle.close();
                return;
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let config = config::build_config(&opt)?;

    let level: slog::Level = config
        .log_level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level {}", config.log_level))?;
    let log = common::logging::init_with_level(
        "nhd",
        &config.log_file,
        config.log_format,
        level,
    )?;
    info!(log, "nhd config: {config:#?}");

    let hv = Arc::new(Hypervisor::new(log.clone(), config));

    let listener =
        TcpListener::bind(("0.0.0.0", hv.config.listen_port))
            .await
            .context("binding the southbound listen socket")?;
    info!(log, "listening for switches"; "port" => hv.config.listen_port);

    // Set up the signal handler before anything long-running, so an
    // early signal queues instead of killing the process mid-start.
    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let signals = Signals::new(SIGNALS).unwrap();

    tokio::spawn(hypervisor::accept_loop(hv.clone(), listener));
    tokio::spawn(hypervisor::link_expiry_loop(hv.clone()));
    Hypervisor::start_slices(&hv);

    // Wait for a signal to exit.
    handle_signals(&hv, signals).await;

    info!(log, "done");
    Ok(())
}
