// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Process entry point (§4.K): parses the CLI surface and dispatches to
//! `start`/`service`/`probe`/`v2dat`.
//!
//! Grounded on the nested `dcompass/src/main.rs`'s `#[tokio::main]` shape;
//! `start` builds its own multi-thread runtime by hand (rather than via the
//! `#[tokio::main]` attribute macro) so `--cpu` can size its worker-thread
//! count at runtime.

mod cli;
mod config;
mod error;
mod metrics;
mod orchestrator;
mod plugins;
mod probe;
mod server;
mod service;
mod v2dat;

use cli::{Cli, ProbeCmd, V2datCmd};
use error::Result;
use log::info;
use std::sync::Arc;
use structopt::StructOpt;

fn run_start(config: std::path::PathBuf, dir: Option<std::path::PathBuf>, cpu: Option<usize>) -> Result<()> {
    if let Some(dir) = &dir {
        std::env::set_current_dir(dir)
            .map_err(|e| error::DnsflowError::Other(anyhow::anyhow!("chdir to {} failed: {}", dir.display(), e)))?;
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = cpu {
        builder.worker_threads(n.max(1));
    }
    let runtime = builder
        .build()
        .map_err(|e| error::DnsflowError::Other(anyhow::anyhow!("failed to build tokio runtime: {}", e)))?;

    runtime.block_on(async move {
        let forwarder = Arc::new(orchestrator::build(&config).await?);
        let metrics = Arc::new(
            metrics::Metrics::new()
                .map_err(|e| error::DnsflowError::Other(anyhow::anyhow!("failed to register metrics: {}", e)))?,
        );

        let coordinator = server::run(forwarder.clone(), metrics).await?;
        info!("dnsflow ready");

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining listeners");

        coordinator.shutdown();
        coordinator.join().await;
        forwarder.shutdown().await;
        info!("dnsflow stopped cleanly");
        Ok(())
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn run_probe(cmd: ProbeCmd) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| error::DnsflowError::Other(anyhow::anyhow!("failed to build tokio runtime: {}", e)))?;

    runtime.block_on(async move {
        match cmd {
            ProbeCmd::IdleTimeout { server } => probe::idle_timeout(server).await,
            ProbeCmd::ConnReuse { server } => probe::conn_reuse(server).await,
            ProbeCmd::Pipeline { server, count } => probe::pipeline(server, count).await,
        }
    })
}

fn run_v2dat(cmd: V2datCmd) -> Result<()> {
    match cmd {
        V2datCmd::UnpackDomain { path } => v2dat::unpack_domain(&path),
        V2datCmd::UnpackIp { path } => v2dat::unpack_ip(&path),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::from_args();
    // `start` installs its own level-aware logger from the config file's
    // `log` key once parsed; the other subcommands are short-lived CLI
    // tools and log at `warn` only, matching the teacher's CLI-tool verbosity.
    if !matches!(cli, Cli::Start { .. }) {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .init();
    }

    let result = match cli {
        Cli::Start { config, dir, cpu } => run_start(config, dir, cpu),
        Cli::Service(cmd) => service::run(cmd),
        Cli::Probe(cmd) => run_probe(cmd),
        Cli::V2dat(cmd) => run_v2dat(cmd),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
