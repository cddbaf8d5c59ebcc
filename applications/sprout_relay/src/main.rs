// Copyright 2022, The Sprout Developers
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Sprout relay
//!
//! Serves a local grove of Arbor nodes over the sprout protocol: listens on
//! a TLS port, dials the peers given as arguments, and keeps everything
//! synchronized both ways for as long as it runs.

mod cli;
mod tls;
mod watcher;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::*;
use sprout::{ConnectionDirection, RelayConfig, SubscriberStore, Worker};
use sprout_forest::Grove;
use sprout_shutdown::{Shutdown, ShutdownSignal};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_rustls::{client, TlsAcceptor, TlsConnector};

use crate::cli::Cli;

const LOG_TARGET: &str = "sprout_relay";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let grove = Grove::open(&cli.grovepath)
        .with_context(|| format!("opening grove at {}", cli.grovepath.display()))?;
    info!(
        target: LOG_TARGET,
        "Serving grove at '{}' with {} node(s)",
        grove.path().display(),
        grove.node_count()
    );
    let store = Arc::new(SubscriberStore::new(grove));
    let mut shutdown = Shutdown::new();

    // keep the watcher alive until shutdown or events stop flowing
    let _watcher = watcher::watch_grove(cli.grovepath.clone(), store.clone(), shutdown.to_signal())
        .context("watching grove directory")?;

    let acceptor = tls::acceptor(&cli.certpath, &cli.keypath).context("loading TLS credentials")?;
    let listener = TcpListener::bind(("0.0.0.0", cli.tls_port))
        .await
        .with_context(|| format!("binding TLS listener on port {}", cli.tls_port))?;
    info!(target: LOG_TARGET, "Listening for sprout connections on port {}", cli.tls_port);
    tokio::spawn(listen(listener, acceptor, store.clone(), shutdown.to_signal()));

    if cli.selftest {
        tokio::spawn(selftest(cli.tls_port));
    }

    let connector = tls::connector(cli.insecure);
    for address in &cli.peers {
        match dial(&connector, address).await {
            Ok(stream) => {
                let worker = Worker::new(
                    stream,
                    store.clone(),
                    RelayConfig::default(),
                    ConnectionDirection::Outbound,
                    address.clone(),
                    shutdown.to_signal(),
                );
                tokio::spawn(worker.run());
            },
            Err(err) => {
                warn!(target: LOG_TARGET, "Failed to connect to {}: {:#}", address, err);
            },
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt signal")?;
    info!(target: LOG_TARGET, "Interrupt received, shutting down");
    shutdown.trigger();
    Ok(())
}

async fn listen(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    store: Arc<SubscriberStore<Grove>>,
    mut shutdown_signal: ShutdownSignal,
) {
    let mut worker_count = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_signal => {
                info!(target: LOG_TARGET, "Listener shutting down");
                break;
            },
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(target: LOG_TARGET, "Failed accepting connection: {}", err);
                        continue;
                    },
                };
                let acceptor = acceptor.clone();
                let store = store.clone();
                let worker_signal = shutdown_signal.clone();
                let label = format!("worker-{} ({})", worker_count, peer_addr);
                worker_count += 1;
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            info!(target: LOG_TARGET, "Launching {} for new connection", label);
                            Worker::new(
                                tls_stream,
                                store,
                                RelayConfig::default(),
                                ConnectionDirection::Inbound,
                                label,
                                worker_signal,
                            )
                            .run()
                            .await;
                        },
                        Err(err) => {
                            warn!(
                                target: LOG_TARGET,
                                "TLS handshake with {} failed: {}", peer_addr, err
                            );
                        },
                    }
                });
            },
        }
    }
}

async fn dial(connector: &TlsConnector, address: &str) -> Result<client::TlsStream<TcpStream>> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("dialing {}", address))?;
    let host = address.rsplit_once(':').map(|(host, _)| host).unwrap_or(address);
    let server_name = rustls::ServerName::try_from(host)
        .with_context(|| format!("invalid server name '{}'", host))?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .with_context(|| format!("TLS handshake with {}", address))?;
    Ok(tls_stream)
}

/// Dial our own listener and run a raw version exchange over it, proving the
/// TLS and protocol plumbing end to end.
async fn selftest(port: u16) {
    sleep(Duration::from_secs(1)).await;
    info!(target: LOG_TARGET, "Launching test connection to verify basic functionality");
    let connector = tls::connector(true);
    let stream = match dial(&connector, &format!("127.0.0.1:{}", port)).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(target: LOG_TARGET, "Test dial failed: {:#}", err);
            return;
        },
    };

    let (read_half, mut write_half) = tokio::io::split(stream);
    if let Err(err) = write_half.write_all(b"version 0 0.0\n").await {
        warn!(target: LOG_TARGET, "Test connection write failed: {}", err);
        return;
    }
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line == "status 0 0" => {
                info!(target: LOG_TARGET, "Self test passed: listener accepted our version");
                break;
            },
            // the listener's own version request arrives interleaved
            Ok(Some(_)) => continue,
            Ok(None) => {
                warn!(target: LOG_TARGET, "Test connection closed before a status arrived");
                break;
            },
            Err(err) => {
                warn!(target: LOG_TARGET, "Test connection read failed: {}", err);
                break;
            },
        }
    }
    if let Err(err) = write_half.shutdown().await {
        debug!(target: LOG_TARGET, "Closing test connection failed: {}", err);
    }
}
