// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopback listener handing connection info to service-mode workers.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::ApplicationState;

/// Writes the connection info blob to every connection accepted on
/// `127.0.0.1:<port>`, then closes it. Closed on drop.
#[derive(Debug)]
pub(super) struct CredentialsListener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CredentialsListener {
    /// Bind the port and start serving. A peer gets `write_timeout` to take
    /// the blob.
    pub(super) async fn bind(
        port: u16,
        state: Arc<ApplicationState>,
        write_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(serve(listener, state, shutdown.clone(), write_timeout));
        Ok(Self {
            addr,
            shutdown,
            task: Some(task),
        })
    }

    pub(super) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving. Returns once the port is released.
    pub(super) async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "credentials listener task failed");
        }
    }
}

impl Drop for CredentialsListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<ApplicationState>,
    shutdown: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => {
                let (mut socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "credentials listener accept failed");
                        continue;
                    }
                };
                debug!(%peer, "handing out connection info");
                let written = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => None,

                    written = tokio::time::timeout(write_timeout, state.write_conn_info(&mut socket)) => Some(written),
                };
                match written {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => warn!(%peer, error = %e, "failed to write connection info"),
                    Some(Err(_)) => warn!(%peer, "timed out writing connection info"),
                }
                let _ = socket.shutdown().await;
            }
        }
    }
    info!(token = %state.token(), "credentials listener closed");
}
