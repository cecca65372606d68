//! Redis-protocol front-end.
//!
//! One tokio task per connection. Each connection reads requests into a
//! buffer, answers every complete request it holds (so pipelined clients
//! are served in order) and flushes the replies before reading again.

mod handler;
mod resp;

pub use handler::{Command, Outcome, dispatch};
pub use resp::{ProtocolError, Reply, parse_request};

use crate::store::QueueStore;
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Connection-level failures. Logged, never sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A bound listener serving one [`QueueStore`].
pub struct Server {
    listener: TcpListener,
    store: QueueStore,
}

impl Server {
    /// Bind the listen socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs, store: QueueStore) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, store })
    }

    /// Address actually bound, useful with port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown signal cannot be installed.
    pub async fn run(self) -> io::Result<()> {
        let (signal_tx, signal_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal, stopping server..."),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
            let _ = signal_tx.send(());
        });
        self.run_until(async move {
            let _ = signal_rx.await;
        })
        .await
    }

    /// Serve until `shutdown` completes, then stop accepting, tell open
    /// connections to finish and wait for them.
    ///
    /// The store is left open; closing it is the caller's job.
    ///
    /// # Errors
    ///
    /// Currently infallible; accept failures are logged and retried.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Listening");
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let store = self.store.clone();
                        let shutdown_rx = shutdown_tx.subscribe();
                        connections.spawn(async move {
                            match handle_connection(stream, store, shutdown_rx).await {
                                Ok(()) => debug!(%peer, "Connection closed"),
                                Err(e) => debug!(%peer, error = %e, "Connection closed"),
                            }
                        });
                    },
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                // Reap finished connections so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => {},
                () = &mut shutdown => break,
            }
        }

        drop(self.listener);
        let _ = shutdown_tx.send(());
        let open = connections.len();
        if open > 0 {
            info!(connections = open, "Waiting for connections to finish");
        }
        while connections.join_next().await.is_some() {}
        info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    store: QueueStore,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let mut input = BytesMut::with_capacity(4096);
    let mut output = BytesMut::new();

    loop {
        loop {
            let args = match parse_request(&mut input) {
                Ok(Some(args)) => args,
                Ok(None) => break,
                Err(e) => {
                    Reply::err(format_args!("Protocol error: {e}")).encode(&mut output);
                    stream.write_all(&output).await?;
                    return Err(e.into());
                },
            };
            let outcome = dispatch(&store, args).await;
            outcome.reply.encode(&mut output);
            if outcome.close {
                stream.write_all(&output).await?;
                return Ok(());
            }
        }
        if !output.is_empty() {
            stream.write_all(&output).await?;
            output.clear();
        }

        tokio::select! {
            read = stream.read_buf(&mut input) => {
                if read? == 0 {
                    return Ok(());
                }
            },
            _ = shutdown.recv() => return Ok(()),
        }
    }
}
