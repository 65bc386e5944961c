//! TCP accept loop

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::registry::{AdmissionError, ConnectionRegistry};
use crate::session::SessionContext;

/// How long shutdown waits for connections to settle their runs
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A bound listener and the state its connections share
pub struct Server {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    ctx: SessionContext,
}

impl Server {
    /// Bind the listener
    ///
    /// Sessions get `ctx` with the registry attached.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        ctx: SessionContext,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx: ctx.with_registry(registry.clone()),
            registry,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Then stops admitting, signals every live connection to close and
    /// waits (bounded) for them to settle their runs.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, _)) => self.accept(socket, &mut connections),
                    Err(e) => error!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let signalled = self.registry.close_all();
        info!(connections = signalled, "closing connections");

        let drained = timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("connections did not close in time");
            connections.shutdown().await;
        }
    }

    fn accept(&self, socket: TcpStream, connections: &mut JoinSet<()>) {
        let mut admitted = match self.registry.admit(socket.peer_addr()) {
            Ok(admitted) => admitted,
            Err(e @ AdmissionError::ShuttingDown) => {
                debug!(error = %e, "connection rejected");
                return;
            }
            Err(e) => {
                // Dropping the socket closes it
                info!(error = %e, "connection rejected");
                return;
            }
        };

        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "cannot set TCP_NODELAY");
        }

        let close = admitted.take_close_signal();
        let ctx = self.ctx.clone();
        let live = self.registry.connection_count();

        connections.spawn(async move {
            let peer = admitted.peer_addr();
            debug!(peer = ?peer, connection = %admitted.id(), live, "connection admitted");

            Connection::new(socket, peer, ctx).run(close).await;

            // Releases the connection slot
            drop(admitted);
        });
    }
}
