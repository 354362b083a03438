//! TCP listener and session dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::device::DeviceManager;
use crate::error::{is_transient, Result};
use crate::session::ClientSession;
use crate::shutdown::ShutdownSignal;

const LISTEN_BACKLOG: u32 = 128;

/// Accepts client connections and spawns a [`ClientSession`] for each.
pub struct TunnelServer {
    listener: TcpListener,
    manager: Arc<dyn DeviceManager>,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
}

impl TunnelServer {
    /// Bind the listening socket.
    ///
    /// SO_REUSEADDR is set before binding so a restart does not trip
    /// over sockets lingering in TIME_WAIT.
    pub fn bind(
        config: &ServerConfig,
        manager: Arc<dyn DeviceManager>,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let addr = config.listen_socket_addr()?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        info!("Listening on {}", addr);

        Ok(Self {
            listener,
            manager,
            shutdown,
            poll_interval: config.poll_interval(),
        })
    }

    /// Address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is requested.
    ///
    /// Sessions run on detached tasks; they observe the same shutdown
    /// signal and wind down on their own. A failed accept never stops
    /// the listener.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Stopping listener");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {}: {}", peer, e);
                        }
                        info!("Accepted connection from {}", peer);

                        let session = ClientSession::new(
                            stream,
                            peer,
                            Arc::clone(&self.manager),
                            self.shutdown.clone(),
                            self.poll_interval,
                        );
                        tokio::spawn(async move {
                            session.run().await;
                        });
                    }
                    Err(e) if is_transient(&e) => {}
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                },
            }
        }

        Ok(())
    }
}
