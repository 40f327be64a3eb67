//! Transport Layer
//!
//! TCP accept loop. Every accepted stream gets its own connection task; all
//! tasks stop when the broker's shutdown signal fires.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::broker::{Broker, Connection};

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { tcp_nodelay: true }
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)
}

/// Accept connections on `listener` until the broker shuts down
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) -> std::io::Result<()> {
    serve_with(listener, broker, TransportConfig::default()).await
}

/// [`serve`] with explicit socket options
pub async fn serve_with(
    listener: TcpListener,
    broker: Arc<Broker>,
    config: TransportConfig,
) -> std::io::Result<()> {
    let mut shutdown_rx = broker.shutdown_signal();
    info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.recv() => {
                match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        if let Err(e) = configure_stream(&stream, &config) {
                            debug!("Failed to configure stream from {}: {}", addr, e);
                        }
                        spawn_connection(stream, addr, Arc::clone(&broker));
                    }
                    Err(e) => error!("Failed to accept TCP connection: {}", e),
                }
            }
        }
    }

    debug!("Accept loop stopped");
    Ok(())
}

/// Run one connection task, cut short by broker shutdown
fn spawn_connection(stream: TcpStream, addr: SocketAddr, broker: Arc<Broker>) {
    let mut shutdown_rx = broker.shutdown_signal();

    tokio::spawn(async move {
        let mut conn = Connection::new(stream, addr, broker);
        let conn_fut = conn.run();
        tokio::pin!(conn_fut);

        loop {
            tokio::select! {
                biased;

                result = &mut conn_fut => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", addr, e);
                    }
                    break;
                }
                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) | Err(RecvError::Closed) => {
                            debug!("Connection {} shutting down", addr);
                            break;
                        }
                        Err(RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    });
}
