//! mootd server - UDP adapter and periodic tasks
//!
//! The overlay core is single-threaded: every state mutation runs through
//! the dispatcher behind one mutex. The server is a thin shell that feeds
//! received datagrams in, drains the outgoing queue, and drives the sync
//! and trigger-expiry intervals.

use crate::config::{Config, OverlayParams};
use crate::dispatcher::Dispatcher;
use crate::member::MemberRegistry;
use crate::storage::Storage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("Member error: {0}")]
    Member(#[from] crate::member::MemberError),
    #[error("Community error: {0}")]
    Community(#[from] crate::community::CommunityError),
}

/// Server state
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let registry = Arc::new(MemberRegistry::new());
        registry.load(&storage)?;

        let dispatcher = Arc::new(Mutex::new(Dispatcher::new(
            storage.clone(),
            registry,
            OverlayParams::from(&config),
        )));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            storage,
            dispatcher,
            shutdown_tx,
        })
    }

    /// The dispatcher; the embedding application registers communities
    /// through it before (or while) the server runs.
    pub fn dispatcher(&self) -> Arc<Mutex<Dispatcher>> {
        self.dispatcher.clone()
    }

    /// The persistent store backing the dispatcher.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// Run the server until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let socket = UdpSocket::bind(self.config.listen).await?;
        info!("Listening on {}", self.config.listen);

        let mut sync_ticker = interval(Duration::from_secs(self.config.sync_interval_secs));
        let mut tick_ticker = interval(Duration::from_secs(self.config.tick_interval_secs));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buffer = vec![0u8; 65536];

        loop {
            self.transmit(&socket).await;

            tokio::select! {
                result = socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((length, address)) => {
                            debug!(%address, length, "datagram received");
                            let data = buffer[..length].to_vec();
                            if let Err(error) =
                                self.dispatcher.lock().on_incoming_packet(address, data)
                            {
                                warn!(%address, %error, "packet processing failed");
                            }
                        }
                        Err(error) => {
                            error!(%error, "recv error");
                        }
                    }
                }
                _ = sync_ticker.tick() => {
                    if let Err(error) = self.dispatcher.lock().periodic_sync() {
                        warn!(%error, "sync pass failed");
                    }
                }
                _ = tick_ticker.tick() => {
                    self.dispatcher.lock().tick();
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        self.transmit(&socket).await;
        self.storage.flush()?;
        Ok(())
    }

    async fn transmit(&self, socket: &UdpSocket) {
        let packets = self.dispatcher.lock().take_outgoing();
        for (address, packet) in packets {
            if let Err(error) = socket.send_to(&packet, address).await {
                warn!(%address, %error, "send failed");
            }
        }
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::parse_from(["mootd"]);
        config.listen = "127.0.0.1:0".parse().unwrap();
        config.data_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_server_creation() {
        let dir = tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).unwrap();
        assert_eq!(server.dispatcher().lock().dropped_packets(), 0);
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let dir = tempdir().unwrap();
        let server = Arc::new(Server::new(test_config(dir.path())).unwrap());
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
