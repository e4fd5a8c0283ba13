//! UNIX socket listener
//!
//! Binds the broker's listening socket, refuses to start when another
//! broker is already reachable on the path, and accepts connections
//! until shutdown. The socket file is removed again on the way out.

use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::server::{connection, ServerConfig};

/// The message bus server
pub struct MsgqServer {
    config: ServerConfig,
    broker: Arc<Broker>,
}

impl MsgqServer {
    /// Create a server for the given broker and configuration
    pub fn new(config: ServerConfig, broker: Arc<Broker>) -> Self {
        Self { config, broker }
    }

    /// The configured socket path
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Run the server until shutdown is requested.
    ///
    /// Returns once the listening socket has been removed and every
    /// connection dropped. Startup failures (socket already in use,
    /// bind errors) are returned without touching a live peer's socket
    /// file.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        info!(path = %self.config.socket_path.display(), "Message bus listening");

        let mut shutdown = self.broker.shutdown_rx();
        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown signal received");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let broker = Arc::clone(&self.broker);
                        let config = self.config.clone();
                        tokio::spawn(connection::run(broker, stream, config));
                    }
                    Err(e) => {
                        error!(error = %e, "Unable to accept connections");
                        break Err(Error::Io(e));
                    }
                }
            }
        };

        // Stop accepting before the socket file goes away
        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            debug!(error = %e, "Unable to remove socket file");
        }
        // Wake the bootstrap waiter and every connection task, even
        // when we got here through an accept failure
        self.broker.shutdown();
        self.broker.close_all();
        result
    }

    /// Bind the listening socket.
    ///
    /// An existing socket file is probed first: a reachable peer means
    /// another broker instance owns the path and startup is refused; a
    /// dead file is removed and the path rebound.
    fn bind(&self) -> Result<UnixListener> {
        let path = &self.config.socket_path;
        if path.exists() {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(_) => return Err(Error::AlreadyRunning(path.clone())),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Removing stale socket file");
                    std::fs::remove_file(path)?;
                }
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        UnixListener::bind(path).map_err(|source| Error::Bind {
            path: path.clone(),
            source,
        })
    }
}
