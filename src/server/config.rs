//! Server configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::wire::MAX_FRAME_SIZE;

/// Default socket path under the local state directory
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/msgq/msgq_socket";

/// Environment variable overriding the socket path
pub const SOCKET_FILE_ENV: &str = "BUNDY_MSGQ_SOCKET_FILE";

/// Socket path from the environment, falling back to the default
pub fn default_socket_path() -> PathBuf {
    std::env::var_os(SOCKET_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the UNIX socket to listen on
    pub socket_path: PathBuf,

    /// How long a non-empty send buffer may go without progress before
    /// the connection is killed as a slow consumer
    pub stall_timeout: Duration,

    /// Maximum accepted frame size
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            stall_timeout: Duration::from_millis(100),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Create a config listening on the given path
    pub fn with_socket_path(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            ..Default::default()
        }
    }

    /// Set the socket path
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set the slow-consumer stall timeout
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Set the maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.min(MAX_FRAME_SIZE);
        self
    }
}
