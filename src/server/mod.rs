//! Socket server: configuration, listener, and per-connection tasks

pub mod config;
pub(crate) mod connection;
pub mod listener;

pub use config::{default_socket_path, ServerConfig, DEFAULT_SOCKET_PATH, SOCKET_FILE_ENV};
pub use listener::MsgqServer;
